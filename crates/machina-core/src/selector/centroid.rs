//! Centroid selector: embedding dot-product ranking over the menu.
//!
//! Each menu item contributes a seed string `aid|tag1|tag2…` (tags sorted);
//! the batch of seeds embeds into a row-major centroid matrix cached by
//! `(menu_digest, dim)`. The goal context embeds once per distinct string
//! (cached separately). Selection is the highest dot product, ties broken
//! by the lower SID. With warm caches the hot path does no I/O even when
//! the provider is subprocess-backed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::embedding::dot;
use super::{parse_selector_output, pick_wire, ControlMode, EmbeddingProvider, HashEmbedding, Selection, Selector};
use crate::menu::Menu;

const CENTROID_CACHE_CAP: usize = 128;
const GOAL_CACHE_CAP: usize = 256;

/// Default embedding dimension.
pub const DEFAULT_DIM: usize = 64;

#[derive(Debug, Clone)]
struct CentroidEntry {
    n: usize,
    // Row-major n x dim.
    centroids: Arc<Vec<f32>>,
}

/// Embedding-ranked selector with centroid and goal caches.
pub struct CentroidSelector {
    provider: Arc<dyn EmbeddingProvider>,
    dim: usize,
    centroid_cache: Mutex<HashMap<String, CentroidEntry>>,
    goal_cache: Mutex<HashMap<String, Arc<Vec<f32>>>>,
}

impl CentroidSelector {
    /// Creates a selector over the hash-fallback provider at the default
    /// dimension.
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(Arc::new(HashEmbedding), DEFAULT_DIM)
    }

    /// Creates a selector over an explicit provider. `dim` is clamped to
    /// `8..=2048`.
    #[must_use]
    pub fn with_provider(provider: Arc<dyn EmbeddingProvider>, dim: usize) -> Self {
        Self {
            provider,
            dim: dim.clamp(8, 2048),
            centroid_cache: Mutex::new(HashMap::new()),
            goal_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The embedding dimension in use.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    fn goal_vector(&self, goal_context: &str) -> Arc<Vec<f32>> {
        let key = format!("{goal_context}|dim={}", self.dim);
        let mut cache = self.goal_cache.lock().expect("goal cache lock");
        if cache.len() > GOAL_CACHE_CAP {
            cache.clear();
        }
        if let Some(v) = cache.get(&key) {
            return Arc::clone(v);
        }
        let mut v = self.provider.embed(goal_context, self.dim);
        if v.len() != self.dim {
            v = super::hash_embedding(goal_context, self.dim);
        }
        super::l2_normalize(&mut v);
        let v = Arc::new(v);
        cache.insert(key, Arc::clone(&v));
        v
    }

    fn centroids_for(&self, menu: &Menu) -> CentroidEntry {
        let key = format!("{}|dim={}", menu.digest(), self.dim);
        {
            let mut cache = self.centroid_cache.lock().expect("centroid cache lock");
            if cache.len() > CENTROID_CACHE_CAP {
                // Evict one arbitrary entry rather than clearing everything:
                // a full clear would rebuild every live menu at once.
                if let Some(victim) = cache.keys().next().cloned() {
                    cache.remove(&victim);
                }
            }
            if let Some(entry) = cache.get(&key) {
                return entry.clone();
            }
        }

        let seeds: Vec<String> = menu
            .items
            .iter()
            .map(|item| {
                let mut tags = item.tags.clone();
                tags.sort();
                let mut seed = item.aid.clone();
                for t in tags {
                    seed.push('|');
                    seed.push_str(&t);
                }
                seed
            })
            .collect();

        let results = self.provider.embed_batch(&seeds, self.dim);
        let mut matrix = vec![0.0f32; menu.len() * self.dim];
        for (i, seed) in seeds.iter().enumerate() {
            let mut v = match results.get(i) {
                Some(v) if v.len() == self.dim => v.clone(),
                _ => super::hash_embedding(seed, self.dim),
            };
            super::l2_normalize(&mut v);
            matrix[i * self.dim..(i + 1) * self.dim].copy_from_slice(&v);
        }

        let entry = CentroidEntry {
            n: menu.len(),
            centroids: Arc::new(matrix),
        };
        self.centroid_cache
            .lock()
            .expect("centroid cache lock")
            .insert(key, entry.clone());
        entry
    }
}

impl Default for CentroidSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for CentroidSelector {
    fn select(
        &mut self,
        menu: &Menu,
        goal_context: &str,
        _state_digest: &str,
        _mode: ControlMode,
        _inputs_json: &str,
    ) -> Selection {
        if menu.is_empty() {
            return parse_selector_output("<NOOP><END>");
        }

        let goal = self.goal_vector(goal_context);
        let entry = self.centroids_for(menu);
        if entry.n == 0 {
            return parse_selector_output("<NOOP><END>");
        }

        let mut best_score = f32::NEG_INFINITY;
        let mut best_sid = menu.items[0].sid;
        for (i, item) in menu.items.iter().enumerate() {
            let row = &entry.centroids[i * self.dim..(i + 1) * self.dim];
            let score = dot(&goal, row);
            if score > best_score || (score == best_score && item.sid < best_sid) {
                best_score = score;
                best_sid = item.sid;
            }
        }
        parse_selector_output(&pick_wire(best_sid))
    }
}
