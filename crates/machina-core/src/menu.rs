//! Menu assembly: the per-step SID→AID binding offered to selectors.
//!
//! SIDs are assigned deterministically (1, 2, 3, …) over the registry's
//! sorted query result, with the NOOP tool appended last when registered.
//! Assignment stops at the four-digit wire cap ([`MAX_WIRE_SID`]); tools
//! past it are dropped from the menu rather than handed an SID no selector
//! output could ever name. Because the fallback and policy selectors run
//! against the same menu within a step, the SID→AID mapping is stable
//! across selector calls.
//!
//! The digest covers only `(sid, aid, sorted tags)` per item, so cosmetic
//! name changes do not perturb loop detection or journaled digests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::Registry;
use crate::types::{Aid, Sid, MAX_WIRE_SID, NOOP_AID};

/// One selectable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    /// Per-menu short id.
    pub sid: Sid,
    /// Stable tool id.
    pub aid: Aid,
    /// Human-readable name.
    pub name: String,
    /// Tool tags.
    pub tags: Vec<String>,
}

/// An ordered menu with a SID index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Menu {
    /// Items in SID order.
    pub items: Vec<MenuItem>,
    index: HashMap<u16, usize>,
}

impl Menu {
    /// Builds a menu from explicit items (index rebuilt).
    #[must_use]
    pub fn from_items(items: Vec<MenuItem>) -> Self {
        let mut menu = Self {
            items,
            index: HashMap::new(),
        };
        menu.rebuild_index();
        menu
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.sid.0, pos))
            .collect();
    }

    /// Resolves a SID to its item.
    #[must_use]
    pub fn resolve(&self, sid: Sid) -> Option<&MenuItem> {
        self.index.get(&sid.0).map(|pos| &self.items[*pos])
    }

    /// Whether any item carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.items.iter().any(|i| i.tags.iter().any(|t| t == tag))
    }

    /// The lowest-SID item carrying `tag`, skipping the NOOP tool.
    #[must_use]
    pub fn first_with_tag(&self, tag: &str) -> Option<&MenuItem> {
        self.items
            .iter()
            .filter(|i| i.aid != NOOP_AID && i.tags.iter().any(|t| t == tag))
            .min_by_key(|i| i.sid)
    }

    /// The first item with `aid`, skipping the NOOP tool.
    #[must_use]
    pub fn first_with_aid(&self, aid: &str) -> Option<&MenuItem> {
        self.items.iter().find(|i| i.aid != NOOP_AID && i.aid == aid)
    }

    /// Deterministic canonical representation:
    /// `SID0001=<aid>:<sorted,tags>|SID0002=…`.
    #[must_use]
    pub fn digest_raw(&self) -> String {
        let mut items: Vec<&MenuItem> = self.items.iter().collect();
        items.sort_by_key(|i| i.sid);
        items
            .iter()
            .map(|i| {
                let mut tags = i.tags.clone();
                tags.sort();
                format!("{}={}:{}", i.sid.to_wire(), i.aid, tags.join(","))
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    /// SHA-256 of [`Self::digest_raw`].
    #[must_use]
    pub fn digest(&self) -> String {
        crate::hash::sha256_hex(self.digest_raw().as_bytes())
    }

    /// FNV-1a 64 of [`Self::digest_raw`], for loop detection.
    #[must_use]
    pub fn digest_fast(&self) -> String {
        crate::hash::hex64(crate::hash::fnv1a64(self.digest_raw().as_bytes()))
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the menu has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Builds a menu from the registry for the given tag query: SIDs 1..N over
/// the sorted result, NOOP appended last when registered. Assignment stops
/// below [`MAX_WIRE_SID`] so the NOOP terminator always fits the wire form.
#[must_use]
pub fn build_menu(registry: &Registry, tags: &[String]) -> Menu {
    let mut items = Vec::new();
    let mut next_sid = 1u16;
    let mut dropped = 0usize;
    for desc in registry.query_by_tags(tags) {
        if desc.aid == NOOP_AID {
            continue;
        }
        if next_sid >= MAX_WIRE_SID {
            dropped += 1;
            continue;
        }
        items.push(MenuItem {
            sid: Sid(next_sid),
            aid: desc.aid,
            name: desc.name,
            tags: desc.tags,
        });
        next_sid += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, "menu truncated at the 4-digit SID cap");
    }
    if let Some(noop) = registry.get(NOOP_AID) {
        items.push(MenuItem {
            sid: Sid(next_sid),
            aid: noop.aid.clone(),
            name: noop.name.clone(),
            tags: noop.tags.clone(),
        });
    }
    Menu::from_items(items)
}

/// A capability pattern: an exact AID or a `PREFIX*` glob.
fn aid_matches(aid: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => aid.starts_with(prefix),
        None => aid == pattern,
    }
}

/// Applies per-request capability restrictions. A blocked match always
/// excludes; a non-empty allow list restricts to matches. SIDs are
/// preserved from the input menu so selector picks stay resolvable against
/// what the journal recorded.
#[must_use]
pub fn filter_by_capabilities(menu: &Menu, allowed: &[String], blocked: &[String]) -> Menu {
    let items: Vec<MenuItem> = menu
        .items
        .iter()
        .filter(|i| {
            if blocked.iter().any(|p| aid_matches(&i.aid, p)) {
                return false;
            }
            allowed.is_empty() || allowed.iter().any(|p| aid_matches(&i.aid, p))
        })
        .cloned()
        .collect();
    let filtered = menu.len() - items.len();
    if filtered > 0 {
        tracing::debug!(filtered, "capability filter removed menu items");
    }
    Menu::from_items(items)
}
