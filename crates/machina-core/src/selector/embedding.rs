//! Embedding support for the centroid selector.
//!
//! The [`EmbeddingProvider`] trait is the seam for external embedding
//! backends; [`HashEmbedding`] is the always-available deterministic
//! fallback that expands a SHA-256 of the text into a unit vector. It has no
//! semantic signal but is stable across processes, which is what the
//! centroid selector's determinism tests rely on.

/// Produces fixed-dimension embeddings for text.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds one text into a `dim`-sized vector (not necessarily
    /// normalized).
    fn embed(&self, text: &str, dim: usize) -> Vec<f32>;

    /// Embeds a batch; the default maps [`Self::embed`] over the inputs.
    /// Subprocess-backed providers override this to amortize the round trip.
    fn embed_batch(&self, texts: &[String], dim: usize) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t, dim)).collect()
    }
}

/// Deterministic hash-based embedding fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashEmbedding;

impl EmbeddingProvider for HashEmbedding {
    fn embed(&self, text: &str, dim: usize) -> Vec<f32> {
        hash_embedding(text, dim)
    }
}

/// Expands a SHA-256 hash stream of `text` into `dim` floats in `[-1, 1]`,
/// L2-normalized. Avoids platform RNG entirely to keep determinism tight.
#[must_use]
pub fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }
    let hex = crate::hash::sha256_hex(text.as_bytes());
    let bytes = hex.as_bytes();

    let mut v = vec![0.0f32; dim];
    let chunks = dim.div_ceil(2);
    for i in 0..chunks {
        // Walk 16-hex-char (64-bit) windows over the digest, wrapping.
        let off = (i * 16) % (bytes.len() - 16);
        let window = &hex[off..off + 16];
        let x = u64::from_str_radix(window, 16).unwrap_or(0);

        let lo = (x & 0xffff_ffff) as u32;
        let hi = (x >> 32) as u32;
        let to_f = |u: u32| -> f32 {
            let d = f64::from(u) / f64::from(u32::MAX);
            (d * 2.0 - 1.0) as f32
        };
        let idx = i * 2;
        if idx < dim {
            v[idx] = to_f(lo);
        }
        if idx + 1 < dim {
            v[idx + 1] = to_f(hi);
        }
    }
    l2_normalize(&mut v);
    v
}

/// Normalizes `v` to unit length in place; a zero vector is left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|f| f64::from(*f) * f64::from(*f)).sum();
    if sum > 0.0 {
        let inv = 1.0 / sum.sqrt();
        for f in v {
            *f = (f64::from(*f) * inv) as f32;
        }
    }
}

/// Dot product in f64 accumulation.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum::<f64>() as f32
}
