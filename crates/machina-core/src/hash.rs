//! Digest primitives shared across the crate.
//!
//! Two hash families with distinct jobs:
//!
//! - **FNV-1a 64** - stable, non-cryptographic. Used for loop-detection
//!   digests and file fingerprints where speed matters and adversarial
//!   collisions do not.
//! - **SHA-256** - cryptographic. Used for the journal hash chain, workspace
//!   and menu digests, and plugin hash verification.
//!
//! Secret-bearing comparisons (lease token ids, plugin hashes) must go
//! through [`constant_time_eq`] rather than `==`.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64 over a byte slice.
#[must_use]
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in data {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Renders a 64-bit value as 16 lowercase hex characters.
#[must_use]
pub fn hex64(v: u64) -> String {
    format!("{v:016x}")
}

/// SHA-256 over a byte slice, returned as 64 lowercase hex characters.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 over a file's contents.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be opened or read.
pub fn sha256_hex_file(path: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming FNV-1a 64 fingerprint of a file, rendered as
/// `fnv1a64:<16 hex>`. Used for replay-input fences.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be opened or read.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut h = FNV_OFFSET;
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            h ^= u64::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
    }
    Ok(format!("fnv1a64:{}", hex64(h)))
}

/// Constant-time equality over two strings.
///
/// Length is not secret; unequal lengths return false immediately. Equal
/// lengths are compared without early exit.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
