//! Cache Keys
//!
//! 256-bit content hashes. Keys are bit-stable across machines and
//! endianness: they are derived from explicitly ordered byte streams,
//! never from in-memory layout.

use serde::{Deserialize, Serialize};

/// Blake3 hash of a byte payload, used for source content ids and value
/// integrity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash raw content bytes
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Content-addressed cache key
///
/// Derived from a namespace bucket plus a serialized payload, so that
/// identical payloads in different buckets never collide. Two textures
/// with identical settings, source content, and build-graph shape produce
/// identical keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive a key from a namespace bucket and a serialized payload
    pub fn namespaced(bucket: &str, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(bucket.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(payload);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
