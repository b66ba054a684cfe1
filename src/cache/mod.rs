//! Token cache back-ends.
//!
//! The daemon fronts an in-memory cache with the single-flight wrapper;
//! one-shot invocations use the filesystem cache directly.

mod file;
mod memory;
mod single_flight;

pub use file::{FileCache, FileConfig};
pub use memory::{MemoryCache, MemoryConfig};
pub use single_flight::SingleFlightCache;

use async_trait::async_trait;
use thiserror::Error;

/// The closed error set of the cache boundary. Back-ends translate their
/// native failures into this before returning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("entry is not found")]
    EntryNotFound,
    #[error("entry is too big")]
    EntryTooBig,
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            CacheError::EntryNotFound
        } else {
            CacheError::Other(err.to_string())
        }
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &'static str;

    /// Saves the entry under the given key, failing with
    /// [`CacheError::EntryTooBig`] when the entry exceeds the back-end's
    /// per-entry capacity.
    async fn set(&self, key: &str, entry: &[u8]) -> Result<(), CacheError>;

    /// Removes the given key, returning the prior entry.
    async fn delete(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Reads the entry for the given key, failing with
    /// [`CacheError::EntryNotFound`] when no live entry exists.
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    async fn close(&self);
}

/// Prefixes a key with the cache namespace, `/<namespace>/<key>`.
fn namespaced_key(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        format!("/{key}")
    } else {
        format!("/{namespace}/{key}")
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// 64-bit FNV-1a. The filesystem layout depends on this exact function, so
/// it is fixed here rather than delegated to the std hasher.
fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn namespaced_keys() {
        assert_eq!(namespaced_key("aws", "k"), "/aws/k");
        assert_eq!(namespaced_key("", "k"), "/k");
    }
}
