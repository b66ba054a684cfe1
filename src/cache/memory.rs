//! Sharded in-memory TTL cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{fnv1a64, namespaced_key, Cache, CacheError};

const DEFAULT_ENTRY_MAX_AGE: Duration = Duration::from_secs(15 * 60);
const DEFAULT_BUCKETS: usize = 64;
const DEFAULT_BUCKET_CAPACITY_MB: usize = 1;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 60);

// Rough per-entry size assumed when pre-sizing a shard's table.
const ESTIMATED_ENTRY_SIZE: usize = 512;

/// Configuration of the in-memory cache. The hard total capacity is
/// `bucket_capacity_mb * buckets` MiB.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Key prefix separating tenants of a shared cache.
    pub namespace: String,
    /// Maximum lifetime of each entry, 15 minutes when zero.
    pub entry_max_age: Duration,
    /// Evict an expired entry at next peeking instead of running the
    /// background sweep.
    pub lazy_entry_eviction: bool,
    /// Bucket count, must be a power of two, 64 when zero.
    pub buckets: usize,
    /// Maximum MiB of each bucket, 1 when zero.
    pub bucket_capacity_mb: usize,
    /// Start each bucket at a quarter of its estimated table size and grow
    /// on demand.
    pub lazy_bucket_capacity_scale: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            entry_max_age: DEFAULT_ENTRY_MAX_AGE,
            lazy_entry_eviction: false,
            buckets: DEFAULT_BUCKETS,
            bucket_capacity_mb: DEFAULT_BUCKET_CAPACITY_MB,
            lazy_bucket_capacity_scale: false,
        }
    }
}

struct Entry {
    data: Vec<u8>,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    // Insertion order; stale (seq, key) pairs left behind by overwrites and
    // deletes are skipped during eviction.
    order: VecDeque<(u64, String)>,
    used: usize,
    next_seq: u64,
}

impl Shard {
    fn with_capacity(entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(entries),
            order: VecDeque::with_capacity(entries),
            ..Self::default()
        }
    }

    fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.remove(key)?;
        self.used -= entry.data.len();
        Some(entry.data)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.entries.get(&key).is_some_and(|entry| entry.seq == seq) {
                self.remove(&key);
                return Some(key);
            }
        }
        None
    }
}

pub struct MemoryCache {
    shards: Arc<Vec<Mutex<Shard>>>,
    mask: u64,
    namespace: String,
    entry_max_age: Duration,
    lazy_evict: bool,
    shard_capacity: usize,
    sweeper: CancellationToken,
}

impl MemoryCache {
    pub fn new(cfg: MemoryConfig) -> Result<Self> {
        let entry_max_age = if cfg.entry_max_age.is_zero() {
            DEFAULT_ENTRY_MAX_AGE
        } else {
            cfg.entry_max_age
        };
        let buckets = if cfg.buckets == 0 { DEFAULT_BUCKETS } else { cfg.buckets };
        ensure!(buckets.is_power_of_two(), "invalid buckets: not a power of two");

        let bucket_capacity_mb = if cfg.bucket_capacity_mb == 0 {
            DEFAULT_BUCKET_CAPACITY_MB
        } else {
            cfg.bucket_capacity_mb
        };
        let shard_capacity = bucket_capacity_mb << 20;

        let mut estimated_entries = shard_capacity / ESTIMATED_ENTRY_SIZE;
        if cfg.lazy_bucket_capacity_scale {
            estimated_entries >>= 2;
        }

        let shards = Arc::new(
            (0..buckets)
                .map(|_| Mutex::new(Shard::with_capacity(estimated_entries)))
                .collect::<Vec<_>>(),
        );

        let cache = Self {
            shards,
            mask: buckets as u64 - 1,
            namespace: cfg.namespace.trim().to_string(),
            entry_max_age,
            lazy_evict: cfg.lazy_entry_eviction,
            shard_capacity,
            sweeper: CancellationToken::new(),
        };

        if !cfg.lazy_entry_eviction {
            cache.spawn_sweeper();
        }

        Ok(cache)
    }

    fn shard(&self, wrapped_key: &str) -> &Mutex<Shard> {
        let index = (fnv1a64(wrapped_key.as_bytes()) & self.mask) as usize;
        &self.shards[index]
    }

    fn wrap_key(&self, key: &str) -> String {
        namespaced_key(&self.namespace, key)
    }

    fn spawn_sweeper(&self) {
        let token = self.sweeper.clone();
        let shards = Arc::clone(&self.shards);
        let entry_max_age = self.entry_max_age;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for shard in shards.iter() {
                            let mut shard = shard.lock();

                            let expired: Vec<String> = shard
                                .entries
                                .iter()
                                .filter(|(_, entry)| entry.inserted_at.elapsed() >= entry_max_age)
                                .map(|(key, _)| key.clone())
                                .collect();

                            for key in expired {
                                shard.remove(&key);
                                debug!(key = %key, "evicted: expired");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set(&self, key: &str, entry: &[u8]) -> Result<(), CacheError> {
        if entry.len() > self.shard_capacity {
            return Err(CacheError::EntryTooBig);
        }

        let wrapped = self.wrap_key(key);
        let mut shard = self.shard(&wrapped).lock();

        let seq = shard.next_seq;
        shard.next_seq += 1;

        if let Some(old) = shard.entries.insert(
            wrapped.clone(),
            Entry {
                data: entry.to_vec(),
                inserted_at: Instant::now(),
                seq,
            },
        ) {
            shard.used -= old.data.len();
        }

        shard.order.push_back((seq, wrapped));
        shard.used += entry.len();

        while shard.used > self.shard_capacity {
            match shard.evict_oldest() {
                Some(evicted) => debug!(key = %evicted, "evicted: nospace"),
                None => break,
            }
        }

        debug!(key, size = entry.len(), "set");

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let wrapped = self.wrap_key(key);
        let mut shard = self.shard(&wrapped).lock();

        match shard.remove(&wrapped) {
            Some(data) => {
                debug!(key, size = data.len(), "deleted");
                Ok(data)
            }
            None => Err(CacheError::EntryNotFound),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let wrapped = self.wrap_key(key);
        let mut shard = self.shard(&wrapped).lock();

        let expired = match shard.entries.get(&wrapped) {
            Some(entry) => entry.inserted_at.elapsed() >= self.entry_max_age,
            None => {
                debug!(key, "missed");
                return Err(CacheError::EntryNotFound);
            }
        };

        if expired {
            if self.lazy_evict {
                shard.remove(&wrapped);
            }

            debug!(key, "missed");

            return Err(CacheError::EntryNotFound);
        }

        let data = shard.entries[&wrapped].data.clone();
        debug!(key, size = data.len(), "hit");

        Ok(data)
    }

    async fn close(&self) {
        self.sweeper.cancel();
    }
}
