//! Bucketed filesystem cache.
//!
//! Entries live at `<root>/<bucket>/<namespace>/<key>` with the file mtime
//! recording the insertion instant. The tree is shared between concurrent
//! processes without locking; tokens are recomputable, so torn writes are
//! tolerated.

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{fnv1a64, namespaced_key, Cache, CacheError};
use crate::consts;

const DEFAULT_ENTRY_MAX_AGE: Duration = Duration::from_secs(15 * 60);
const DEFAULT_BUCKETS: u64 = 12;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 60);

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Key prefix separating tenants of a shared cache.
    pub namespace: String,
    /// Maximum lifetime of each entry, 15 minutes when zero.
    pub entry_max_age: Duration,
    /// Evict an expired entry at next peeking instead of running the
    /// background sweep.
    pub lazy_entry_eviction: bool,
    /// Bucket directory count, 12 when zero.
    pub buckets: u64,
    /// Data directory, `consts::data_dir()` when unset.
    pub dir: Option<PathBuf>,
}

pub struct FileCache {
    root: PathBuf,
    namespace: String,
    buckets: u64,
    expiration: Duration,
    lazy_evict: bool,
    sweeper: CancellationToken,
}

impl FileCache {
    pub fn new(cfg: FileConfig) -> Result<Self> {
        let expiration = if cfg.entry_max_age.is_zero() {
            DEFAULT_ENTRY_MAX_AGE
        } else {
            cfg.entry_max_age
        };
        let buckets = if cfg.buckets == 0 { DEFAULT_BUCKETS } else { cfg.buckets };
        let root = cfg.dir.unwrap_or_else(consts::data_dir);

        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&root)
            .context("error creating data dir")?;

        for bucket in 0..buckets {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(root.join(bucket.to_string()))
                .context("error creating bucket dir")?;
        }

        let cache = Self {
            root,
            namespace: cfg.namespace.trim().to_string(),
            buckets,
            expiration,
            lazy_evict: cfg.lazy_entry_eviction,
            sweeper: CancellationToken::new(),
        };

        if !cfg.lazy_entry_eviction {
            cache.spawn_sweeper();
        }

        Ok(cache)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let wrapped = namespaced_key(&self.namespace, key);
        let bucket = fnv1a64(wrapped.as_bytes()) % self.buckets;

        self.root
            .join(bucket.to_string())
            .join(wrapped.trim_start_matches('/'))
    }

    fn spawn_sweeper(&self) {
        let token = self.sweeper.clone();
        let root = self.root.clone();
        let expiration = self.expiration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cutoff) = SystemTime::now().checked_sub(expiration) else {
                            continue;
                        };

                        for file in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                            if !file.file_type().is_file() {
                                continue;
                            }

                            let expired = file
                                .metadata()
                                .ok()
                                .and_then(|metadata| metadata.modified().ok())
                                .is_some_and(|modified| modified < cutoff);

                            if expired {
                                if let Err(err) = std::fs::remove_file(file.path()) {
                                    if err.kind() != std::io::ErrorKind::NotFound {
                                        warn!(
                                            path = %file.path().display(),
                                            error = %err,
                                            "error evicting expired entry",
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Cache for FileCache {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn set(&self, key: &str, entry: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(key);

        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)?;
        file.write_all(entry)?;

        debug!(key, size = entry.len(), "set");

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.entry_path(key);
        let entry = std::fs::read(&path)?;

        if self.lazy_evict {
            std::fs::remove_file(&path)?;
        } else {
            // Back-date the mtime so reads report missing until the
            // sweeper collects the file.
            let file = OpenOptions::new().write(true).open(&path)?;
            if let Some(stale) = SystemTime::now().checked_sub(self.expiration) {
                file.set_modified(stale)?;
            }
        }

        debug!(key, size = entry.len(), "deleted");

        Ok(entry)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.entry_path(key);

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    debug!(key, "missed");
                }
                return Err(err.into());
            }
        };

        let modified = metadata.modified().map_err(CacheError::from)?;
        if modified + self.expiration < SystemTime::now() {
            if self.lazy_evict {
                let _ = std::fs::remove_file(&path);
            }

            debug!(key, "missed");

            return Err(CacheError::EntryNotFound);
        }

        let entry = std::fs::read(&path)?;
        debug!(key, size = entry.len(), "hit");

        Ok(entry)
    }

    async fn close(&self) {
        self.sweeper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_cache(dir: &TempDir, lazy: bool) -> FileCache {
        FileCache::new(FileConfig {
            namespace: "aws".to_string(),
            lazy_entry_eviction: lazy,
            dir: Some(dir.path().to_path_buf()),
            ..FileConfig::default()
        })
        .unwrap()
    }

    fn back_date(cache: &FileCache, key: &str, age: Duration) {
        let file = OpenOptions::new()
            .write(true)
            .open(cache.entry_path(key))
            .unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn set_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir, true);

        cache.set("aws_AKIA_us-east-1_c1_self", b"entry").await.unwrap();
        assert_eq!(
            cache.get("aws_AKIA_us-east-1_c1_self").await.unwrap(),
            b"entry"
        );

        assert_eq!(cache.get("absent").await, Err(CacheError::EntryNotFound));
    }

    #[tokio::test]
    async fn entries_land_in_their_hash_bucket() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir, true);

        let key = "aws_AKIA_us-east-1_c1_self";
        cache.set(key, b"entry").await.unwrap();

        let bucket = fnv1a64(format!("/aws/{key}").as_bytes()) % DEFAULT_BUCKETS;
        let path = dir
            .path()
            .join(bucket.to_string())
            .join("aws")
            .join(key);
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn keys_with_separators_nest() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir, true);

        let key = "aws_AKIA_us-east-1_c1_arn:aws:iam::123456789012:role/admin";
        cache.set(key, b"entry").await.unwrap();
        assert_eq!(cache.get(key).await.unwrap(), b"entry");
    }

    #[tokio::test]
    async fn expired_entries_report_missing() {
        for lazy in [true, false] {
            let dir = TempDir::new().unwrap();
            let cache = new_cache(&dir, lazy);

            cache.set("k", b"entry").await.unwrap();
            back_date(&cache, "k", DEFAULT_ENTRY_MAX_AGE + Duration::from_secs(1));

            assert_eq!(cache.get("k").await, Err(CacheError::EntryNotFound));
            if lazy {
                assert!(!cache.entry_path("k").exists());
            }

            cache.close().await;
        }
    }

    #[tokio::test]
    async fn delete_returns_prior() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir, true);

        cache.set("k", b"prior").await.unwrap();
        assert_eq!(cache.delete("k").await.unwrap(), b"prior");
        assert!(!cache.entry_path("k").exists());
        assert_eq!(cache.delete("k").await, Err(CacheError::EntryNotFound));
    }

    #[tokio::test]
    async fn non_lazy_delete_back_dates() {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir, false);

        cache.set("k", b"prior").await.unwrap();
        assert_eq!(cache.delete("k").await.unwrap(), b"prior");

        // The file is left for the sweeper, but reads already miss.
        assert!(cache.entry_path("k").exists());
        assert_eq!(cache.get("k").await, Err(CacheError::EntryNotFound));

        cache.close().await;
    }
}
