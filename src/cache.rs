//! Read-through object cache for the serving path
//!
//! Buffers whole objects from the `ContentStore` in a `DashMap`. Every `get`
//! stats the backing file, and a changed size or modification time forces a
//! re-read, so a replaced object is never served stale.
//!
//! A sweep running on its own cadence drops entries idle for longer than
//! `idle_ttl`, then evicts in insertion order while the byte total exceeds
//! `max_bytes`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::NodeError;
use crate::shutdown;
use crate::storage::ContentStore;

struct CacheEntry {
    buffer: Bytes,
    file_size: u64,
    modified_at: Option<SystemTime>,
    last_access: Instant,
    /// Insertion order for the size-ceiling pass
    seq: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub reloads: u64,
    pub evictions: u64,
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: usize,
    pub evicted: usize,
}

pub struct ObjectCache {
    store: Arc<ContentStore>,
    entries: DashMap<String, CacheEntry>,
    total_bytes: AtomicU64,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    reloads: AtomicU64,
    evictions: AtomicU64,
    idle_ttl: Duration,
    max_bytes: u64,
}

impl ObjectCache {
    pub fn new(store: Arc<ContentStore>, config: &CacheConfig) -> Self {
        info!(
            idle_ttl_secs = config.idle_ttl_secs,
            max_mb = config.max_bytes / (1024 * 1024),
            "Object cache initialized"
        );
        Self {
            store,
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            max_bytes: config.max_bytes,
        }
    }

    /// Object bytes, reading from the store when uncached or changed.
    ///
    /// Fails with `NotFound` when the store has no such object.
    pub async fn get(&self, hash: &str) -> Result<Bytes, NodeError> {
        let path = self.store.object_path(hash)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(NodeError::NotFound(hash.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.forget(hash);
                return Err(NodeError::NotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_size = meta.len();
        let modified_at = meta.modified().ok();

        // Guard dropped before any await below
        if let Some(mut entry) = self.entries.get_mut(hash) {
            if entry.file_size == file_size && entry.modified_at == modified_at {
                entry.last_access = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.buffer.clone());
            }
            self.reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let mut file = self.store.open(hash).await?;
        let mut data = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut data).await?;
        let buffer = Bytes::from(data);

        let entry = CacheEntry {
            buffer: buffer.clone(),
            file_size: buffer.len() as u64,
            modified_at,
            last_access: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let added = entry.buffer.len() as u64;
        // Counted before the entry is visible to a concurrent sweep
        self.total_bytes.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = self.entries.insert(hash.to_string(), entry) {
            self.total_bytes
                .fetch_sub(old.buffer.len() as u64, Ordering::Relaxed);
        }

        debug!(hash = %hash, size = added, "Cached object");
        Ok(buffer)
    }

    /// Whether `hash` currently has a cached buffer
    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    fn forget(&self, hash: &str) {
        if let Some((_, old)) = self.entries.remove(hash) {
            self.total_bytes
                .fetch_sub(old.buffer.len() as u64, Ordering::Relaxed);
        }
    }

    /// Drop idle entries, then enforce the byte ceiling
    pub fn sweep(&self) -> SweepOutcome {
        let now = Instant::now();

        let idle: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_access) > self.idle_ttl)
            .map(|e| e.key().clone())
            .collect();
        let mut expired = 0;
        for key in &idle {
            // Re-check under the shard lock; a reader may have touched it
            if let Some((_, old)) = self
                .entries
                .remove_if(key, |_, e| now.saturating_duration_since(e.last_access) > self.idle_ttl)
            {
                self.total_bytes
                    .fetch_sub(old.buffer.len() as u64, Ordering::Relaxed);
                expired += 1;
            }
        }

        let mut evicted = 0;
        if self.total_bytes.load(Ordering::Relaxed) > self.max_bytes {
            let mut by_age: Vec<(String, u64)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.seq))
                .collect();
            by_age.sort_by_key(|(_, seq)| *seq);

            for (key, _) in by_age {
                if self.total_bytes.load(Ordering::Relaxed) <= self.max_bytes {
                    break;
                }
                if let Some((_, old)) = self.entries.remove(&key) {
                    self.total_bytes
                        .fetch_sub(old.buffer.len() as u64, Ordering::Relaxed);
                    evicted += 1;
                }
            }
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }

        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, "Cache sweep");
        }
        SweepOutcome { expired, evicted }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Run `sweep` every `interval` until shutdown
pub fn spawn_sweep_task(
    cache: Arc<ObjectCache>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Cache sweep task started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cache.sweep();
                }
                _ = shutdown::wait_for(&mut stop) => {
                    debug!("Cache sweep task stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    async fn setup(config: CacheConfig) -> (TempDir, Arc<ContentStore>, ObjectCache) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let cache = ObjectCache::new(Arc::clone(&store), &config);
        (dir, store, cache)
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let (_dir, store, cache) = setup(CacheConfig::default()).await;
        store.write(ABC_MD5, b"abc").await.unwrap();

        assert_eq!(cache.get(ABC_MD5).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(cache.get(ABC_MD5).await.unwrap(), Bytes::from_static(b"abc"));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.total_bytes, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_total_bytes_never_wraps_under_concurrent_sweep() {
        let config = CacheConfig {
            max_bytes: 0,
            ..CacheConfig::default()
        };
        let (_dir, store, cache) = setup(config).await;
        store.write(ABC_MD5, b"abc").await.unwrap();
        let cache = Arc::new(cache);

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    cache.get(ABC_MD5).await.unwrap();
                }
            }));
        }
        let sweeper = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..5000 {
                    cache.sweep();
                    assert!(cache.stats().total_bytes <= 64, "byte counter wrapped");
                    tokio::task::yield_now().await;
                }
            })
        };

        for reader in readers {
            reader.await.unwrap();
        }
        sweeper.await.unwrap();

        cache.sweep();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, _store, cache) = setup(CacheConfig::default()).await;
        assert!(matches!(
            cache.get(ABC_MD5).await,
            Err(NodeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_removed_object_is_forgotten() {
        let (_dir, store, cache) = setup(CacheConfig::default()).await;
        store.write(ABC_MD5, b"abc").await.unwrap();
        cache.get(ABC_MD5).await.unwrap();

        store.remove(ABC_MD5).await.unwrap();
        assert!(cache.get(ABC_MD5).await.is_err());
        assert!(!cache.contains(ABC_MD5));
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_entries() {
        let config = CacheConfig {
            idle_ttl_secs: 0,
            ..Default::default()
        };
        let (_dir, store, cache) = setup(config).await;
        store.write(ABC_MD5, b"abc").await.unwrap();
        cache.get(ABC_MD5).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = cache.sweep();
        assert_eq!(outcome.expired, 1);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_oldest_over_ceiling() {
        let config = CacheConfig {
            max_bytes: 3,
            ..Default::default()
        };
        let (_dir, store, cache) = setup(config).await;
        store.write(EMPTY_MD5, b"").await.unwrap();
        store.write(ABC_MD5, b"abc").await.unwrap();
        let sha1_a = "86f7e437faa5a7fce15d1ddcb9eaeaea377667b8"; // sha1("a")
        store.write(sha1_a, b"a").await.unwrap();

        cache.get(EMPTY_MD5).await.unwrap();
        cache.get(ABC_MD5).await.unwrap();
        cache.get(sha1_a).await.unwrap();
        assert_eq!(cache.stats().total_bytes, 4);

        let outcome = cache.sweep();
        // Inserted first: the empty object, then "abc"
        assert_eq!(outcome.evicted, 2);
        assert!(cache.contains(sha1_a));
        assert!(cache.stats().total_bytes <= 3);
    }
}
