//! Object cache behavior against a real store

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{ABC_MD5, EMPTY_MD5};
use mirror_node::cache::{spawn_sweep_task, ObjectCache};
use mirror_node::config::CacheConfig;
use mirror_node::shutdown::Shutdown;
use mirror_node::storage::ContentStore;
use mirror_node::NodeError;

async fn setup(config: CacheConfig) -> (TempDir, Arc<ContentStore>, Arc<ObjectCache>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
    let cache = Arc::new(ObjectCache::new(Arc::clone(&store), &config));
    (dir, store, cache)
}

#[tokio::test]
async fn test_get_returns_stored_bytes() {
    let (_dir, store, cache) = setup(CacheConfig::default()).await;
    store.write(ABC_MD5, b"abc").await.unwrap();

    let data = cache.get(ABC_MD5).await.unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(&data[..], b"abc");
}

#[tokio::test]
async fn test_replaced_file_is_reread() {
    let (_dir, store, cache) = setup(CacheConfig::default()).await;
    store.write(ABC_MD5, b"abc").await.unwrap();
    assert_eq!(&cache.get(ABC_MD5).await.unwrap()[..], b"abc");

    // Replace the backing file behind the cache's back
    let object = store.object_path(ABC_MD5).unwrap();
    std::fs::write(&object, b"replaced content").unwrap();

    let data = cache.get(ABC_MD5).await.unwrap();
    assert_eq!(&data[..], b"replaced content");
    assert_eq!(cache.stats().reloads, 1);
    assert_eq!(cache.stats().total_bytes, 16);
}

#[tokio::test]
async fn test_readers_keep_their_buffer_across_replacement() {
    let (_dir, store, cache) = setup(CacheConfig::default()).await;
    store.write(ABC_MD5, b"abc").await.unwrap();
    let before = cache.get(ABC_MD5).await.unwrap();

    std::fs::write(store.object_path(ABC_MD5).unwrap(), b"new bytes").unwrap();
    let after = cache.get(ABC_MD5).await.unwrap();

    assert_eq!(&before[..], b"abc");
    assert_eq!(&after[..], b"new bytes");
}

#[tokio::test]
async fn test_absent_object_propagates_not_found() {
    let (_dir, _store, cache) = setup(CacheConfig::default()).await;
    assert!(matches!(
        cache.get(EMPTY_MD5).await,
        Err(NodeError::NotFound(_))
    ));
    assert!(matches!(
        cache.get("../../etc/passwd").await,
        Err(NodeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_sweep_task_enforces_ceiling() {
    let config = CacheConfig {
        max_bytes: 2,
        sweep_interval_secs: 1,
        ..Default::default()
    };
    let (_dir, store, cache) = setup(config).await;
    store.write(ABC_MD5, b"abc").await.unwrap();
    cache.get(ABC_MD5).await.unwrap();
    assert!(cache.contains(ABC_MD5));

    let shutdown = Shutdown::new();
    let task = spawn_sweep_task(
        Arc::clone(&cache),
        Duration::from_millis(20),
        shutdown.subscribe(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cache.contains(ABC_MD5));
    assert_eq!(cache.stats().evictions, 1);

    shutdown.trigger();
    task.await.unwrap();
}
