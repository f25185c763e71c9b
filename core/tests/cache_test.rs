use async_trait::async_trait;
use loom_tts::{
    AudioBlob, AudioStore, CacheConfig, CacheEntry, EntryPredicate, InMemoryAudioStore, Result,
    RocksDbAudioStore, TtsAudioCache, TtsError,
};
use std::sync::Arc;
use std::time::Duration;

const VOICE: &str = "zh-HK-HiuGaaiNeural";

fn blob(bytes: &[u8]) -> AudioBlob {
    AudioBlob::new(bytes.to_vec(), "audio/mpeg")
}

fn config(ttl: Duration, max_entries: usize) -> CacheConfig {
    CacheConfig {
        ttl,
        max_entries,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn put_then_get_round_trips() -> Result<()> {
    let cache = TtsAudioCache::in_memory(CacheConfig::default());
    cache.put("你好", VOICE, 160, 100, &blob(&[1, 2, 3])).await;

    let hit = cache.get("你好", VOICE, 160, 100).await.expect("hit");
    assert_eq!(hit.size(), 3);
    assert!(cache.get("never stored", VOICE, 160, 100).await.is_none());
    // Different rendering parameters are different entries
    assert!(cache.get("你好", VOICE, 180, 100).await.is_none());

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.puts, 1);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.backend, "memory");
    Ok(())
}

#[tokio::test]
async fn expired_entries_are_never_served() -> Result<()> {
    let cache = TtsAudioCache::in_memory(config(Duration::from_millis(1), 10));
    cache.put("hi", VOICE, 160, 100, &blob(&[1])).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(cache.get("hi", VOICE, 160, 100).await.is_none());
    let stats = cache.stats().await;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.entries, 0);
    Ok(())
}

#[tokio::test]
async fn empty_blobs_are_not_cached() -> Result<()> {
    let cache = TtsAudioCache::in_memory(CacheConfig::default());
    cache.put("silence", VOICE, 160, 100, &blob(&[])).await;
    assert!(cache.get("silence", VOICE, 160, 100).await.is_none());
    assert_eq!(cache.stats().await.puts, 0);
    Ok(())
}

#[tokio::test]
async fn capacity_evicts_oldest_first() -> Result<()> {
    let cache = TtsAudioCache::in_memory(config(Duration::from_secs(60), 2));
    for text in ["first", "second", "third"] {
        cache.put(text, VOICE, 160, 100, &blob(&[7])).await;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    assert!(cache.get("first", VOICE, 160, 100).await.is_none());
    assert!(cache.get("second", VOICE, 160, 100).await.is_some());
    assert!(cache.get("third", VOICE, 160, 100).await.is_some());
    let stats = cache.stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.entries, 2);
    Ok(())
}

#[tokio::test]
async fn same_millisecond_puts_evict_in_insertion_order() -> Result<()> {
    let cache = TtsAudioCache::in_memory(config(Duration::from_secs(60), 2));
    // No pauses: timestamps collide, keys sort arbitrarily
    for text in ["first", "second", "third", "fourth"] {
        cache.put(text, VOICE, 160, 100, &blob(&[7])).await;
    }

    assert!(cache.get("first", VOICE, 160, 100).await.is_none());
    assert!(cache.get("second", VOICE, 160, 100).await.is_none());
    assert!(cache.get("third", VOICE, 160, 100).await.is_some());
    assert!(cache.get("fourth", VOICE, 160, 100).await.is_some());
    assert_eq!(cache.stats().await.evictions, 2);
    Ok(())
}

#[tokio::test]
async fn oldest_breaks_timestamp_ties_by_sequence() -> Result<()> {
    let store = InMemoryAudioStore::new();
    for (key, seq) in [("a", 2u64), ("b", 0), ("c", 1)] {
        store
            .put(CacheEntry {
                key: key.to_string(),
                bytes: vec![1],
                mime_type: "audio/wav".into(),
                timestamp_ms: 5_000,
                size: 1,
                seq,
            })
            .await?;
    }
    assert_eq!(store.oldest(2).await?, vec!["b".to_string(), "c".to_string()]);
    Ok(())
}

#[tokio::test]
async fn sweep_removes_expired_entries() -> Result<()> {
    let cache = TtsAudioCache::in_memory(config(Duration::from_millis(1), 10));
    cache.put("a", VOICE, 160, 100, &blob(&[1])).await;
    cache.put("b", VOICE, 160, 100, &blob(&[2])).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(cache.sweep().await, 2);
    assert_eq!(cache.stats().await.entries, 0);
    Ok(())
}

#[tokio::test]
async fn background_sweeper_runs_periodically() -> Result<()> {
    let cache = Arc::new(TtsAudioCache::in_memory(CacheConfig {
        ttl: Duration::from_millis(1),
        max_entries: 10,
        sweep_interval: Duration::from_millis(10),
        path: None,
    }));
    cache.put("a", VOICE, 160, 100, &blob(&[1])).await;
    let handle = cache.spawn_sweeper();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.stats().await.entries, 0);
    handle.abort();
    Ok(())
}

#[tokio::test]
async fn rocksdb_store_persists_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tts-cache");
    let cfg = CacheConfig {
        path: Some(path.clone()),
        ..CacheConfig::default()
    };

    {
        let cache = TtsAudioCache::open(cfg.clone());
        assert_eq!(cache.backend(), "rocksdb");
        cache.put("persist me", VOICE, 160, 100, &blob(&[4, 5, 6, 7])).await;
    }

    let reopened = TtsAudioCache::open(cfg);
    let hit = reopened
        .get("persist me", VOICE, 160, 100)
        .await
        .expect("persisted entry");
    assert_eq!(hit.bytes, vec![4, 5, 6, 7]);
    assert_eq!(hit.mime_type, "audio/mpeg");
    Ok(())
}

#[tokio::test]
async fn rocksdb_store_direct_operations() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = RocksDbAudioStore::open(dir.path().join("db"))?;
    for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
        store
            .put(CacheEntry {
                key: key.to_string(),
                bytes: vec![i as u8 + 1],
                mime_type: "audio/wav".into(),
                timestamp_ms: 1_000 + i as i64,
                size: 1,
                seq: i as u64,
            })
            .await?;
    }

    assert_eq!(store.count().await?, 3);
    assert_eq!(store.oldest(2).await?, vec!["k1".to_string(), "k2".to_string()]);
    assert_eq!(store.delete_where(&|e: &CacheEntry| e.timestamp_ms < 1_002).await?, 2);
    assert!(store.get("k3").await?.is_some());
    assert!(store.remove("k3").await?);
    assert_eq!(store.count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn unusable_path_falls_back_to_memory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // A regular file where the database directory should be
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"occupied")?;

    let cache = TtsAudioCache::open(CacheConfig {
        path: Some(file),
        ..CacheConfig::default()
    });
    assert_eq!(cache.backend(), "memory");
    cache.put("still works", VOICE, 160, 100, &blob(&[1])).await;
    assert!(cache.get("still works", VOICE, 160, 100).await.is_some());
    Ok(())
}

struct BrokenStore;

#[async_trait]
impl AudioStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
        Err(TtsError::Cache("disk gone".into()))
    }
    async fn put(&self, _entry: CacheEntry) -> Result<()> {
        Err(TtsError::Cache("disk gone".into()))
    }
    async fn delete_where(
        &self,
        _predicate: &EntryPredicate,
    ) -> Result<usize> {
        Err(TtsError::Cache("disk gone".into()))
    }
    async fn count(&self) -> Result<usize> {
        Err(TtsError::Cache("disk gone".into()))
    }
    async fn oldest(&self, _n: usize) -> Result<Vec<String>> {
        Err(TtsError::Cache("disk gone".into()))
    }
    async fn remove(&self, _key: &str) -> Result<bool> {
        Err(TtsError::Cache("disk gone".into()))
    }
    fn backend(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn storage_errors_degrade_to_misses() -> Result<()> {
    let cache = TtsAudioCache::new(Arc::new(BrokenStore), CacheConfig::default());
    cache.put("x", VOICE, 160, 100, &blob(&[1])).await;
    assert!(cache.get("x", VOICE, 160, 100).await.is_none());

    let stats = cache.stats().await;
    assert_eq!(stats.puts, 0);
    assert_eq!(stats.misses, 1);
    assert!(stats.errors >= 2);
    Ok(())
}
