//! Content-addressed cache of synthesized audio.
//!
//! Keys are SHA-256 digests of `(text, voice, rate, pitch)`. Entries older than
//! the TTL are never served. When the entry count exceeds `max_entries` the
//! oldest entries are evicted first. Storage failures degrade to cache misses.

use async_trait::async_trait;
use dashmap::DashMap;
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::AudioBlob;
use crate::util::{lock, now_ms};
use crate::{Result, TtsError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub timestamp_ms: i64,
    pub size: usize,
    /// Insertion order; breaks ties between entries stored in the same millisecond
    #[serde(default)]
    pub seq: u64,
}

impl CacheEntry {
    fn blob(&self) -> AudioBlob {
        AudioBlob::new(self.bytes.clone(), self.mime_type.clone())
    }
}

/// Filter passed to [`AudioStore::delete_where`].
pub type EntryPredicate = dyn for<'e> Fn(&'e CacheEntry) -> bool + Send + Sync;

/// Durable keyed blob store behind the cache.
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Remove every entry matching `predicate`; returns how many were removed.
    async fn delete_where(
        &self,
        predicate: &EntryPredicate,
    ) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    /// Keys of the `n` oldest entries, oldest first.
    async fn oldest(&self, n: usize) -> Result<Vec<String>>;

    async fn remove(&self, key: &str) -> Result<bool>;

    fn backend(&self) -> &'static str;
}

/// In-memory store. Always available; used as the fallback backend.
#[derive(Default)]
pub struct InMemoryAudioStore {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryAudioStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AudioStore for InMemoryAudioStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete_where(
        &self,
        predicate: &EntryPredicate,
    ) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !predicate(entry));
        Ok(before - self.entries.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    async fn oldest(&self, n: usize) -> Result<Vec<String>> {
        let mut stamps: Vec<(i64, u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.value().timestamp_ms, e.value().seq, e.key().clone()))
            .collect();
        stamps.sort();
        Ok(stamps.into_iter().take(n).map(|(_, _, key)| key).collect())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Persistent store using RocksDB; entries are JSON-encoded.
pub struct RocksDbAudioStore {
    db: DB,
}

impl RocksDbAudioStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| TtsError::Cache(e.to_string()))?;
        info!(target: "tts.cache", "RocksDbAudioStore initialized");
        Ok(Arc::new(Self { db }))
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (_, value) = item.map_err(|e| TtsError::Cache(e.to_string()))?;
            match serde_json::from_slice::<CacheEntry>(&value) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(target: "tts.cache", error = %e, "Skipping undecodable cache entry"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl AudioStore for RocksDbAudioStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.db.get(key) {
            Ok(Some(data)) => Ok(Some(serde_json::from_slice(&data)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(TtsError::Cache(e.to_string())),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let serialized = serde_json::to_vec(&entry)?;
        self.db
            .put(entry.key.as_bytes(), serialized)
            .map_err(|e| TtsError::Cache(e.to_string()))
    }

    async fn delete_where(
        &self,
        predicate: &EntryPredicate,
    ) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if predicate(&entry) {
                self.db
                    .delete(entry.key.as_bytes())
                    .map_err(|e| TtsError::Cache(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let mut n = 0;
        for item in self.db.iterator(IteratorMode::Start) {
            item.map_err(|e| TtsError::Cache(e.to_string()))?;
            n += 1;
        }
        Ok(n)
    }

    async fn oldest(&self, n: usize) -> Result<Vec<String>> {
        let mut stamps: Vec<(i64, u64, String)> = self
            .entries()?
            .into_iter()
            .map(|e| (e.timestamp_ms, e.seq, e.key))
            .collect();
        stamps.sort();
        Ok(stamps.into_iter().take(n).map(|(_, _, key)| key).collect())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let existed = self
            .db
            .get(key)
            .map_err(|e| TtsError::Cache(e.to_string()))?
            .is_some();
        self.db
            .delete(key)
            .map_err(|e| TtsError::Cache(e.to_string()))?;
        Ok(existed)
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub sweep_interval: Duration,
    /// RocksDB directory; `None` keeps the cache in memory
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(7 * 24 * 60 * 60 * 1000),
            max_entries: 200,
            sweep_interval: Duration::from_millis(60_000),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub expired: u64,
    pub errors: u64,
    pub entries: usize,
    pub backend: String,
}

pub struct TtsAudioCache {
    store: Arc<dyn AudioStore>,
    config: CacheConfig,
    stats: Mutex<CacheStats>,
    next_seq: AtomicU64,
}

impl TtsAudioCache {
    pub fn new(store: Arc<dyn AudioStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            stats: Mutex::new(CacheStats::default()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(InMemoryAudioStore::new(), config)
    }

    /// Open the configured persistent store, falling back to memory when it is
    /// unavailable.
    pub fn open(config: CacheConfig) -> Self {
        let store: Arc<dyn AudioStore> = match &config.path {
            Some(path) => match RocksDbAudioStore::open(path) {
                Ok(store) => store,
                Err(e) => {
                    warn!(target: "tts.cache", path = ?path, error = %e, "Persistent cache unavailable, using memory");
                    InMemoryAudioStore::new()
                }
            },
            None => InMemoryAudioStore::new(),
        };
        Self::new(store, config)
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Deterministic cache key for one utterance rendering.
    pub fn key(text: &str, voice: &str, rate: u32, pitch: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0x1f]);
        hasher.update(voice.as_bytes());
        hasher.update([0x1f]);
        hasher.update(rate.to_le_bytes());
        hasher.update(pitch.to_le_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn is_expired(&self, entry: &CacheEntry, now: i64) -> bool {
        now - entry.timestamp_ms >= self.config.ttl.as_millis() as i64
    }

    pub async fn get(&self, text: &str, voice: &str, rate: u32, pitch: u32) -> Option<AudioBlob> {
        let key = Self::key(text, voice, rate, pitch);
        match self.store.get(&key).await {
            Ok(Some(entry)) if !self.is_expired(&entry, now_ms()) => {
                lock(&self.stats).hits += 1;
                debug!(target: "tts.cache", key = %key, size = entry.size, "Cache hit");
                Some(entry.blob())
            }
            Ok(Some(_)) => {
                {
                    let mut stats = lock(&self.stats);
                    stats.misses += 1;
                    stats.expired += 1;
                }
                if let Err(e) = self.store.remove(&key).await {
                    self.note_error("remove", &e);
                }
                None
            }
            Ok(None) => {
                lock(&self.stats).misses += 1;
                None
            }
            Err(e) => {
                lock(&self.stats).misses += 1;
                self.note_error("get", &e);
                None
            }
        }
    }

    /// Store a rendering. Zero-byte blobs are ignored.
    pub async fn put(&self, text: &str, voice: &str, rate: u32, pitch: u32, blob: &AudioBlob) {
        if blob.is_empty() {
            return;
        }
        let key = Self::key(text, voice, rate, pitch);
        let entry = CacheEntry {
            key: key.clone(),
            bytes: blob.bytes.clone(),
            mime_type: blob.mime_type.clone(),
            timestamp_ms: now_ms(),
            size: blob.size(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        if let Err(e) = self.store.put(entry).await {
            self.note_error("put", &e);
            return;
        }
        lock(&self.stats).puts += 1;
        debug!(target: "tts.cache", key = %key, size = blob.size(), "Cached audio");
        self.enforce_capacity().await;
    }

    async fn enforce_capacity(&self) {
        let count = match self.store.count().await {
            Ok(n) => n,
            Err(e) => return self.note_error("count", &e),
        };
        if count <= self.config.max_entries {
            return;
        }
        let excess = count - self.config.max_entries;
        let keys = match self.store.oldest(excess).await {
            Ok(keys) => keys,
            Err(e) => return self.note_error("oldest", &e),
        };
        let mut evicted = 0;
        for key in keys {
            match self.store.remove(&key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => self.note_error("evict", &e),
            }
        }
        lock(&self.stats).evictions += evicted;
        debug!(target: "tts.cache", evicted, "Evicted oldest entries");
    }

    /// Remove TTL-expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let ttl_ms = self.config.ttl.as_millis() as i64;
        let now = now_ms();
        let expired = move |entry: &CacheEntry| now - entry.timestamp_ms >= ttl_ms;
        match self.store.delete_where(&expired).await {
            Ok(n) => {
                if n > 0 {
                    lock(&self.stats).expired += n as u64;
                    debug!(target: "tts.cache", removed = n, "Swept expired entries");
                }
                n
            }
            Err(e) => {
                self.note_error("sweep", &e);
                0
            }
        }
    }

    /// Periodic background sweep; stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep().await;
                    }
                    None => break,
                }
            }
        })
    }

    pub async fn clear(&self) -> usize {
        match self.store.delete_where(&|_: &CacheEntry| true).await {
            Ok(n) => n,
            Err(e) => {
                self.note_error("clear", &e);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match self.store.count().await {
            Ok(n) => n,
            Err(e) => {
                self.note_error("count", &e);
                0
            }
        };
        let mut stats = lock(&self.stats).clone();
        stats.entries = entries;
        stats.backend = self.store.backend().to_string();
        stats
    }

    fn note_error(&self, op: &str, error: &TtsError) {
        lock(&self.stats).errors += 1;
        warn!(target: "tts.cache", op, error = %error, "Cache operation failed");
    }
}
