//! Cache store interface and its in-memory and file-backed implementations
//!
//! The proxy core only sees [`CacheStore`]: `get`, `put` with a TTL and
//! explicit `evict`. Entries expire purely by TTL. Concurrent writers to the
//! same key race with last-write-wins, which is fine because cached bodies for
//! a URL are treated as immutable.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Which tier an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    Full,
    Preload,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Full => "full",
            CacheTier::Preload => "preload",
        }
    }
}

/// A cached response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub kind: CacheTier,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub written_at: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> SystemTime {
        self.written_at + self.ttl
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at() > now
    }
}

/// Pluggable cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a fresh entry; expired entries read as misses
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry for `ttl`, replacing any previous one
    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;

    /// Remove an entry; returns whether one existed
    async fn evict(&self, key: &str) -> Result<bool>;
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStoreStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

/// In-memory store with injectable clock
pub struct MemoryCacheStore {
    storage: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    stats: RwLock<CacheStoreStats>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryCacheStore {
            storage: RwLock::new(HashMap::new()),
            clock,
            stats: RwLock::new(CacheStoreStats::default()),
        }
    }

    pub fn get_stats(&self) -> CacheStoreStats {
        let mut stats = self
            .stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let storage = self.storage.read().unwrap_or_else(|e| e.into_inner());
        stats.entries = storage.len();
        stats.bytes = storage.values().map(|e| e.body.len()).sum();
        stats
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut storage = self.storage.write().unwrap_or_else(|e| e.into_inner());
        let before = storage.len();
        storage.retain(|_, entry| entry.is_fresh(now));
        before - storage.len()
    }

    fn record(&self, update: impl FnOnce(&mut CacheStoreStats)) {
        update(&mut self.stats.write().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now();
        let found = {
            let mut storage = self.storage.write().unwrap_or_else(|e| e.into_inner());
            match storage.get(key) {
                Some(entry) if entry.is_fresh(now) => Some(entry.clone()),
                Some(_) => {
                    storage.remove(key);
                    None
                }
                None => None,
            }
        };

        match &found {
            Some(_) => self.record(|s| s.hits += 1),
            None => self.record(|s| s.misses += 1),
        }
        Ok(found)
    }

    async fn put(&self, key: &str, mut entry: CacheEntry, ttl: Duration) -> Result<()> {
        entry.key = key.to_string();
        entry.ttl = ttl;
        entry.written_at = self.clock.now();

        let size = entry.body.len();
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
        self.record(|s| s.writes += 1);

        debug!("Stored in memory cache: {} ({} bytes)", key, size);
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        let removed = self
            .storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some();
        Ok(removed)
    }
}

/// On-disk representation of an entry
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    kind: CacheTier,
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    written_at_secs: u64,
    ttl_secs: u64,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        StoredEntry {
            key: entry.key.clone(),
            kind: entry.kind,
            status: entry.status,
            headers: entry
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: entry.body.to_vec(),
            written_at_secs: secs_since_epoch(entry.written_at),
            ttl_secs: entry.ttl.as_secs(),
        }
    }

    fn into_entry(self) -> CacheEntry {
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                headers.append(name, value);
            }
        }

        CacheEntry {
            key: self.key,
            kind: self.kind,
            status: self.status,
            headers,
            body: Bytes::from(self.body),
            written_at: UNIX_EPOCH + Duration::from_secs(self.written_at_secs),
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }
}

fn secs_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// File-backed store: one file per key, `expires_at` (8 bytes LE) + bincode entry
pub struct FileCacheStore {
    base_path: PathBuf,
    clock: Arc<dyn Clock>,
    tmp_seq: AtomicU64,
}

impl FileCacheStore {
    /// Create the store, making the base directory if needed
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_clock(base_path, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(base_path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        info!("File cache store at {}", base_path.display());
        Ok(FileCacheStore {
            base_path,
            clock,
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Path for a key, fanned out into subdirectories by hash prefix
    fn file_path(&self, key: &str) -> PathBuf {
        let hash = format!("{:016x}", xxh3_64(key.as_bytes()));
        self.base_path.join(&hash[..2]).join(&hash)
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let file_path = self.file_path(key);

        let data = match fs::read(&file_path).await {
            Ok(data) => data,
            Err(_) => return Ok(None),
        };

        if data.len() < 8 {
            let _ = fs::remove_file(&file_path).await;
            return Ok(None);
        }

        let (stamp, payload) = data.split_at(8);
        let mut stamp_bytes = [0u8; 8];
        stamp_bytes.copy_from_slice(stamp);
        let expires_at = UNIX_EPOCH + Duration::from_secs(u64::from_le_bytes(stamp_bytes));

        if expires_at <= self.clock.now() {
            let _ = fs::remove_file(&file_path).await;
            return Ok(None);
        }

        let stored: StoredEntry = match bincode::deserialize(payload) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Corrupt cache file {}: {}", file_path.display(), e);
                let _ = fs::remove_file(&file_path).await;
                return Ok(None);
            }
        };

        // Hash collision guard
        if stored.key != key {
            return Ok(None);
        }

        Ok(Some(stored.into_entry()))
    }

    async fn put(&self, key: &str, mut entry: CacheEntry, ttl: Duration) -> Result<()> {
        entry.key = key.to_string();
        entry.ttl = ttl;
        entry.written_at = self.clock.now();

        let file_path = self.file_path(key);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ProxyError::CacheError(format!("Failed to create cache directory: {}", e))
            })?;
        }

        let payload = bincode::serialize(&StoredEntry::from_entry(&entry))
            .map_err(|e| ProxyError::CacheError(format!("Failed to encode entry: {}", e)))?;
        let expires_at = secs_since_epoch(entry.expires_at());

        // Write to a temp file and rename so readers never see half an entry
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = file_path.with_extension(format!("{}.tmp", seq));
        let written = async {
            let mut file = fs::File::create(&tmp_path).await.map_err(|e| {
                ProxyError::CacheError(format!("Failed to create cache file: {}", e))
            })?;
            file.write_all(&expires_at.to_le_bytes())
                .await
                .map_err(|e| ProxyError::CacheError(format!("Failed to write timestamp: {}", e)))?;
            file.write_all(&payload)
                .await
                .map_err(|e| ProxyError::CacheError(format!("Failed to write data: {}", e)))?;
            file.sync_all()
                .await
                .map_err(|e| ProxyError::CacheError(format!("Failed to sync file: {}", e)))?;
            fs::rename(&tmp_path, &file_path).await.map_err(|e| {
                ProxyError::CacheError(format!("Failed to publish cache file: {}", e))
            })
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
                }
            }
            return Err(e);
        }

        debug!("Wrote to file cache: {} ({} bytes)", key, entry.body.len());
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::CacheError(format!(
                "Failed to delete cache file: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &'static str) -> CacheEntry {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("audio/mpeg"));
        CacheEntry {
            key: String::new(),
            kind: CacheTier::Full,
            status: 200,
            headers,
            body: Bytes::from(body),
            written_at: UNIX_EPOCH,
            ttl: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_memory_store_expiry_with_manual_clock() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryCacheStore::with_clock(clock.clone());

        store
            .put("k", entry("hello"), Duration::from_secs(60))
            .await
            .unwrap();
        let hit = store.get("k").await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from("hello"));
        assert_eq!(hit.key, "k");

        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());

        let stats = store.get_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins_and_evict() {
        let store = MemoryCacheStore::new();
        store.put("k", entry("one"), Duration::from_secs(60)).await.unwrap();
        store.put("k", entry("two"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().body, Bytes::from("two"));

        assert!(store.evict("k").await.unwrap());
        assert!(!store.evict("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryCacheStore::with_clock(clock.clone());
        store.put("short", entry("a"), Duration::from_secs(1)).await.unwrap();
        store.put("long", entry("b"), Duration::from_secs(100)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.get_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_file_store_persistence() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        {
            let store = FileCacheStore::new(temp_dir.path()).await.unwrap();
            store
                .put("https://example.com/a.mp3", entry("persisted"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        // A new instance over the same directory simulates a restart
        let store = FileCacheStore::new(temp_dir.path()).await.unwrap();
        let hit = store.get("https://example.com/a.mp3").await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from("persisted"));
        assert_eq!(hit.status, 200);
        assert_eq!(hit.headers["content-type"], "audio/mpeg");
        assert_eq!(hit.kind, CacheTier::Full);

        assert!(store.evict("https://example.com/a.mp3").await.unwrap());
        assert!(store.get("https://example.com/a.mp3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_expiry() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = FileCacheStore::with_clock(temp_dir.path(), clock.clone())
            .await
            .unwrap();
        store.put("k", entry("x"), Duration::from_secs(10)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance(Duration::from_secs(11));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_file_write_leaves_no_temp_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = FileCacheStore::new(temp_dir.path()).await.unwrap();

        // A directory squatting on the entry path makes the final rename fail
        let file_path = store.file_path("k");
        std::fs::create_dir_all(file_path.join("occupied")).unwrap();

        let result = store.put("k", entry("x"), Duration::from_secs(10)).await;
        assert!(matches!(result, Err(ProxyError::CacheError(_))));

        let leftovers: Vec<_> = std::fs::read_dir(file_path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }
}
