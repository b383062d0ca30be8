//! Content-addressed on-disk cache for fetched resources.
//!
//! Entries live as `<sha256(uri)>.<ext>` files under the cache directory
//! with TTL expiry and fewest-hits-first eviction. Metadata is persisted
//! best-effort so a restarted node rediscovers its cache.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use fedgate_core::{
    config::CacheConfig,
    data::{JsonRow, ResourceFormat},
    err::{bail, Context, Result},
};
use fedgate_logging::{best_effort, debug, trace, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

pub const METADATA_FILE: &str = ".cache-metadata.json";
const METADATA_VERSION: u32 = 1;

/// One cached resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub uri: String,
    pub local_path: PathBuf,
    pub format: ResourceFormat,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    version: u32,
    items: Vec<CacheEntry>,
}

/// Cache observability counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub hit_rate: f64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_size: u64,
}

/// The resource cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
    _terminator: Arc<broadcast::Sender<()>>,
}

struct CacheInner {
    conf: CacheConfig,
    state: Mutex<CacheState>,
    accesses: AtomicU64,
    hits: AtomicU64,
    /// Set when metadata persistence fails; the cache keeps serving from RAM
    degraded: AtomicBool,
}

impl ResourceCache {
    pub fn new(conf: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&conf.cache_dir).with_context(|| {
            format!("Failed to create cache dir: {}", conf.cache_dir.display())
        })?;

        let inner = Arc::new(CacheInner {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                current_size: 0,
            }),
            accesses: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            conf,
        });

        inner.load_metadata();

        let (terminator, _) = broadcast::channel(1);
        Self::spawn_cleanup_task(&inner, &terminator);

        Ok(Self {
            inner,
            _terminator: Arc::new(terminator),
        })
    }

    fn spawn_cleanup_task(inner: &Arc<CacheInner>, terminator: &broadcast::Sender<()>) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No async runtime, cache cleanup task disabled");
            return;
        }

        let inner = Arc::clone(inner);
        let mut term = terminator.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.conf.cleanup_interval()) => {}
                    _ = term.recv() => return,
                }

                inner.sweep_expired();
            }
        });
    }

    /// Caches raw bytes under the uri, returning the local path
    pub fn cache_resource(
        &self,
        uri: &str,
        data: &[u8],
        format: ResourceFormat,
        ttl: Option<Duration>,
    ) -> Result<PathBuf> {
        self.inner.store(uri, data, format, ttl)
    }

    /// Caches text under the uri
    pub fn cache_text(
        &self,
        uri: &str,
        text: &str,
        format: ResourceFormat,
        ttl: Option<Duration>,
    ) -> Result<PathBuf> {
        self.inner.store(uri, text.as_bytes(), format, ttl)
    }

    /// Caches rows as serialized JSON under the uri
    pub fn cache_rows(&self, uri: &str, rows: &[JsonRow], ttl: Option<Duration>) -> Result<PathBuf> {
        let data = serde_json::to_vec(rows).context("Failed to serialize rows")?;
        self.inner.store(uri, &data, ResourceFormat::Json, ttl)
    }

    /// Copies an existing file into the cache under the uri
    pub fn cache_file(
        &self,
        uri: &str,
        src: &Path,
        format: ResourceFormat,
        ttl: Option<Duration>,
    ) -> Result<PathBuf> {
        let data = fs::read(src)
            .with_context(|| format!("Failed to read source file: {}", src.display()))?;
        self.inner.store(uri, &data, format, ttl)
    }

    /// Returns the local path for the uri, or `None` when absent, expired,
    /// or the backing file has gone missing. Hits bump the entry's counter.
    pub fn get_cached_path(&self, uri: &str) -> Option<PathBuf> {
        self.inner.accesses.fetch_add(1, Ordering::Relaxed);

        let path = {
            let mut state = self.inner.state.lock().unwrap();

            let entry = state.entries.get(uri)?;

            if entry.expires_at <= Utc::now() {
                trace!("Cache entry expired: {}", uri);
                Self::remove_entry(&mut state, uri);
                return None;
            }

            if !entry.local_path.exists() {
                warn!("Cache backing file missing: {}", entry.local_path.display());
                Self::remove_entry(&mut state, uri);
                return None;
            }

            let entry = state.entries.get_mut(uri).unwrap();
            entry.hits += 1;
            entry.local_path.clone()
        };

        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        self.inner.persist_metadata();
        Some(path)
    }

    /// Drops the entry and its backing file. Idempotent.
    pub fn evict_resource(&self, uri: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            Self::remove_entry(&mut state, uri);
        }
        self.inner.persist_metadata();
    }

    /// Removes every entry and backing file
    pub fn clear_cache(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();

        for entry in state.entries.values() {
            if let Err(err) = fs::remove_file(&entry.local_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove cached file {}: {:?}",
                        entry.local_path.display(),
                        err
                    );
                }
            }
        }

        state.entries.clear();
        state.current_size = 0;
        drop(state);

        self.inner.persist_metadata();
        Ok(())
    }

    /// Flushes cache metadata to disk, for orderly shutdown
    pub fn flush(&self) {
        self.inner.persist_metadata();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().unwrap();
        let accesses = self.inner.accesses.load(Ordering::Relaxed);
        let hits = self.inner.hits.load(Ordering::Relaxed);

        CacheStats {
            item_count: state.entries.len(),
            total_size: state.current_size,
            max_size: self.inner.conf.max_size_bytes,
            hit_rate: if accesses == 0 {
                0.0
            } else {
                hits as f64 / accesses as f64
            },
            oldest: state.entries.values().map(|e| e.cached_at).min(),
            newest: state.entries.values().map(|e| e.cached_at).max(),
        }
    }

    /// Removes an entry and its file from a locked state. No-op when absent.
    fn remove_entry(state: &mut CacheState, uri: &str) {
        if let Some(entry) = state.entries.remove(uri) {
            state.current_size = state.current_size.saturating_sub(entry.size);

            if let Err(err) = fs::remove_file(&entry.local_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove cached file {}: {:?}",
                        entry.local_path.display(),
                        err
                    );
                }
            }
        }
    }
}

impl CacheInner {
    /// File name derived purely from `(uri, format)`
    fn file_name(&self, uri: &str, format: ResourceFormat) -> PathBuf {
        let digest = Sha256::digest(uri.as_bytes());
        self.conf
            .cache_dir
            .join(format!("{}.{}", hex::encode(digest), format.extension()))
    }

    fn store(
        &self,
        uri: &str,
        data: &[u8],
        format: ResourceFormat,
        ttl: Option<Duration>,
    ) -> Result<PathBuf> {
        let size = data.len() as u64;

        if size > self.conf.max_size_bytes {
            bail!(
                "Resource of {} bytes exceeds the maximum cache size of {} bytes",
                size,
                self.conf.max_size_bytes
            );
        }

        let local_path = self.file_name(uri, format);
        let ttl = ttl.unwrap_or_else(|| self.conf.default_ttl());
        let now = Utc::now();

        {
            let mut state = self.state.lock().unwrap();

            // Replace any previous entry for the uri first
            ResourceCache::remove_entry(&mut state, uri);
            self.make_room(&mut state, size);

            fs::write(&local_path, data).with_context(|| {
                format!("Failed to write cache file: {}", local_path.display())
            })?;

            state.entries.insert(
                uri.to_string(),
                CacheEntry {
                    uri: uri.to_string(),
                    local_path: local_path.clone(),
                    format,
                    size,
                    cached_at: now,
                    expires_at: now
                        + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
                    hits: 0,
                },
            );
            state.current_size += size;
        }

        self.persist_metadata();
        Ok(local_path)
    }

    /// Evicts fewest-hit entries until the incoming size fits both bounds
    fn make_room(&self, state: &mut CacheState, incoming: u64) {
        while !state.entries.is_empty()
            && (state.entries.len() >= self.conf.max_items
                || state.current_size + incoming > self.conf.max_size_bytes)
        {
            let victim = state
                .entries
                .values()
                .min_by_key(|e| (e.hits, e.cached_at))
                .map(|e| e.uri.clone());

            match victim {
                Some(uri) => {
                    debug!("Evicting cache entry: {}", uri);
                    ResourceCache::remove_entry(state, &uri);
                }
                None => break,
            }
        }
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .entries
                .values()
                .filter(|e| e.expires_at <= now)
                .map(|e| e.uri.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        debug!("Sweeping {} expired cache entries", expired.len());

        {
            let mut state = self.state.lock().unwrap();
            for uri in expired {
                if let Some(entry) = state.entries.get(&uri) {
                    if entry.expires_at <= now {
                        ResourceCache::remove_entry(&mut state, &uri);
                    }
                }
            }
        }

        self.persist_metadata();
    }

    /// Writes the metadata document. Failure flips the cache into RAM-only
    /// degraded mode rather than failing the mutation that triggered it.
    fn persist_metadata(&self) {
        let metadata = {
            let state = self.state.lock().unwrap();
            CacheMetadata {
                version: METADATA_VERSION,
                items: state.entries.values().cloned().collect(),
            }
        };

        let path = self.conf.cache_dir.join(METADATA_FILE);
        let result = serde_json::to_vec_pretty(&metadata)
            .context("Failed to serialize cache metadata")
            .and_then(|data| {
                fs::write(&path, data)
                    .with_context(|| format!("Failed to write {}", path.display()))
            });

        if result.is_err() {
            self.degraded.store(true, Ordering::Relaxed);
        }
        best_effort("Failed to persist cache metadata", result);
    }

    /// Loads persisted metadata, skipping entries whose backing file is gone
    fn load_metadata(&self) {
        let path = self.conf.cache_dir.join(METADATA_FILE);

        if !path.exists() {
            return;
        }

        let metadata: CacheMetadata = match fs::read(&path)
            .context("Failed to read cache metadata")
            .and_then(|data| {
                serde_json::from_slice(&data).context("Failed to parse cache metadata")
            }) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Ignoring unreadable cache metadata: {:?}", err);
                return;
            }
        };

        if metadata.version != METADATA_VERSION {
            warn!(
                "Ignoring cache metadata with unknown version {}",
                metadata.version
            );
            return;
        }

        let mut state = self.state.lock().unwrap();
        for entry in metadata.items {
            if !entry.local_path.exists() {
                trace!("Skipping cache entry with missing file: {}", entry.uri);
                continue;
            }

            state.current_size += entry.size;
            state.entries.insert(entry.uri.clone(), entry);
        }

        debug!("Loaded {} cache entries from metadata", state.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_conf(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.to_path_buf(),
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_cache_and_get_path() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let path = cache
            .cache_resource("mcp://a/x.csv", b"a,b\n1,2\n", ResourceFormat::Csv, None)
            .unwrap();

        assert!(path.exists());
        assert_eq!(cache.get_cached_path("mcp://a/x.csv"), Some(path.clone()));
        assert_eq!(cache.get_cached_path("mcp://a/other.csv"), None);

        // file name is a pure function of uri and format
        let again = cache
            .cache_resource("mcp://a/x.csv", b"a,b\n3,4\n", ResourceFormat::Csv, None)
            .unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn test_cache_size_accounting() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        cache
            .cache_resource("mcp://a/1.bin", &[0u8; 100], ResourceFormat::Binary, None)
            .unwrap();
        cache
            .cache_resource("mcp://a/2.bin", &[0u8; 50], ResourceFormat::Binary, None)
            .unwrap();

        assert_eq!(cache.stats().total_size, 150);
        assert_eq!(cache.stats().item_count, 2);

        cache.evict_resource("mcp://a/1.bin");
        assert_eq!(cache.stats().total_size, 50);

        // idempotent
        cache.evict_resource("mcp://a/1.bin");
        assert_eq!(cache.stats().total_size, 50);
    }

    #[test]
    fn test_max_items_evicts_fewest_hits() {
        let dir = tempdir().unwrap();
        let conf = CacheConfig {
            max_items: 2,
            ..test_conf(dir.path())
        };
        let cache = ResourceCache::new(conf).unwrap();

        cache
            .cache_resource("mcp://a/1.bin", &[1u8; 10], ResourceFormat::Binary, None)
            .unwrap();
        cache
            .cache_resource("mcp://a/2.bin", &[2u8; 10], ResourceFormat::Binary, None)
            .unwrap();

        // entry 1 has a hit, entry 2 does not
        cache.get_cached_path("mcp://a/1.bin").unwrap();

        cache
            .cache_resource("mcp://a/3.bin", &[3u8; 10], ResourceFormat::Binary, None)
            .unwrap();

        assert_eq!(cache.stats().item_count, 2);
        assert!(cache.get_cached_path("mcp://a/2.bin").is_none());
        assert!(cache.get_cached_path("mcp://a/1.bin").is_some());
        assert!(cache.get_cached_path("mcp://a/3.bin").is_some());
    }

    #[test]
    fn test_max_size_eviction() {
        let dir = tempdir().unwrap();
        let conf = CacheConfig {
            max_size_bytes: 100,
            ..test_conf(dir.path())
        };
        let cache = ResourceCache::new(conf).unwrap();

        cache
            .cache_resource("mcp://a/1.bin", &[1u8; 60], ResourceFormat::Binary, None)
            .unwrap();
        cache
            .cache_resource("mcp://a/2.bin", &[2u8; 60], ResourceFormat::Binary, None)
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.total_size, 60);
        assert!(stats.total_size <= stats.max_size);
    }

    #[test]
    fn test_entry_larger_than_max_size_fails_cleanly() {
        let dir = tempdir().unwrap();
        let conf = CacheConfig {
            max_size_bytes: 10,
            ..test_conf(dir.path())
        };
        let cache = ResourceCache::new(conf).unwrap();

        assert!(cache
            .cache_resource("mcp://a/big.bin", &[0u8; 11], ResourceFormat::Binary, None)
            .is_err());
        assert_eq!(cache.stats().item_count, 0);
        assert_eq!(cache.stats().total_size, 0);

        // exactly max size fits an empty cache
        assert!(cache
            .cache_resource("mcp://a/fit.bin", &[0u8; 10], ResourceFormat::Binary, None)
            .is_ok());
    }

    #[test]
    fn test_expired_entry_returns_none_and_evicts() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let path = cache
            .cache_resource(
                "mcp://a/x.json",
                b"[]",
                ResourceFormat::Json,
                Some(Duration::ZERO),
            )
            .unwrap();

        assert_eq!(cache.get_cached_path("mcp://a/x.json"), None);
        assert!(!path.exists());
        assert_eq!(cache.stats().item_count, 0);
    }

    #[test]
    fn test_missing_backing_file_treated_as_absent() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let path = cache
            .cache_resource("mcp://a/x.json", b"[]", ResourceFormat::Json, None)
            .unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(cache.get_cached_path("mcp://a/x.json"), None);
        assert_eq!(cache.stats().item_count, 0);
    }

    #[test]
    fn test_clear_cache() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let path = cache
            .cache_resource("mcp://a/x.json", b"[]", ResourceFormat::Json, None)
            .unwrap();

        cache.clear_cache().unwrap();

        assert_eq!(cache.get_cached_path("mcp://a/x.json"), None);
        assert!(!path.exists());
        assert_eq!(cache.stats().total_size, 0);
    }

    #[test]
    fn test_metadata_survives_reload() {
        let dir = tempdir().unwrap();

        {
            let cache = ResourceCache::new(test_conf(dir.path())).unwrap();
            cache
                .cache_resource("mcp://a/x.json", b"[1]", ResourceFormat::Json, None)
                .unwrap();
            cache
                .cache_resource("mcp://a/y.json", b"[2]", ResourceFormat::Json, None)
                .unwrap();
        }

        let reloaded = ResourceCache::new(test_conf(dir.path())).unwrap();
        assert_eq!(reloaded.stats().item_count, 2);
        assert_eq!(reloaded.stats().total_size, 6);
        assert!(reloaded.get_cached_path("mcp://a/x.json").is_some());
    }

    #[test]
    fn test_metadata_skips_missing_files_on_load() {
        let dir = tempdir().unwrap();

        let path = {
            let cache = ResourceCache::new(test_conf(dir.path())).unwrap();
            cache
                .cache_resource("mcp://a/x.json", b"[1]", ResourceFormat::Json, None)
                .unwrap()
        };
        fs::remove_file(&path).unwrap();

        let reloaded = ResourceCache::new(test_conf(dir.path())).unwrap();
        assert_eq!(reloaded.stats().item_count, 0);
    }

    #[test]
    fn test_cache_file_copies_source() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let src = dir.path().join("source.csv");
        fs::write(&src, b"a,b\n1,2\n").unwrap();

        let cached = cache
            .cache_file("mcp://a/x.csv", &src, ResourceFormat::Csv, None)
            .unwrap();

        assert_ne!(cached, src);
        assert_eq!(fs::read(&cached).unwrap(), fs::read(&src).unwrap());
        assert_eq!(cache.get_cached_path("mcp://a/x.csv"), Some(cached));
    }

    #[test]
    fn test_cache_rows_serializes_json() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        let rows: Vec<JsonRow> = serde_json::from_str(r#"[{"id":1},{"id":2}]"#).unwrap();
        let path = cache.cache_rows("mcp://a/rows", &rows, None).unwrap();

        let written: Vec<JsonRow> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, rows);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_entries() {
        let dir = tempdir().unwrap();
        let conf = CacheConfig {
            cleanup_interval_ms: 30,
            ..test_conf(dir.path())
        };
        let cache = ResourceCache::new(conf).unwrap();

        cache
            .cache_resource(
                "mcp://a/x.json",
                b"[]",
                ResourceFormat::Json,
                Some(Duration::from_millis(1)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // swept without any get_cached_path call
        assert_eq!(cache.stats().item_count, 0);
    }

    #[test]
    fn test_hit_rate() {
        let dir = tempdir().unwrap();
        let cache = ResourceCache::new(test_conf(dir.path())).unwrap();

        cache
            .cache_resource("mcp://a/x.json", b"[]", ResourceFormat::Json, None)
            .unwrap();

        cache.get_cached_path("mcp://a/x.json");
        cache.get_cached_path("mcp://a/miss.json");

        assert_eq!(cache.stats().hit_rate, 0.5);
    }
}
