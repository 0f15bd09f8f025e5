//! Durable storage for documentation entries
//!
//! One Markdown file per (library, topic). Entry files are only ever
//! replaced through [`atomic_write`], and every read-modify-write of an
//! entry plus its library metadata runs under that library's lock.

use crate::cache::atomic::{atomic_write, is_temp_file};
use crate::cache::entry::{parse_entry, CacheEntry};
use crate::cache::layout::{slug, unslug, CachePaths, ENTRY_EXTENSION};
use crate::cache::locks::LibraryLocks;
use crate::cache::metadata::{LibraryTotals, MetadataIndex, MetadataUpdate};
use crate::cache::types::{normalize_key, CacheKey, CacheStats, Counter, StatsRecorder};
use crate::error::{KbError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Origin details recorded alongside stored content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    pub source_id: Option<String>,
    pub trust_score: Option<f64>,
    pub snippet_count: Option<u32>,
}

impl SourceInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn trust_score(mut self, trust_score: f64) -> Self {
        self.trust_score = Some(trust_score);
        self
    }

    pub fn snippet_count(mut self, snippet_count: u32) -> Self {
        self.snippet_count = Some(snippet_count);
        self
    }
}

/// Summary of one entry file found by a scan
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: u64,
    pub token_count: u64,
    pub source_id: Option<String>,
    /// The file could not be parsed; key and timestamps come from the
    /// file name and modification time
    pub corrupt: bool,
}

impl EntryInfo {
    pub fn idle_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_accessed
    }
}

/// On-disk entry store
#[derive(Debug)]
pub struct CacheStore {
    paths: CachePaths,
    index: Arc<MetadataIndex>,
    locks: LibraryLocks,
    stats: StatsRecorder,
}

impl CacheStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = CachePaths::new(root);
        fs::create_dir_all(paths.libraries_dir())?;
        fs::create_dir_all(paths.root().join("metadata"))?;

        info!("Opened cache store at {}", paths.root().display());
        Ok(Self {
            index: Arc::new(MetadataIndex::new(paths.clone())),
            paths,
            locks: LibraryLocks::default(),
            stats: StatsRecorder::default(),
        })
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    /// Read an entry, counting the access.
    ///
    /// Missing, unreadable and corrupt entries are all misses.
    pub fn get(&self, library: &str, topic: Option<&str>) -> Option<CacheEntry> {
        let key = CacheKey::new(library, topic);
        let path = self.paths.entry_file(&key);

        let found = self.locks.with_lock(&key.library, || {
            let mut entry = self.read_entry(&path, &key)?;
            entry.mark_accessed();

            if let Err(e) = atomic_write(&path, entry.to_document().as_bytes()) {
                warn!("Failed to record access to {}: {}", key, e);
            }
            if let Err(e) = self
                .index
                .update_library_metadata(&key.library, MetadataUpdate::new().increment_hits())
            {
                warn!("Failed to update metadata for {}: {}", key.library, e);
            }
            Some(entry)
        });

        match &found {
            Some(entry) => {
                self.stats.incr(Counter::Hit);
                debug!("Cache hit: {} (hits: {})", key, entry.hit_count);
            }
            None => {
                self.stats.incr(Counter::Miss);
                debug!("Cache miss: {}", key);
            }
        }
        found
    }

    /// Read an entry without touching its access data or the stats
    pub fn peek(&self, library: &str, topic: Option<&str>) -> Option<CacheEntry> {
        let key = CacheKey::new(library, topic);
        self.read_entry(&self.paths.entry_file(&key), &key)
    }

    /// Write (or overwrite) an entry and update its metadata and index records.
    ///
    /// Overwriting keeps the previous hit count and access time: a refresh
    /// is not a read.
    pub fn store(
        &self,
        library: &str,
        topic: Option<&str>,
        content: &str,
        source: SourceInfo,
    ) -> Result<CacheEntry> {
        let key = CacheKey::new(library, topic);
        if key.library.is_empty() {
            return Err(KbError::Other("library name must not be empty".to_string()));
        }
        let path = self.paths.entry_file(&key);

        let entry = self.locks.with_lock(&key.library, || -> Result<CacheEntry> {
            let mut entry = CacheEntry::new(&key, content)
                .with_source_id(source.source_id)
                .with_trust_score(source.trust_score)
                .with_snippet_count(source.snippet_count.unwrap_or(0));

            if let Some(previous) = self.read_entry(&path, &key) {
                entry.hit_count = previous.hit_count;
                entry.last_accessed = previous.last_accessed;
                if entry.source_id.is_none() {
                    entry.source_id = previous.source_id;
                }
            }

            atomic_write(&path, entry.to_document().as_bytes())?;

            let totals = LibraryTotals::from_entries(&self.scan_library(&key.library));
            let update = MetadataUpdate::new()
                .source_id(entry.source_id.clone())
                .trust_score(entry.trust_score)
                .topic(key.topic.clone())
                .totals(totals);
            if let Err(e) = self.index.update_library_metadata(&key.library, update) {
                warn!("Failed to update metadata for {}: {}", key.library, e);
            }
            if let Err(e) = self.index.update_cache_index(
                &key.library,
                Some(&key.topic),
                entry.source_id.as_deref(),
                false,
            ) {
                warn!("Failed to update cache index for {}: {}", key, e);
            }

            Ok(entry)
        })?;

        self.stats.incr(Counter::Store);
        debug!("Stored {} ({} tokens)", key, entry.token_count);
        Ok(entry)
    }

    pub fn exists(&self, library: &str, topic: Option<&str>) -> bool {
        self.paths.entry_file(&CacheKey::new(library, topic)).is_file()
    }

    /// Delete one topic, or the whole library when `topic` is `None`.
    ///
    /// Returns whether anything was removed. A library left without
    /// entries loses its metadata directory and index record too.
    pub fn delete(&self, library: &str, topic: Option<&str>) -> Result<bool> {
        let library = normalize_key(library);

        let removed = self.locks.with_lock(&library, || -> Result<u64> {
            let removed = match topic {
                Some(topic) => {
                    let key = CacheKey::new(&library, Some(topic));
                    match fs::remove_file(self.paths.entry_file(&key)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
                        Err(e) => return Err(e.into()),
                    }

                    let remaining = self.scan_library(&library);
                    if remaining.is_empty() {
                        self.drop_library_records(&library)?;
                    } else {
                        let update = MetadataUpdate::new()
                            .remove_topic(key.topic.clone())
                            .totals(LibraryTotals::from_entries(&remaining));
                        if let Err(e) = self.index.update_library_metadata(&library, update) {
                            warn!("Failed to update metadata for {}: {}", library, e);
                        }
                        if let Err(e) =
                            self.index.update_cache_index(&library, Some(&key.topic), None, true)
                        {
                            warn!("Failed to update cache index for {}: {}", key, e);
                        }
                    }
                    1
                }
                None => {
                    let count = self.scan_library(&library).len() as u64;
                    match fs::remove_dir_all(self.paths.library_dir(&library)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.drop_library_records(&library)?;
                    count
                }
            };
            Ok(removed)
        })?;

        if removed > 0 {
            self.stats.add(Counter::Eviction, removed);
            debug!("Deleted {} entries from {}", removed, library);
        }
        Ok(removed > 0)
    }

    /// Every entry file under the store, corrupt ones included
    pub fn scan(&self) -> Vec<EntryInfo> {
        let dirs = match fs::read_dir(self.paths.libraries_dir()) {
            Ok(dirs) => dirs,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to scan cache store: {}", e);
                }
                return Vec::new();
            }
        };

        let mut entries: Vec<EntryInfo> = dirs
            .filter_map(|d| d.ok())
            .filter(|d| d.path().is_dir())
            .flat_map(|d| scan_dir(&d.path(), &d.file_name().to_string_lossy()))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Entry files of one library
    pub fn scan_library(&self, library: &str) -> Vec<EntryInfo> {
        let library = normalize_key(library);
        let mut entries = scan_dir(&self.paths.library_dir(&library), &slug(&library));
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Bytes used by entry files
    pub fn total_size_bytes(&self) -> u64 {
        self.scan().iter().map(|e| e.size_bytes).sum()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub(crate) fn record(&self, counter: Counter) {
        self.stats.incr(counter);
    }

    /// Read the entry stored for `key`; a file holding some other key's
    /// entry is a miss
    fn read_entry(&self, path: &Path, key: &CacheKey) -> Option<CacheEntry> {
        let document = match fs::read_to_string(path) {
            Ok(document) => document,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", path.display(), e);
                return None;
            }
        };

        match parse_entry(&document) {
            Ok(entry) if entry.key() == *key => Some(entry),
            Ok(entry) => {
                self.stats.incr(Counter::Corrupt);
                warn!(
                    "Cache entry {} belongs to {}, not {}; treating as a miss",
                    path.display(),
                    entry.key(),
                    key
                );
                None
            }
            Err(e) => {
                self.stats.incr(Counter::Corrupt);
                let err = KbError::CorruptEntry {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                };
                warn!("{}; treating as a miss", err);
                None
            }
        }
    }

    fn drop_library_records(&self, library: &str) -> Result<()> {
        match fs::remove_dir(self.paths.library_dir(library)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            // Leftover temp files from an interrupted write
            Err(_) => fs::remove_dir_all(self.paths.library_dir(library))?,
        }
        self.index.remove_library_metadata(library)?;
        if let Err(e) = self.index.update_cache_index(library, None, None, true) {
            warn!("Failed to drop {} from cache index: {}", library, e);
        }
        info!("Removed library {} from cache", library);
        Ok(())
    }
}

/// Run `f` against `store` on tokio's blocking pool.
///
/// Every store operation reads or fsyncs files, so async callers go
/// through here rather than calling the store directly.
pub async fn blocking<T, F>(store: &Arc<CacheStore>, f: F) -> Result<T>
where
    F: FnOnce(&CacheStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| KbError::Other(format!("cache task failed: {}", e)))
}

fn scan_dir(dir: &Path, dir_name: &str) -> Vec<EntryInfo> {
    let files = match fs::read_dir(dir) {
        Ok(files) => files,
        Err(_) => return Vec::new(),
    };

    files
        .filter_map(|f| f.ok())
        .map(|f| f.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
        .filter(|p| !is_temp_file(p))
        .filter_map(|p| entry_info(&p, dir_name))
        .collect()
}

fn entry_info(path: &Path, dir_name: &str) -> Option<EntryInfo> {
    let meta = fs::metadata(path).ok()?;
    let size_bytes = meta.len();

    let stem = path.file_stem()?.to_string_lossy().to_string();
    let location = CacheKey {
        library: unslug(dir_name).unwrap_or_else(|| dir_name.to_string()),
        topic: unslug(&stem).unwrap_or(stem),
    };

    // An entry found under another key's path counts as corrupt
    if let Some(entry) = fs::read_to_string(path)
        .ok()
        .and_then(|doc| parse_entry(&doc).ok())
        .filter(|entry| entry.key() == location)
    {
        return Some(EntryInfo {
            key: entry.key(),
            path: path.to_path_buf(),
            size_bytes,
            cached_at: entry.cached_at,
            last_accessed: entry.last_accessed,
            hit_count: entry.hit_count,
            token_count: entry.token_count,
            source_id: entry.source_id,
            corrupt: false,
        });
    }

    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Some(EntryInfo {
        key: location,
        path: path.to_path_buf(),
        size_bytes,
        cached_at: modified,
        last_accessed: modified,
        hit_count: 0,
        token_count: 0,
        source_id: None,
        corrupt: true,
    })
}
