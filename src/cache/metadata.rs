//! Per-library metadata and the master cache index
//!
//! Library metadata and the global index are two separate files, each
//! replaced atomically. They are not updated in one transaction: a crash
//! between the two writes can leave them disagreeing with each other or
//! with the entries on disk. [`MetadataIndex::check_consistency`] detects
//! that and [`MetadataIndex::rebuild_from_store`] repairs it.

use crate::cache::atomic::atomic_write_json;
use crate::cache::layout::CachePaths;
use crate::cache::locks::LibraryLocks;
use crate::cache::store::{CacheStore, EntryInfo};
use crate::cache::types::CacheKey;
use crate::error::{KbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const INDEX_VERSION: u32 = 1;

/// Aggregate record for one library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryMetadata {
    pub library: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub trust_score: Option<f64>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub total_docs: usize,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub total_tokens: u64,
    pub last_updated: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
}

impl LibraryMetadata {
    fn new(library: &str) -> Self {
        let now = Utc::now();
        Self {
            library: library.to_string(),
            source_id: None,
            trust_score: None,
            topics: BTreeSet::new(),
            total_docs: 0,
            total_size_bytes: 0,
            total_tokens: 0,
            last_updated: now,
            last_accessed: now,
            hit_count: 0,
        }
    }
}

/// Totals recomputed from the entries of one library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibraryTotals {
    pub docs: usize,
    pub size_bytes: u64,
    pub tokens: u64,
}

impl LibraryTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a EntryInfo>) -> Self {
        entries
            .into_iter()
            .filter(|e| !e.corrupt)
            .fold(Self::default(), |acc, e| Self {
                docs: acc.docs + 1,
                size_bytes: acc.size_bytes + e.size_bytes,
                tokens: acc.tokens + e.token_count,
            })
    }
}

/// Changes applied by [`MetadataIndex::update_library_metadata`]
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    source_id: Option<String>,
    trust_score: Option<f64>,
    topic: Option<String>,
    remove_topic: Option<String>,
    increment_hits: bool,
    totals: Option<LibraryTotals>,
}

impl MetadataUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_id(mut self, source_id: Option<String>) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn trust_score(mut self, trust_score: Option<f64>) -> Self {
        self.trust_score = trust_score;
        self
    }

    /// Record `topic` as cached for the library
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Forget `topic`
    pub fn remove_topic(mut self, topic: impl Into<String>) -> Self {
        self.remove_topic = Some(topic.into());
        self
    }

    /// Count a read
    pub fn increment_hits(mut self) -> Self {
        self.increment_hits = true;
        self
    }

    pub fn totals(mut self, totals: LibraryTotals) -> Self {
        self.totals = Some(totals);
        self
    }
}

/// Index record for one topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicIndexEntry {
    pub cached_at: DateTime<Utc>,
}

/// Index record for one library
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryIndexEntry {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicIndexEntry>,
}

/// Master record of every cached (library, topic) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub total_entries: usize,
    #[serde(default)]
    pub libraries: BTreeMap<String, LibraryIndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            last_updated: Utc::now(),
            total_entries: 0,
            libraries: BTreeMap::new(),
        }
    }
}

impl CacheIndex {
    /// Every indexed key with its cache time
    pub fn entries(&self) -> impl Iterator<Item = (CacheKey, DateTime<Utc>)> + '_ {
        self.libraries.iter().flat_map(|(library, lib)| {
            lib.topics.iter().map(move |(topic, t)| {
                (
                    CacheKey {
                        library: library.clone(),
                        topic: topic.clone(),
                    },
                    t.cached_at,
                )
            })
        })
    }

    /// Every indexed (library, topic) pair
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries().map(|(key, _)| key).collect()
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.keys().cloned().collect()
    }

    pub fn topics_of(&self, library: &str) -> Vec<String> {
        self.libraries
            .get(library)
            .map(|lib| lib.topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.libraries
            .get(&key.library)
            .is_some_and(|lib| lib.topics.contains_key(&key.topic))
    }

    fn recount(&mut self) {
        self.total_entries = self.libraries.values().map(|lib| lib.topics.len()).sum();
        self.last_updated = Utc::now();
    }
}

/// Index health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Index matches the entries on disk
    Healthy,
    /// Index and entries disagree; a rebuild will fix it
    Degraded,
    /// Index file cannot be read at all
    Unhealthy,
}

impl HealthStatus {
    /// Whether the index can be trusted as-is
    pub fn is_consistent(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Result of comparing the index with the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: HealthStatus,
    pub indexed_entries: usize,
    pub stored_entries: usize,
    /// Entries on disk the index does not know about
    pub missing_from_index: Vec<CacheKey>,
    /// Index records whose entry file is gone
    pub missing_on_disk: Vec<CacheKey>,
    pub error: Option<String>,
}

/// Maintains library metadata files and the master index
#[derive(Debug)]
pub struct MetadataIndex {
    paths: CachePaths,
    library_locks: LibraryLocks,
    index_lock: Mutex<()>,
}

impl MetadataIndex {
    pub fn new(paths: CachePaths) -> Self {
        Self {
            paths,
            library_locks: LibraryLocks::default(),
            index_lock: Mutex::new(()),
        }
    }

    /// Read-modify-write one library's metadata
    pub fn update_library_metadata(
        &self,
        library: &str,
        update: MetadataUpdate,
    ) -> Result<LibraryMetadata> {
        self.library_locks.with_lock(library, || {
            let now = Utc::now();
            let mut meta = match self.read_library_metadata(library) {
                Ok(Some(meta)) => meta,
                Ok(None) => LibraryMetadata::new(library),
                Err(e) => {
                    warn!("Replacing unreadable metadata for {}: {}", library, e);
                    LibraryMetadata::new(library)
                }
            };

            if let Some(source_id) = update.source_id {
                meta.source_id = Some(source_id);
            }
            if let Some(trust) = update.trust_score {
                meta.trust_score = Some(trust);
            }
            if let Some(topic) = update.topic {
                meta.topics.insert(topic);
                meta.last_updated = now;
            }
            if let Some(topic) = update.remove_topic {
                meta.topics.remove(&topic);
                meta.last_updated = now;
            }
            if update.increment_hits {
                meta.hit_count += 1;
                meta.last_accessed = now;
            }
            match update.totals {
                Some(totals) => {
                    meta.total_docs = totals.docs;
                    meta.total_size_bytes = totals.size_bytes;
                    meta.total_tokens = totals.tokens;
                }
                None => meta.total_docs = meta.topics.len(),
            }

            atomic_write_json(&self.paths.library_metadata_file(library), &meta)?;
            debug!("Updated metadata for {} ({} topics)", library, meta.topics.len());
            Ok(meta)
        })
    }

    /// Load one library's metadata; unreadable files count as absent
    pub fn load_library_metadata(&self, library: &str) -> Option<LibraryMetadata> {
        match self.read_library_metadata(library) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Ignoring unreadable metadata for {}: {}", library, e);
                None
            }
        }
    }

    /// Remove a library's metadata directory
    pub fn remove_library_metadata(&self, library: &str) -> Result<bool> {
        self.library_locks.with_lock(library, || {
            match fs::remove_dir_all(self.paths.metadata_dir(library)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Add, refresh or remove index records.
    ///
    /// With `remove` set, a `None` topic drops the whole library.
    pub fn update_cache_index(
        &self,
        library: &str,
        topic: Option<&str>,
        source_id: Option<&str>,
        remove: bool,
    ) -> Result<CacheIndex> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_cache_index()?;

        if remove {
            match topic {
                Some(topic) => {
                    let now_empty = match index.libraries.get_mut(library) {
                        Some(lib) => {
                            lib.topics.remove(topic);
                            lib.topics.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        index.libraries.remove(library);
                    }
                }
                None => {
                    index.libraries.remove(library);
                }
            }
        } else {
            let lib = index.libraries.entry(library.to_string()).or_default();
            if let Some(source_id) = source_id {
                lib.source_id = Some(source_id.to_string());
            }
            if let Some(topic) = topic {
                lib.topics.insert(
                    topic.to_string(),
                    TopicIndexEntry {
                        cached_at: Utc::now(),
                    },
                );
            }
        }

        index.recount();
        atomic_write_json(&self.paths.index_file(), &index)?;
        Ok(index)
    }

    /// Load the master index; a missing file is an empty index
    pub fn load_cache_index(&self) -> Result<CacheIndex> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_cache_index()
    }

    /// Compare the index with the entries actually on disk
    pub fn check_consistency(&self, store: &CacheStore) -> IndexHealth {
        let stored: BTreeSet<CacheKey> = store
            .scan()
            .into_iter()
            .filter(|e| !e.corrupt)
            .map(|e| e.key)
            .collect();

        let index = match self.load_cache_index() {
            Ok(index) => index,
            Err(e) => {
                return IndexHealth {
                    status: HealthStatus::Unhealthy,
                    indexed_entries: 0,
                    stored_entries: stored.len(),
                    missing_from_index: stored.into_iter().collect(),
                    missing_on_disk: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let indexed: BTreeSet<CacheKey> = index.keys().into_iter().collect();
        let missing_from_index: Vec<CacheKey> = stored.difference(&indexed).cloned().collect();
        let missing_on_disk: Vec<CacheKey> = indexed.difference(&stored).cloned().collect();

        let status = if missing_from_index.is_empty()
            && missing_on_disk.is_empty()
            && index.total_entries == indexed.len()
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        IndexHealth {
            status,
            indexed_entries: indexed.len(),
            stored_entries: stored.len(),
            missing_from_index,
            missing_on_disk,
            error: None,
        }
    }

    /// Recompute the index and every library's metadata from the entries on disk
    pub fn rebuild_from_store(&self, store: &CacheStore) -> Result<CacheIndex> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let entries = store.scan();

        let mut index = CacheIndex::default();
        let mut by_library: BTreeMap<String, Vec<&EntryInfo>> = BTreeMap::new();

        for info in entries.iter().filter(|e| !e.corrupt) {
            let lib = index.libraries.entry(info.key.library.clone()).or_default();
            if lib.source_id.is_none() {
                lib.source_id = info.source_id.clone();
            }
            lib.topics.insert(
                info.key.topic.clone(),
                TopicIndexEntry {
                    cached_at: info.cached_at,
                },
            );
            by_library.entry(info.key.library.clone()).or_default().push(info);
        }
        index.recount();

        for (library, infos) in &by_library {
            self.library_locks.with_lock(library, || -> Result<()> {
                let previous = self.read_library_metadata(library).ok().flatten();
                let mut meta = LibraryMetadata::new(library);

                meta.topics = infos.iter().map(|e| e.key.topic.clone()).collect();
                let totals = LibraryTotals::from_entries(infos.iter().copied());
                meta.total_docs = totals.docs;
                meta.total_size_bytes = totals.size_bytes;
                meta.total_tokens = totals.tokens;
                meta.source_id = infos.iter().find_map(|e| e.source_id.clone());
                meta.last_updated = infos.iter().map(|e| e.cached_at).max().unwrap_or(meta.last_updated);
                meta.last_accessed = infos.iter().map(|e| e.last_accessed).max().unwrap_or(meta.last_accessed);
                meta.hit_count = infos.iter().map(|e| e.hit_count).sum();

                if let Some(previous) = previous {
                    meta.trust_score = previous.trust_score;
                    meta.hit_count = meta.hit_count.max(previous.hit_count);
                    meta.last_accessed = meta.last_accessed.max(previous.last_accessed);
                }

                atomic_write_json(&self.paths.library_metadata_file(library), &meta)
            })?;
        }

        // Metadata directories for libraries that no longer have entries
        if let Ok(dir) = fs::read_dir(self.paths.root().join("metadata")) {
            let live: BTreeSet<String> = by_library
                .keys()
                .map(|l| crate::cache::layout::slug(l))
                .collect();
            for stale in dir.filter_map(|e| e.ok()) {
                let name = stale.file_name().to_string_lossy().to_string();
                if !live.contains(&name) {
                    if let Err(e) = fs::remove_dir_all(stale.path()) {
                        warn!("Failed to remove orphaned metadata {}: {}", name, e);
                    }
                }
            }
        }

        atomic_write_json(&self.paths.index_file(), &index)?;
        info!(
            "Rebuilt cache index: {} libraries, {} entries",
            index.libraries.len(),
            index.total_entries
        );
        Ok(index)
    }

    fn read_library_metadata(&self, library: &str) -> Result<Option<LibraryMetadata>> {
        match fs::read_to_string(self.paths.library_metadata_file(library)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_cache_index(&self) -> Result<CacheIndex> {
        let path = self.paths.index_file();
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                KbError::IndexInconsistency(format!("unreadable index {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheIndex::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::SourceInfo;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CacheStore) {
        let tmp = TempDir::new().unwrap();
        let store = CacheStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_update_library_metadata() {
        let (_tmp, store) = setup();
        let index = store.index();

        index
            .update_library_metadata(
                "react",
                MetadataUpdate::new()
                    .source_id(Some("/facebook/react".into()))
                    .topic("hooks"),
            )
            .unwrap();
        let meta = index
            .update_library_metadata("react", MetadataUpdate::new().increment_hits())
            .unwrap();

        assert_eq!(meta.source_id.as_deref(), Some("/facebook/react"));
        assert!(meta.topics.contains("hooks"));
        assert_eq!(meta.total_docs, 1);
        assert_eq!(meta.hit_count, 1);
        assert_eq!(index.load_library_metadata("react"), Some(meta));
    }

    #[test]
    fn test_update_cache_index_add_and_remove() {
        let (_tmp, store) = setup();
        let index = store.index();

        index.update_cache_index("react", Some("hooks"), Some("/r"), false).unwrap();
        index.update_cache_index("react", Some("state"), None, false).unwrap();
        let loaded = index.load_cache_index().unwrap();
        assert_eq!(loaded.total_entries, 2);
        assert_eq!(loaded.libraries["react"].source_id.as_deref(), Some("/r"));

        index.update_cache_index("react", Some("hooks"), None, true).unwrap();
        assert_eq!(index.load_cache_index().unwrap().total_entries, 1);

        index.update_cache_index("react", None, None, true).unwrap();
        let loaded = index.load_cache_index().unwrap();
        assert_eq!(loaded.total_entries, 0);
        assert!(loaded.libraries.is_empty());
    }

    #[test]
    fn test_index_file_format() {
        let (tmp, store) = setup();
        store.index().update_cache_index("vue", Some("router"), Some("/vuejs/vue"), false).unwrap();

        let raw = fs::read_to_string(tmp.path().join("index.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["totalEntries"], 1);
        assert_eq!(json["libraries"]["vue"]["sourceId"], "/vuejs/vue");
        assert!(json["libraries"]["vue"]["topics"]["router"]["cachedAt"].is_string());
    }

    #[test]
    fn test_consistency_and_rebuild() {
        let (tmp, store) = setup();
        store.store("react", Some("hooks"), "# hooks", SourceInfo::default()).unwrap();
        store.store("vue", None, "# vue", SourceInfo::default()).unwrap();
        assert!(store.index().check_consistency(&store).status.is_consistent());

        // Simulate a crash that lost the index write
        fs::remove_file(tmp.path().join("index.json")).unwrap();
        store.index().update_cache_index("ghost", Some("topic"), None, false).unwrap();

        let health = store.index().check_consistency(&store);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.missing_from_index.len(), 2);
        assert_eq!(health.missing_on_disk, vec![CacheKey::new("ghost", Some("topic"))]);

        let rebuilt = store.index().rebuild_from_store(&store).unwrap();
        assert_eq!(rebuilt.total_entries, 2);
        assert!(rebuilt.contains(&CacheKey::new("react", Some("hooks"))));
        assert!(store.index().check_consistency(&store).status.is_consistent());
    }

    #[test]
    fn test_corrupt_index_is_reported() {
        let (tmp, store) = setup();
        fs::write(tmp.path().join("index.json"), "{ not json").unwrap();

        assert!(matches!(
            store.index().load_cache_index(),
            Err(KbError::IndexInconsistency(_))
        ));
        assert_eq!(
            store.index().check_consistency(&store).status,
            HealthStatus::Unhealthy
        );
    }
}
