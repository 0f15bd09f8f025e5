//! Core type definitions for the cache system

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Topic used when the caller does not name one
pub const DEFAULT_TOPIC: &str = "overview";

/// Normalise a library or topic name: trimmed and lower-cased
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Render a timestamp the way every cache file stores it (RFC 3339, UTC)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339, or a naive ISO-8601 timestamp taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Two-part key identifying one documentation unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub library: String,
    pub topic: String,
}

impl CacheKey {
    /// Build a normalised key; a missing or blank topic becomes [`DEFAULT_TOPIC`]
    pub fn new(library: &str, topic: Option<&str>) -> Self {
        let topic = topic
            .map(normalize_key)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        Self {
            library: normalize_key(library),
            topic,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.library, self.topic)
    }
}

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Exact-key hits
    pub hits: u64,

    /// Exact-key misses (including corrupt entries)
    pub misses: u64,

    /// Misses answered by a fuzzy substitute
    pub fuzzy_hits: u64,

    /// Entries fetched from the remote source
    pub remote_fetches: u64,

    /// Entries written
    pub stores: u64,

    /// Entries removed by cleanup or explicit deletion
    pub evictions: u64,

    /// Entries that failed to parse
    pub corrupt_entries: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, fuzzy_hits: {}, remote_fetches: {}, stores: {}, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.fuzzy_hits,
            self.remote_fetches,
            self.stores,
            self.evictions
        )
    }
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    fuzzy_hits: AtomicU64,
    remote_fetches: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    corrupt_entries: AtomicU64,
}

/// Counter selector for [`StatsRecorder::incr`]
#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Hit,
    Miss,
    FuzzyHit,
    RemoteFetch,
    Store,
    Eviction,
    Corrupt,
}

impl StatsRecorder {
    pub(crate) fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub(crate) fn add(&self, counter: Counter, n: u64) {
        let slot = match counter {
            Counter::Hit => &self.hits,
            Counter::Miss => &self.misses,
            Counter::FuzzyHit => &self.fuzzy_hits,
            Counter::RemoteFetch => &self.remote_fetches,
            Counter::Store => &self.stores,
            Counter::Eviction => &self.evictions,
            Counter::Corrupt => &self.corrupt_entries,
        };
        slot.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fuzzy_hits: self.fuzzy_hits.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
        }
    }
}
