//! Cache eviction
//!
//! Every strategy works from a fresh scan of the store and removes
//! entries through [`CacheStore::delete`], so libraries left empty lose
//! their metadata and index records as well.

use crate::cache::store::{CacheStore, EntryInfo};
use crate::config::CleanupConfig;
use crate::error::Result;
use crate::staleness::StalenessPolicyManager;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub entries_removed: usize,
    pub libraries_removed: usize,
    pub bytes_freed: u64,
    pub reason: String,
    pub details: Vec<String>,
}

impl CleanupResult {
    fn noop(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    /// Fold another pass into this one
    pub fn merge(&mut self, other: CleanupResult) {
        self.entries_removed += other.entries_removed;
        self.libraries_removed += other.libraries_removed;
        self.bytes_freed += other.bytes_freed;
        self.details.extend(other.details);
        if !other.reason.is_empty() {
            if !self.reason.is_empty() {
                self.reason.push_str("; ");
            }
            self.reason.push_str(&other.reason);
        }
    }
}

impl fmt::Display for CleanupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CleanupResult {{ entries_removed: {}, libraries_removed: {}, bytes_freed: {}, reason: {} }}",
            self.entries_removed, self.libraries_removed, self.bytes_freed, self.reason
        )
    }
}

/// Dry-run view of what cleanup would find
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecommendations {
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    pub over_size_limit: bool,
    pub total_entries: usize,
    pub max_entries: usize,
    /// Not accessed for longer than `max_age_days`
    pub old_entries: usize,
    /// Not accessed for longer than `min_access_days`
    pub unused_entries: usize,
    /// Past their staleness limit
    pub stale_entries: usize,
    pub corrupt_entries: usize,
    pub recommendations: Vec<String>,
}

#[derive(Debug)]
pub struct CleanupEngine {
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicyManager>,
    config: CleanupConfig,
}

impl CleanupEngine {
    pub fn new(
        store: Arc<CacheStore>,
        policy: Arc<StalenessPolicyManager>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Evict least recently accessed entries (largest first among equals)
    /// until the store fits in `target_size_bytes`.
    ///
    /// With `preserve_recent`, entries accessed within `min_access_days`
    /// are never evicted, even if that leaves the store over target.
    pub fn cleanup_by_size(
        &self,
        target_size_bytes: Option<u64>,
        preserve_recent: bool,
    ) -> Result<CleanupResult> {
        let target = target_size_bytes.unwrap_or(self.config.max_cache_size_bytes);
        let entries = self.store.scan();
        let current: u64 = entries.iter().map(|e| e.size_bytes).sum();

        if current <= target {
            debug!("Cache size {} within target {}", current, target);
            return Ok(CleanupResult::noop("size within limit"));
        }

        let deficit = current - target;
        let now = Utc::now();
        let recent = Duration::days(self.config.min_access_days);

        let mut candidates: Vec<EntryInfo> = entries
            .into_iter()
            .filter(|e| !preserve_recent || e.idle_time(now) > recent)
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then(b.size_bytes.cmp(&a.size_bytes))
        });

        let mut freed = 0u64;
        let victims: Vec<EntryInfo> = candidates
            .into_iter()
            .take_while(|e| {
                if freed >= deficit {
                    return false;
                }
                freed += e.size_bytes;
                true
            })
            .collect();

        let result = self.remove_entries(
            &victims,
            format!("size {} exceeded target {}", current, target),
        );
        if result.bytes_freed < deficit {
            warn!(
                "Size cleanup freed {} of {} bytes; remaining entries are protected",
                result.bytes_freed, deficit
            );
        }
        Ok(result)
    }

    /// Remove entries idle for more than `max_age_days`.
    ///
    /// Unless `ignore_staleness_policy` is set, an idle entry is kept while
    /// its content is still fresh under its library's policy.
    pub fn cleanup_by_age(
        &self,
        max_age_days: Option<i64>,
        ignore_staleness_policy: bool,
    ) -> Result<CleanupResult> {
        let days = max_age_days.unwrap_or(self.config.max_age_days);
        let limit = Duration::days(days);
        let now = Utc::now();

        let victims: Vec<EntryInfo> = self
            .store
            .scan()
            .into_iter()
            .filter(|e| e.idle_time(now) > limit)
            .filter(|e| {
                ignore_staleness_policy
                    || e.corrupt
                    || self
                        .policy
                        .evaluate(&e.key.library, e.cached_at, None, Some(now))
                        .is_stale
            })
            .collect();

        Ok(self.remove_entries(&victims, format!("not accessed in {} days", days)))
    }

    /// Remove entries not accessed within `min_access_days`
    pub fn cleanup_unused(&self, min_access_days: Option<i64>) -> Result<CleanupResult> {
        let days = min_access_days.unwrap_or(self.config.min_access_days);
        let window = Duration::days(days);
        let now = Utc::now();

        let victims: Vec<EntryInfo> = self
            .store
            .scan()
            .into_iter()
            .filter(|e| e.idle_time(now) > window)
            .collect();

        Ok(self.remove_entries(&victims, format!("unused for {} days", days)))
    }

    /// Keep only the `max_entries` most recently accessed entries
    pub fn cleanup_lru(&self, max_entries: Option<usize>) -> Result<CleanupResult> {
        let max = max_entries.unwrap_or(self.config.max_entries);
        let mut entries = self.store.scan();
        if entries.len() <= max {
            return Ok(CleanupResult::noop("entry count within limit"));
        }

        entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        let victims = entries.split_off(max);
        Ok(self.remove_entries(&victims, format!("entry count over {}", max)))
    }

    /// Age, then unused, then size cleanup with configured limits
    pub fn cleanup_all(&self) -> Result<CleanupResult> {
        let mut total = CleanupResult::default();
        total.merge(self.cleanup_by_age(None, false)?);
        total.merge(self.cleanup_unused(None)?);
        total.merge(self.cleanup_by_size(None, true)?);

        info!(
            "Cleanup removed {} entries ({} libraries, {} bytes)",
            total.entries_removed, total.libraries_removed, total.bytes_freed
        );
        Ok(total)
    }

    /// Report what cleanup would do without changing anything
    pub fn get_cleanup_recommendations(&self) -> CleanupRecommendations {
        let entries = self.store.scan();
        let now = Utc::now();
        let current: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let max_age = Duration::days(self.config.max_age_days);
        let min_access = Duration::days(self.config.min_access_days);

        let old_entries = entries.iter().filter(|e| e.idle_time(now) > max_age).count();
        let unused_entries = entries.iter().filter(|e| e.idle_time(now) > min_access).count();
        let corrupt_entries = entries.iter().filter(|e| e.corrupt).count();
        let stale_entries = entries
            .iter()
            .filter(|e| {
                !e.corrupt
                    && self
                        .policy
                        .evaluate(&e.key.library, e.cached_at, None, Some(now))
                        .is_stale
            })
            .count();

        let over_size_limit = current > self.config.max_cache_size_bytes;
        let mut recommendations = Vec::new();
        if over_size_limit {
            recommendations.push(format!(
                "Cache is {} bytes over its {} byte limit; run size cleanup",
                current - self.config.max_cache_size_bytes,
                self.config.max_cache_size_bytes
            ));
        }
        if entries.len() > self.config.max_entries {
            recommendations.push(format!(
                "{} entries exceed the limit of {}; run LRU cleanup",
                entries.len(),
                self.config.max_entries
            ));
        }
        if old_entries > 0 {
            recommendations.push(format!("{} entries not accessed in {} days", old_entries, self.config.max_age_days));
        }
        if unused_entries > 0 {
            recommendations.push(format!("{} entries unused for {} days", unused_entries, self.config.min_access_days));
        }
        if stale_entries > 0 {
            recommendations.push(format!("{} entries are stale and should be refreshed", stale_entries));
        }
        if corrupt_entries > 0 {
            recommendations.push(format!("{} corrupt entries can be removed", corrupt_entries));
        }

        CleanupRecommendations {
            current_size_bytes: current,
            max_size_bytes: self.config.max_cache_size_bytes,
            over_size_limit,
            total_entries: entries.len(),
            max_entries: self.config.max_entries,
            old_entries,
            unused_entries,
            stale_entries,
            corrupt_entries,
            recommendations,
        }
    }

    /// Run [`cleanup_all`](Self::cleanup_all) every `cleanup_interval`
    /// until `shutdown` flips to true. Returns `None` when auto cleanup
    /// is disabled.
    pub fn spawn_auto_cleanup(
        engine: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if !engine.config.enable_auto_cleanup {
            info!("Automatic cache cleanup disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let interval = engine.config.cleanup_interval;
            info!("Starting automatic cache cleanup task (interval: {:?})", interval);

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let engine = engine.clone();
                        match tokio::task::spawn_blocking(move || engine.cleanup_all()).await {
                            Ok(Ok(result)) if result.entries_removed > 0 => {
                                debug!("Auto cleanup: {}", result);
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("Auto cleanup failed: {}", e),
                            Err(e) => warn!("Auto cleanup task panicked: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Automatic cache cleanup stopped");
        }))
    }

    fn remove_entries(&self, victims: &[EntryInfo], reason: String) -> CleanupResult {
        let mut result = CleanupResult::noop(reason);
        let mut touched = BTreeSet::new();

        for victim in victims {
            match self.store.delete(&victim.key.library, Some(&victim.key.topic)) {
                Ok(true) => {
                    result.entries_removed += 1;
                    result.bytes_freed += victim.size_bytes;
                    result
                        .details
                        .push(format!("{} ({} bytes)", victim.key, victim.size_bytes));
                    touched.insert(victim.key.library.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to evict {}: {}", victim.key, e);
                    result.details.push(format!("{} failed: {}", victim.key, e));
                }
            }
        }

        result.libraries_removed = touched
            .iter()
            .filter(|library| !self.store.paths().library_dir(library).exists())
            .count();

        if result.entries_removed > 0 {
            info!(
                "Evicted {} entries ({} bytes): {}",
                result.entries_removed, result.bytes_freed, result.reason
            );
        }
        result
    }
}
