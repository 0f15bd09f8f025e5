//! Lookup orchestration
//!
//! A request for (library, topic) is answered, in order, by:
//!
//! 1. the exact cache entry (served even when stale; a stale hit is
//!    queued for background refresh),
//! 2. a fuzzy match scoring at or above the substitute threshold,
//! 3. the remote source, through the circuit breaker, with the result
//!    stored for next time.
//!
//! Anything else comes back as [`LookupOutcome::NotFound`] or
//! [`LookupOutcome::Unavailable`] with a reason and the weaker fuzzy
//! matches as suggestions.
//!
//! # Example
//!
//! ```no_run
//! use ouroboros_kb::{DocsLookup, KbConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let lookup = DocsLookup::open(KbConfig::from_env()?)?;
//! match lookup.lookup("react", Some("hooks")).await.content() {
//!     Some(docs) => println!("{}", docs),
//!     None => println!("no documentation available"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::entry::CacheEntry;
use crate::cache::metadata::IndexHealth;
use crate::cache::store::{blocking, CacheStore};
use crate::cache::types::{CacheKey, CacheStats, Counter};
use crate::cleanup::CleanupEngine;
use crate::config::KbConfig;
use crate::error::{KbError, Result};
use crate::fuzzy::{EntryMatch, FuzzyMatcher};
use crate::refresh::queue::{RefreshQueue, PRIORITY_STALE};
use crate::refresh::worker::RefreshWorker;
use crate::source::{DocsSource, RemoteFetcher};
use crate::staleness::StalenessPolicyManager;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a lookup
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// Exact cache hit
    Hit { entry: CacheEntry, stale: bool },
    /// A close match served in place of the requested key
    Fuzzy {
        entry: CacheEntry,
        requested: CacheKey,
        matched: EntryMatch,
    },
    /// Fetched from the remote source and cached
    Fetched { entry: CacheEntry },
    /// Nothing cached and the remote source has nothing either
    NotFound {
        key: CacheKey,
        reason: String,
        suggestions: Vec<EntryMatch>,
    },
    /// Nothing cached and the remote source could not be used
    Unavailable {
        key: CacheKey,
        reason: String,
        suggestions: Vec<EntryMatch>,
    },
}

impl LookupOutcome {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            LookupOutcome::Hit { entry, .. }
            | LookupOutcome::Fuzzy { entry, .. }
            | LookupOutcome::Fetched { entry } => Some(entry),
            LookupOutcome::NotFound { .. } | LookupOutcome::Unavailable { .. } => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.entry().map(|e| e.content.as_str())
    }

    pub fn is_found(&self) -> bool {
        self.entry().is_some()
    }

    /// Reason string for unsatisfied lookups
    pub fn reason(&self) -> Option<&str> {
        match self {
            LookupOutcome::NotFound { reason, .. } | LookupOutcome::Unavailable { reason, .. } => {
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn suggestions(&self) -> &[EntryMatch] {
        match self {
            LookupOutcome::NotFound { suggestions, .. }
            | LookupOutcome::Unavailable { suggestions, .. } => suggestions,
            _ => &[],
        }
    }
}

/// Summary of a prefetch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetchReport {
    pub fetched: Vec<CacheKey>,
    /// Already cached
    pub skipped: Vec<CacheKey>,
    pub failed: Vec<(CacheKey, String)>,
    /// Stopped by the cancel signal before every key was attempted
    pub cancelled: bool,
}

/// Cache front end combining store, fuzzy matching, staleness and remote fetches
#[derive(Debug)]
pub struct DocsLookup {
    config: KbConfig,
    store: Arc<CacheStore>,
    policy: Arc<StalenessPolicyManager>,
    matcher: FuzzyMatcher,
    queue: Arc<RefreshQueue>,
    fetcher: Option<Arc<RemoteFetcher>>,
}

impl DocsLookup {
    /// Open the cache described by `config`.
    ///
    /// Fails only when the configuration is invalid or the cache root is
    /// unusable. An index that disagrees with the entries on disk is
    /// rebuilt.
    pub fn open(config: KbConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_cache_root()?;

        let store = Arc::new(CacheStore::open(&config.cache_root)?);
        let health = store.index().check_consistency(&store);
        if !health.status.is_consistent() {
            let problem = KbError::IndexInconsistency(format!(
                "{} entries missing from index, {} indexed entries missing on disk",
                health.missing_from_index.len(),
                health.missing_on_disk.len()
            ));
            warn!("{}; rebuilding", problem);
            if let Err(e) = store.index().rebuild_from_store(&store) {
                warn!("Index rebuild failed: {}", e);
            }
        }

        let queue = Arc::new(RefreshQueue::open(
            store.paths().refresh_queue_file(),
            config.refresh.clone(),
        ));

        info!("Opened documentation cache at {}", config.cache_root.display());
        Ok(Self {
            policy: Arc::new(StalenessPolicyManager::new(config.staleness.clone())),
            matcher: FuzzyMatcher::from_config(&config.fuzzy),
            store,
            queue,
            fetcher: None,
            config,
        })
    }

    /// Use `source` for misses, with a breaker built from the configuration
    pub fn with_source(self, source: Arc<dyn DocsSource>) -> Self {
        let fetcher = Arc::new(RemoteFetcher::from_config(source, &self.config));
        self.with_fetcher(fetcher)
    }

    /// Use an existing fetcher (and therefore its breaker) for misses
    pub fn with_fetcher(mut self, fetcher: Arc<RemoteFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RefreshQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &Arc<StalenessPolicyManager> {
        &self.policy
    }

    pub fn fetcher(&self) -> Option<&Arc<RemoteFetcher>> {
        self.fetcher.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn check_index(&self) -> IndexHealth {
        self.store.index().check_consistency(&self.store)
    }

    /// Resolve a request for (library, topic)
    pub async fn lookup(&self, library: &str, topic: Option<&str>) -> LookupOutcome {
        let key = CacheKey::new(library, topic);
        if key.library.is_empty() {
            return LookupOutcome::NotFound {
                key,
                reason: "empty library name".to_string(),
                suggestions: Vec::new(),
            };
        }

        if let Some(entry) = self.cached(&key).await {
            let stale = self
                .policy
                .evaluate(&key.library, entry.cached_at, None, None)
                .is_stale;
            if stale {
                self.queue_refresh(&key, "served stale from cache");
            }
            return LookupOutcome::Hit { entry, stale };
        }

        let mut suggestions = self.fuzzy_matches(&key).await;
        if let Some(best) = suggestions.first() {
            if best.score >= self.config.fuzzy.substitute_threshold {
                if let Some(entry) = self.cached(&best.key).await {
                    self.store.record(Counter::FuzzyHit);
                    debug!("Serving {} for {} (score {:.2})", best.key, key, best.score);
                    let matched = suggestions.remove(0);
                    return LookupOutcome::Fuzzy {
                        entry,
                        requested: key,
                        matched,
                    };
                }
            }
        }

        let Some(fetcher) = &self.fetcher else {
            return LookupOutcome::NotFound {
                key,
                reason: "not cached and no remote source configured".to_string(),
                suggestions,
            };
        };

        match self.fetch_and_store(fetcher, &key).await {
            Ok(entry) => LookupOutcome::Fetched { entry },
            Err(e @ KbError::NotFound { .. }) => LookupOutcome::NotFound {
                key,
                reason: e.to_string(),
                suggestions,
            },
            Err(e) => {
                warn!("Remote lookup for {} failed: {}", key, e);
                LookupOutcome::Unavailable {
                    key,
                    reason: e.to_string(),
                    suggestions,
                }
            }
        }
    }

    /// Fetch and cache every key not already cached, up to
    /// `max_concurrent_fetches` at a time.
    ///
    /// When `cancel` turns true, in-flight fetches are dropped. Entries are
    /// only ever written whole, so a cancelled prefetch leaves no partial
    /// entries behind.
    pub async fn prefetch<I>(
        &self,
        requests: I,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PrefetchReport>
    where
        I: IntoIterator<Item = CacheKey>,
    {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| KbError::RemoteUnavailable("no remote source configured".to_string()))?;

        let requests: Vec<CacheKey> = requests.into_iter().collect();
        let (skipped, pending): (Vec<_>, Vec<_>) = blocking(&self.store, move |store| {
            requests
                .into_iter()
                .partition(|key| store.exists(&key.library, Some(&key.topic)))
        })
        .await?;

        let mut report = PrefetchReport {
            skipped,
            ..Default::default()
        };

        let mut fetches = stream::iter(pending)
            .map(|key| async move {
                let result = self.fetch_and_store(fetcher, &key).await;
                (key, result)
            })
            .buffer_unordered(self.config.max_concurrent_fetches.max(1));

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    report.cancelled = true;
                    info!("Prefetch cancelled after {} entries", report.fetched.len());
                    break;
                }
                next = fetches.next() => match next {
                    Some((key, Ok(_))) => report.fetched.push(key),
                    Some((key, Err(e))) => report.failed.push((key, e.to_string())),
                    None => break,
                },
            }
        }

        Ok(report)
    }

    /// Drop cached documentation and any pending refresh for it
    pub fn invalidate(&self, library: &str, topic: Option<&str>) -> Result<bool> {
        let removed = self.store.delete(library, topic)?;
        if let Err(e) = self.queue.remove_task(library, topic) {
            warn!("Failed to drop refresh task for {}: {}", library, e);
        }
        Ok(removed)
    }

    /// Cleanup engine over this cache
    pub fn cleanup_engine(&self) -> CleanupEngine {
        CleanupEngine::new(
            self.store.clone(),
            self.policy.clone(),
            self.config.cleanup.clone(),
        )
    }

    /// Refresh worker over this cache; needs a remote source
    pub fn refresh_worker(&self) -> Option<RefreshWorker> {
        self.fetcher.as_ref().map(|fetcher| {
            RefreshWorker::new(
                self.store.clone(),
                self.queue.clone(),
                fetcher.clone(),
                self.policy.clone(),
                self.config.refresh.clone(),
            )
        })
    }

    /// Start the auto-cleanup loop and, with a remote source, the refresh
    /// worker. Both stop when `shutdown` turns true.
    pub fn start_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) =
            CleanupEngine::spawn_auto_cleanup(Arc::new(self.cleanup_engine()), shutdown.clone())
        {
            handles.push(handle);
        }
        if let Some(worker) = self.refresh_worker() {
            handles.push(Arc::new(worker).spawn(shutdown));
        }
        handles
    }

    /// Counted read of `key`; a failed read is a miss
    async fn cached(&self, key: &CacheKey) -> Option<CacheEntry> {
        let key = key.clone();
        blocking(&self.store, move |store| store.get(&key.library, Some(&key.topic)))
            .await
            .unwrap_or_else(|e| {
                warn!("{}", e);
                None
            })
    }

    async fn fetch_and_store(&self, fetcher: &RemoteFetcher, key: &CacheKey) -> Result<CacheEntry> {
        let docs = fetcher.fetch(&key.library, &key.topic).await?;
        self.store.record(Counter::RemoteFetch);

        let key = key.clone();
        blocking(&self.store, move |store| {
            store.store(&key.library, Some(&key.topic), &docs.content, docs.source_info())
        })
        .await?
    }

    async fn fuzzy_matches(&self, key: &CacheKey) -> Vec<EntryMatch> {
        let candidates = blocking(&self.store, |store| match store.index().load_cache_index() {
            Ok(index) => index.keys(),
            Err(e) => {
                debug!("Falling back to a store scan for fuzzy candidates: {}", e);
                store
                    .scan()
                    .into_iter()
                    .filter(|info| !info.corrupt)
                    .map(|info| info.key)
                    .collect()
            }
        })
        .await
        .unwrap_or_else(|e| {
            warn!("{}", e);
            Vec::new()
        });

        self.matcher
            .find_matching_entry(
                &key.library,
                &key.topic,
                candidates.iter().filter(|k| *k != key),
                self.config.fuzzy.max_results,
            )
    }

    fn queue_refresh(&self, key: &CacheKey, reason: &str) {
        if let Err(e) = self
            .queue
            .add_task(&key.library, Some(&key.topic), PRIORITY_STALE, reason, None)
        {
            warn!("Failed to queue refresh for {}: {}", key, e);
        }
    }
}

/// Resolves once the flag is true; never if the sender is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
