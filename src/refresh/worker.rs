//! Consumes the refresh queue
//!
//! The worker turns index entries into queue tasks through the staleness
//! policy, then re-fetches queued entries through the shared
//! [`RemoteFetcher`] and overwrites them in the store.

use crate::cache::store::{blocking, CacheStore};
use crate::cache::types::{CacheKey, Counter, DEFAULT_TOPIC};
use crate::config::RefreshConfig;
use crate::error::Result;
use crate::refresh::queue::{RefreshQueue, RefreshTask, StaleCandidate};
use crate::source::RemoteFetcher;
use crate::staleness::StalenessPolicyManager;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of processing one task
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub task: RefreshTask,
    pub refreshed: Vec<CacheKey>,
    /// First failure, if any topic could not be refreshed
    pub error: Option<String>,
}

impl RefreshOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct RefreshWorker {
    store: Arc<CacheStore>,
    queue: Arc<RefreshQueue>,
    fetcher: Arc<RemoteFetcher>,
    policy: Arc<StalenessPolicyManager>,
    config: RefreshConfig,
}

impl RefreshWorker {
    pub fn new(
        store: Arc<CacheStore>,
        queue: Arc<RefreshQueue>,
        fetcher: Arc<RemoteFetcher>,
        policy: Arc<StalenessPolicyManager>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            queue,
            fetcher,
            policy,
            config,
        }
    }

    /// Queue every indexed entry the staleness policy flags
    pub fn scan_and_queue(&self) -> Result<usize> {
        let candidates: Vec<StaleCandidate> = match self.store.index().load_cache_index() {
            Ok(index) => index
                .entries()
                .map(|(key, cached_at)| StaleCandidate {
                    library: key.library,
                    topic: Some(key.topic),
                    last_updated: cached_at,
                })
                .collect(),
            Err(e) => {
                warn!("Cache index unreadable, scanning entries instead: {}", e);
                self.store
                    .scan()
                    .into_iter()
                    .map(|info| StaleCandidate {
                        library: info.key.library,
                        topic: Some(info.key.topic),
                        last_updated: info.cached_at,
                    })
                    .collect()
            }
        };

        self.queue
            .queue_stale_entries(&candidates, &self.policy, None, None)
    }

    /// Refresh the next eligible task, if any
    pub async fn process_next(&self) -> Result<Option<RefreshOutcome>> {
        let Some(task) = self.queue.get_next_task(None) else {
            return Ok(None);
        };

        let topics = match &task.topic {
            Some(topic) => vec![topic.clone()],
            None => {
                let library = task.library.clone();
                blocking(&self.store, move |store| library_topics(store, &library)).await?
            }
        };

        let library = &task.library;
        let results = join_all(topics.iter().map(|topic| async move {
            let docs = self.fetcher.fetch(library, topic).await?;
            self.store.record(Counter::RemoteFetch);

            let key = CacheKey::new(library, Some(topic.as_str()));
            blocking(&self.store, move |store| {
                store
                    .store(&key.library, Some(&key.topic), &docs.content, docs.source_info())
                    .map(|entry| entry.key())
            })
            .await?
        }))
        .await;

        let mut refreshed = Vec::new();
        let mut error = None;
        for (topic, result) in topics.iter().zip(results) {
            match result {
                Ok(key) => refreshed.push(key),
                Err(e) => {
                    debug!("Refresh of {}/{} failed: {}", task.library, topic, e);
                    error.get_or_insert_with(|| format!("{}: {}", topic, e));
                }
            }
        }

        self.queue
            .mark_task_completed(&task.library, task.topic.as_deref(), error.as_deref())?;

        Ok(Some(RefreshOutcome {
            task,
            refreshed,
            error,
        }))
    }

    /// Process up to `max_tasks` tasks, stopping early when none are eligible
    pub async fn process_batch(&self, max_tasks: usize) -> Result<Vec<RefreshOutcome>> {
        let mut outcomes = Vec::new();
        while outcomes.len() < max_tasks {
            match self.process_next().await? {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        Ok(outcomes)
    }

    /// Poll the queue every `poll_interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting refresh worker (interval: {:?})",
                self.config.poll_interval
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let worker = self.clone();
                        match tokio::task::spawn_blocking(move || worker.scan_and_queue()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("Stale scan failed: {}", e),
                            Err(e) => warn!("Stale scan task failed: {}", e),
                        }
                        match self.process_batch(self.config.batch_size).await {
                            Ok(outcomes) if !outcomes.is_empty() => {
                                let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
                                info!("Refreshed {} tasks ({} failed)", outcomes.len(), failed);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Refresh batch failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Refresh worker stopped");
        })
    }

}

/// Cached topics of `library`, or the default topic when none are known
fn library_topics(store: &CacheStore, library: &str) -> Vec<String> {
    let mut topics = match store.index().load_cache_index() {
        Ok(index) => index.topics_of(library),
        Err(_) => Vec::new(),
    };
    if topics.is_empty() {
        topics = store
            .scan_library(library)
            .into_iter()
            .map(|info| info.key.topic)
            .collect();
    }
    if topics.is_empty() {
        topics.push(DEFAULT_TOPIC.to_string());
    }
    topics
}
