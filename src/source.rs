//! Remote documentation source
//!
//! The cache does not speak any remote protocol itself. Callers supply a
//! [`DocsSource`]; every call to it goes through [`RemoteFetcher`], which
//! bounds concurrency with a semaphore and runs each call through the
//! shared [`CircuitBreaker`] (and therefore under its timeout).

use crate::cache::store::SourceInfo;
use crate::config::KbConfig;
use crate::error::{KbError, Result};
use crate::resilience::CircuitBreaker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// A library name resolved to the remote source's identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLibrary {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub trust_score: Option<f64>,
}

impl ResolvedLibrary {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            trust_score: None,
        }
    }
}

/// Arguments to [`DocsSource::fetch_docs`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: String,
    pub topic: Option<String>,
    pub mode: Option<String>,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocs {
    pub content: String,
    pub snippet_count: Option<u32>,
}

impl FetchedDocs {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            snippet_count: None,
        }
    }
}

/// Remote documentation provider
#[async_trait]
pub trait DocsSource: Send + Sync {
    /// Map a library name to the source's identifier
    async fn resolve(&self, library: &str) -> Result<ResolvedLibrary>;

    /// Fetch documentation for a resolved library
    async fn fetch_docs(&self, request: FetchRequest) -> Result<FetchedDocs>;
}

/// Documentation fetched for one (library, topic)
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocs {
    pub content: String,
    pub source_id: String,
    pub trust_score: Option<f64>,
    pub snippet_count: Option<u32>,
}

impl RemoteDocs {
    pub fn source_info(&self) -> SourceInfo {
        SourceInfo {
            source_id: Some(self.source_id.clone()),
            trust_score: self.trust_score,
            snippet_count: self.snippet_count,
        }
    }
}

/// Guarded access to a [`DocsSource`]
pub struct RemoteFetcher {
    source: Arc<dyn DocsSource>,
    breaker: Arc<CircuitBreaker>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for RemoteFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFetcher")
            .field("breaker", &self.breaker.name())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl RemoteFetcher {
    pub fn new(
        source: Arc<dyn DocsSource>,
        breaker: Arc<CircuitBreaker>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            source,
            breaker,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Fetcher with its own breaker built from `config`
    pub fn from_config(source: Arc<dyn DocsSource>, config: &KbConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "docs-source",
            config.circuit_breaker.clone(),
        ));
        Self::new(source, breaker, config.max_concurrent_fetches)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Remote calls that could start right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Resolve `library` and fetch `topic`.
    ///
    /// Holds one concurrency permit for both calls. Blank content is
    /// reported as [`KbError::NotFound`].
    pub async fn fetch(&self, library: &str, topic: &str) -> Result<RemoteDocs> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| KbError::RemoteUnavailable("fetch limiter closed".to_string()))?;

        let resolved = self.breaker.call(|| self.source.resolve(library)).await?;
        debug!("Resolved {} to {}", library, resolved.id);

        let request = FetchRequest {
            id: resolved.id.clone(),
            topic: Some(topic.to_string()),
            mode: None,
            page: None,
        };
        let docs = self
            .breaker
            .call(|| self.source.fetch_docs(request))
            .await?;

        if docs.content.trim().is_empty() {
            return Err(KbError::NotFound {
                library: library.to_string(),
                topic: topic.to_string(),
            });
        }

        Ok(RemoteDocs {
            content: docs.content,
            source_id: resolved.id,
            trust_score: resolved.trust_score,
            snippet_count: docs.snippet_count,
        })
    }
}
