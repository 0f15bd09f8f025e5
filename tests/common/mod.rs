//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ouroboros_kb::{
    CircuitBreakerConfig, DocsSource, FetchRequest, FetchedDocs, KbConfig, KbError,
    ResolvedLibrary,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory documentation source with switchable failure modes
#[derive(Default)]
pub struct MockSource {
    docs: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pub resolve_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` for `library` (any topic)
    pub fn with_docs(self, library: &str, content: &str) -> Self {
        self.set_docs(library, content);
        self
    }

    pub fn set_docs(&self, library: &str, content: &str) {
        self.docs
            .lock()
            .unwrap()
            .insert(library.to_string(), content.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn resolves(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocsSource for MockSource {
    async fn resolve(&self, library: &str) -> ouroboros_kb::Result<ResolvedLibrary> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(KbError::RemoteUnavailable("connection refused".to_string()));
        }
        let mut resolved = ResolvedLibrary::new(format!("/mock/{}", library));
        resolved.trust_score = Some(0.85);
        Ok(resolved)
    }

    async fn fetch_docs(&self, request: FetchRequest) -> ouroboros_kb::Result<FetchedDocs> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(KbError::RemoteUnavailable("connection reset".to_string()));
        }

        let library = request.id.trim_start_matches("/mock/").to_string();
        let content = self.docs.lock().unwrap().get(&library).cloned();
        match content {
            Some(content) => Ok(FetchedDocs {
                content: format!("{} ({})", content, request.topic.unwrap_or_default()),
                snippet_count: Some(3),
            }),
            // Upstream answers with nothing for unknown libraries
            None => Ok(FetchedDocs::new("")),
        }
    }
}

/// Configuration rooted in `root` with background tasks off and fast breaker timings
pub fn test_config(root: &Path) -> KbConfig {
    let mut config = KbConfig::builder()
        .cache_root(root)
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_millis(500),
        })
        .build();
    config.cleanup.enable_auto_cleanup = false;
    config
}
