//! # Ouroboros Knowledge Base (ouroboros-kb)
//!
//! A local, file-backed cache for external library documentation.
//!
//! ## Features
//!
//! - Markdown entries with a readable header and a `key: value` comment
//!   trailer, written atomically
//! - Per-library metadata and a master index that can be rebuilt from disk
//! - Staleness policies per library class (stable, active, critical)
//! - Fuzzy matching of library and topic names
//! - Circuit breaker and bounded concurrency around the remote source
//! - Persistent refresh queue with exponential retry backoff
//! - Size, age, unused and LRU cleanup, optionally on a timer
//!
//! ## Lookup
//!
//! Exact hits are served first, then close fuzzy matches, then the remote
//! source. A source is anything implementing [`DocsSource`].
//!
//! ```no_run
//! use async_trait::async_trait;
//! use ouroboros_kb::{
//!     DocsLookup, DocsSource, FetchRequest, FetchedDocs, KbConfig, ResolvedLibrary,
//! };
//! use std::sync::Arc;
//!
//! struct Upstream;
//!
//! #[async_trait]
//! impl DocsSource for Upstream {
//!     async fn resolve(&self, library: &str) -> ouroboros_kb::Result<ResolvedLibrary> {
//!         Ok(ResolvedLibrary::new(format!("/docs/{}", library)))
//!     }
//!
//!     async fn fetch_docs(&self, request: FetchRequest) -> ouroboros_kb::Result<FetchedDocs> {
//!         Ok(FetchedDocs::new(format!("# {}", request.id)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let lookup = DocsLookup::open(KbConfig::from_env()?)?.with_source(Arc::new(Upstream));
//!
//!     let outcome = lookup.lookup("tokio", Some("runtime")).await;
//!     if let Some(docs) = outcome.content() {
//!         println!("{}", docs);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Background maintenance
//!
//! ```no_run
//! use ouroboros_kb::{DocsLookup, KbConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     ouroboros_kb::telemetry::init_tracing("ouroboros_kb=info");
//!
//!     let lookup = DocsLookup::open(KbConfig::with_root("/tmp/kb-cache"))?;
//!     let (shutdown, rx) = watch::channel(false);
//!     let handles = lookup.start_background(rx);
//!
//!     // ... serve lookups ...
//!
//!     shutdown.send(true)?;
//!     futures::future::join_all(handles).await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod lookup;
pub mod refresh;
pub mod resilience;
pub mod source;
pub mod staleness;
pub mod telemetry;

// Re-export main types for convenience
pub use cache::{
    CacheEntry, CacheIndex, CacheKey, CacheStats, CacheStore, EntryInfo, HealthStatus,
    IndexHealth, LibraryMetadata, MetadataIndex, SourceInfo, DEFAULT_TOPIC,
};
pub use cleanup::{CleanupEngine, CleanupRecommendations, CleanupResult};
pub use config::{
    CircuitBreakerConfig, CleanupConfig, FuzzyConfig, KbConfig, KbConfigBuilder, RefreshConfig,
    StalenessConfig,
};
pub use error::{KbError, Result};
pub use fuzzy::{EntryMatch, FuzzyMatch, FuzzyMatcher, MatchType};
pub use lookup::{DocsLookup, LookupOutcome, PrefetchReport};
pub use refresh::{RefreshOutcome, RefreshQueue, RefreshTask, RefreshWorker};
pub use resilience::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use source::{DocsSource, FetchRequest, FetchedDocs, RemoteDocs, RemoteFetcher, ResolvedLibrary};
pub use staleness::{
    LibraryType, Recommendation, RefreshRecommendation, StalenessPolicy, StalenessPolicyManager,
};
