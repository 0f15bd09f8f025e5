//! Persistent documentation cache
//!
//! - [`store`]: entry files with atomic writes
//! - [`metadata`]: per-library aggregates and the master index
//! - [`entry`]: the entry document format
//! - [`types`]: keys, stats and timestamp helpers

pub mod atomic;
pub mod entry;
pub mod layout;
pub(crate) mod locks;
pub mod metadata;
pub mod store;
pub mod types;

pub use entry::{parse_entry, CacheEntry, ParseError};
pub use layout::CachePaths;
pub use metadata::{
    CacheIndex, HealthStatus, IndexHealth, LibraryMetadata, LibraryTotals, MetadataIndex,
    MetadataUpdate,
};
pub use store::{CacheStore, EntryInfo, SourceInfo};
pub use types::{CacheKey, CacheStats, DEFAULT_TOPIC};
