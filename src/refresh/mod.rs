//! Background refresh of stale entries

pub mod queue;
pub mod worker;

pub use queue::{QueueStats, RefreshQueue, RefreshTask, StaleCandidate};
pub use worker::{RefreshOutcome, RefreshWorker};
