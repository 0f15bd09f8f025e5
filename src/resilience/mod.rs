//! Protection for calls to the remote documentation source

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
