//! Circuit breaker for calls to the remote documentation source
//!
//! ```text
//! CLOSED --(failures >= failure_threshold)--> OPEN
//! OPEN --(reset_timeout since last failure)--> HALF_OPEN
//! HALF_OPEN --(successes >= success_threshold)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! One breaker is built at startup and shared (behind an `Arc`) by every
//! caller of the remote source. State lives behind a single mutex that is
//! never held across an `.await`.

use crate::config::CircuitBreakerConfig;
use crate::error::{KbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// Trial calls are attempted to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    /// Share of attempted calls that failed, as a percentage
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.successful_requests + self.failed_requests;
        if attempted == 0 {
            0.0
        } else {
            (self.failed_requests as f64 / attempted as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            last_failure_time: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state; an OPEN breaker whose cooldown has elapsed reports
    /// (and moves to) HALF_OPEN
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            rejected_requests: inner.rejected_requests,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// While OPEN the call is rejected with [`KbError::CircuitOpen`] and `f`
    /// is never invoked. A call that exceeds the configured timeout fails
    /// with [`KbError::Timeout`] and counts against the breaker, as do
    /// errors for which [`KbError::is_remote_failure`] holds.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_remote_failure() {
                    self.on_failure(&e);
                } else {
                    // The remote answered; the answer was just negative
                    self.on_success();
                }
                Err(e)
            }
            Err(_) => {
                let e = KbError::Timeout {
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                    context: format!("call through breaker '{}'", self.name),
                };
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    /// Like [`call`](Self::call), but yields `fallback` when the call is
    /// rejected or fails
    pub async fn call_with_fallback<F, Fut, T>(&self, f: F, fallback: T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.call(f).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Breaker '{}' serving fallback: {}", self.name, e);
                fallback
            }
        }
    }

    /// Administrative reset back to CLOSED; lifetime counters are kept
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure = None;
        info!("Circuit breaker '{}' reset to CLOSED", self.name);
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);

        if inner.state == CircuitState::Open {
            inner.rejected_requests += 1;
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or_default();
            let remaining = self.config.reset_timeout.saturating_sub(elapsed);
            let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            debug!("Breaker '{}' rejected call", self.name);
            return Err(KbError::CircuitOpen { retry_after_secs });
        }

        inner.total_requests += 1;
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.successful_requests += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    info!("Circuit breaker '{}' recovered: HALF_OPEN -> CLOSED", self.name);
                }
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // A call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &KbError) {
        let mut inner = self.lock();
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(
                    "Circuit breaker '{}' trial call failed, reopening: {}",
                    self.name, error
                );
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    "Circuit breaker '{}' opened after {} consecutive failures: {}",
                    self.name, inner.consecutive_failures, error
                );
            }
            _ => debug!("Breaker '{}' recorded failure: {}", self.name, error),
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled_down = inner
            .last_failure
            .map_or(true, |t| t.elapsed() >= self.config.reset_timeout);
        if cooled_down {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            info!("Circuit breaker '{}' probing: OPEN -> HALF_OPEN", self.name);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
