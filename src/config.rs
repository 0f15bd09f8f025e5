//! Configuration for the knowledge-base cache
//!
//! Every section has defaults that work for a single developer machine.
//! [`KbConfig::from_env`] layers `KB_*` environment variables (optionally
//! loaded from a `.env` file) on top of those defaults.

use crate::error::{KbError, Result};
use crate::staleness::LibraryType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;

/// Staleness policy table and explicit library classifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// Maximum age for mature, slow-moving libraries
    pub stable_max_age_days: i64,

    /// Maximum age for fast-moving libraries (test tooling, pre-releases)
    pub active_max_age_days: i64,

    /// Maximum age for security-sensitive libraries
    pub critical_max_age_days: i64,

    /// Entries this close to their limit are reported as "consider_refresh"
    pub consider_window_days: i64,

    /// Explicit classifications; these win over name-based inference
    pub library_types: HashMap<String, LibraryType>,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            stable_max_age_days: 30,
            active_max_age_days: 14,
            critical_max_age_days: 7,
            consider_window_days: 7,
            library_types: HashMap::new(),
        }
    }
}

/// Approximate-match settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyConfig {
    /// Minimum similarity for a candidate to count as a match (0.0 - 1.0)
    pub threshold: f64,

    /// Matches at or above this score are served in place of the exact key
    pub substitute_threshold: f64,

    /// Maximum number of suggestions returned on a miss
    pub max_results: usize,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            substitute_threshold: 0.9,
            max_results: 5,
        }
    }
}

/// Circuit breaker guarding the remote documentation source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,

    /// Cooldown after the last failure before a trial call is allowed
    pub reset_timeout: Duration,

    /// Deadline for a single wrapped call
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Eviction limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Size cap enforced by size-based cleanup
    pub max_cache_size_bytes: u64,

    /// Entries not accessed for this long are removed by age-based cleanup
    pub max_age_days: i64,

    /// Inactivity window for unused cleanup; also the "recent" window
    /// protected during size-based cleanup
    pub min_access_days: i64,

    /// Entry cap enforced by LRU cleanup
    pub max_entries: usize,

    /// Run cleanup periodically in the background
    pub enable_auto_cleanup: bool,

    /// Interval between background cleanup passes
    pub cleanup_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            // 100 MB default
            max_cache_size_bytes: 100 * MIB,
            max_age_days: 90,
            min_access_days: 30,
            max_entries: 10_000,
            enable_auto_cleanup: true,
            // Once a day
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// Refresh queue retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Failed attempts after which a task is dropped
    pub max_attempts: u32,

    /// Backoff base for the first retry
    pub retry_base_delay: Duration,

    /// Cap on the exponential backoff
    pub retry_max_delay: Duration,

    /// Random variation applied to retry delays (0.0 - 1.0)
    pub retry_jitter: f64,

    /// How often the background worker polls the queue
    pub poll_interval: Duration,

    /// Tasks processed per worker pass
    pub batch_size: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            // 5 minutes, doubling up to a day
            retry_base_delay: Duration::from_secs(300),
            retry_max_delay: Duration::from_secs(24 * 3600),
            retry_jitter: 0.1,
            poll_interval: Duration::from_secs(60),
            batch_size: 10,
        }
    }
}

impl RefreshConfig {
    /// Delay before retrying a task that has failed `attempts` times:
    /// `base * 2^(attempts - 1)`, capped at the maximum, with jitter applied
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_max_delay);

        if self.retry_jitter == 0.0 {
            return delay;
        }

        let base_secs = delay.as_secs_f64();
        let jitter_range = base_secs * self.retry_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        Duration::from_secs_f64((base_secs + jitter).max(0.0))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbConfig {
    /// Root directory for entries, metadata, index and refresh queue
    pub cache_root: PathBuf,

    pub staleness: StalenessConfig,

    pub fuzzy: FuzzyConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    /// Upper bound on concurrent calls to the remote source
    pub max_concurrent_fetches: usize,

    pub cleanup: CleanupConfig,

    pub refresh: RefreshConfig,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            staleness: StalenessConfig::default(),
            fuzzy: FuzzyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_concurrent_fetches: 3,
            cleanup: CleanupConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("ouroboros-kb"))
        .unwrap_or_else(|| PathBuf::from(".kb-cache"))
}

impl KbConfig {
    /// Create a new builder
    pub fn builder() -> KbConfigBuilder {
        KbConfigBuilder::default()
    }

    /// Defaults rooted at the given directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the environment.
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Recognised variables: `KB_CACHE_ROOT`, `KB_MAX_CACHE_SIZE_MB`,
    /// `KB_MAX_AGE_DAYS`, `KB_MIN_ACCESS_DAYS`, `KB_FUZZY_THRESHOLD`,
    /// `KB_MAX_CONCURRENT_FETCHES`, `KB_FAILURE_THRESHOLD`,
    /// `KB_RESET_TIMEOUT_SECS`, `KB_CALL_TIMEOUT_SECS`, `KB_AUTO_CLEANUP`.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let mut config = Self::default();

        if let Ok(root) = std::env::var("KB_CACHE_ROOT") {
            config.cache_root = PathBuf::from(root);
        }
        if let Some(mb) = env_parse::<u64>("KB_MAX_CACHE_SIZE_MB")? {
            config.cleanup.max_cache_size_bytes = mb.checked_mul(MIB).ok_or_else(|| {
                KbError::Config(format!("KB_MAX_CACHE_SIZE_MB is too large: {}", mb))
            })?;
        }
        if let Some(days) = env_parse("KB_MAX_AGE_DAYS")? {
            config.cleanup.max_age_days = days;
        }
        if let Some(days) = env_parse("KB_MIN_ACCESS_DAYS")? {
            config.cleanup.min_access_days = days;
        }
        if let Some(threshold) = env_parse("KB_FUZZY_THRESHOLD")? {
            config.fuzzy.threshold = threshold;
        }
        if let Some(n) = env_parse("KB_MAX_CONCURRENT_FETCHES")? {
            config.max_concurrent_fetches = n;
        }
        if let Some(n) = env_parse("KB_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(secs) = env_parse("KB_RESET_TIMEOUT_SECS")? {
            config.circuit_breaker.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("KB_CALL_TIMEOUT_SECS")? {
            config.circuit_breaker.call_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse("KB_AUTO_CLEANUP")? {
            config.cleanup.enable_auto_cleanup = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(KbError::Config(format!("{} must be between 0.0 and 1.0", name)))
            }
        };

        if self.cache_root.as_os_str().is_empty() {
            return Err(KbError::Config("cache_root must not be empty".to_string()));
        }

        let s = &self.staleness;
        if s.stable_max_age_days <= 0 || s.active_max_age_days <= 0 || s.critical_max_age_days <= 0 {
            return Err(KbError::Config(
                "staleness max ages must be greater than 0".to_string(),
            ));
        }

        unit("fuzzy.threshold", self.fuzzy.threshold)?;
        unit("fuzzy.substitute_threshold", self.fuzzy.substitute_threshold)?;
        unit("refresh.retry_jitter", self.refresh.retry_jitter)?;

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(KbError::Config(
                "circuit breaker thresholds must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_fetches == 0 {
            return Err(KbError::Config(
                "max_concurrent_fetches must be greater than 0".to_string(),
            ));
        }

        if self.cleanup.max_cache_size_bytes == 0 {
            return Err(KbError::Config(
                "max_cache_size_bytes must be greater than 0".to_string(),
            ));
        }

        if self.refresh.max_attempts == 0 {
            return Err(KbError::Config("refresh.max_attempts must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Create the cache root and make sure it is writable.
    ///
    /// This is the one failure the cache cannot recover from.
    pub fn ensure_cache_root(&self) -> Result<()> {
        ensure_writable_dir(&self.cache_root)
    }
}

fn ensure_writable_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        KbError::Config(format!("cannot create cache root {}: {}", dir.display(), e))
    })?;

    let check = dir.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
    std::fs::write(&check, b"ok").map_err(|e| {
        KbError::Config(format!("cache root {} is not writable: {}", dir.display(), e))
    })?;
    if let Err(e) = std::fs::remove_file(&check) {
        warn!("Failed to remove write check {}: {}", check.display(), e);
    }

    Ok(())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| KbError::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Builder for [`KbConfig`]
#[derive(Debug, Default)]
pub struct KbConfigBuilder {
    cache_root: Option<PathBuf>,
    staleness: Option<StalenessConfig>,
    fuzzy_threshold: Option<f64>,
    fuzzy_substitute_threshold: Option<f64>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    max_concurrent_fetches: Option<usize>,
    cleanup: Option<CleanupConfig>,
    refresh: Option<RefreshConfig>,
    library_types: Vec<(String, LibraryType)>,
}

impl KbConfigBuilder {
    /// Set the cache root directory
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Replace the staleness policy table
    pub fn staleness(mut self, staleness: StalenessConfig) -> Self {
        self.staleness = Some(staleness);
        self
    }

    /// Declare a library's classification explicitly
    pub fn library_type(mut self, library: impl Into<String>, kind: LibraryType) -> Self {
        self.library_types.push((library.into(), kind));
        self
    }

    /// Set the fuzzy match threshold
    pub fn fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = Some(threshold);
        self
    }

    /// Set the score at which fuzzy matches are served silently
    pub fn fuzzy_substitute_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_substitute_threshold = Some(threshold);
        self
    }

    /// Set circuit breaker settings
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set the remote concurrency limit
    pub fn max_concurrent_fetches(mut self, n: usize) -> Self {
        self.max_concurrent_fetches = Some(n);
        self
    }

    /// Set cleanup limits
    pub fn cleanup(mut self, config: CleanupConfig) -> Self {
        self.cleanup = Some(config);
        self
    }

    /// Set refresh retry behaviour
    pub fn refresh(mut self, config: RefreshConfig) -> Self {
        self.refresh = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> KbConfig {
        let defaults = KbConfig::default();

        let mut staleness = self.staleness.unwrap_or(defaults.staleness);
        for (library, kind) in self.library_types {
            staleness
                .library_types
                .insert(library.trim().to_lowercase(), kind);
        }

        let mut fuzzy = defaults.fuzzy;
        if let Some(threshold) = self.fuzzy_threshold {
            fuzzy.threshold = threshold;
        }
        if let Some(threshold) = self.fuzzy_substitute_threshold {
            fuzzy.substitute_threshold = threshold;
        }

        KbConfig {
            cache_root: self.cache_root.unwrap_or(defaults.cache_root),
            staleness,
            fuzzy,
            circuit_breaker: self.circuit_breaker.unwrap_or(defaults.circuit_breaker),
            max_concurrent_fetches: self
                .max_concurrent_fetches
                .unwrap_or(defaults.max_concurrent_fetches),
            cleanup: self.cleanup.unwrap_or(defaults.cleanup),
            refresh: self.refresh.unwrap_or(defaults.refresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = KbConfig::default();
        assert_eq!(config.fuzzy.threshold, 0.7);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.call_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_fetches, 3);
        assert_eq!(config.staleness.stable_max_age_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = KbConfig::default();
        invalid.fuzzy.threshold = 1.5;
        assert!(invalid.validate().is_err());

        let mut invalid = KbConfig::default();
        invalid.max_concurrent_fetches = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = KbConfig::default();
        invalid.staleness.critical_max_age_days = 0;
        assert!(matches!(invalid.validate(), Err(KbError::Config(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = KbConfig::builder()
            .cache_root("/tmp/kb")
            .fuzzy_threshold(0.8)
            .max_concurrent_fetches(5)
            .library_type("  MyAuthLib ", LibraryType::Critical)
            .build();

        assert_eq!(config.cache_root, PathBuf::from("/tmp/kb"));
        assert_eq!(config.fuzzy.threshold, 0.8);
        assert_eq!(config.max_concurrent_fetches, 5);
        assert_eq!(
            config.staleness.library_types.get("myauthlib"),
            Some(&LibraryType::Critical)
        );
    }

    #[test]
    fn test_cache_size_from_env() {
        std::env::set_var("KB_MAX_CACHE_SIZE_MB", "64");
        assert_eq!(
            KbConfig::from_env().unwrap().cleanup.max_cache_size_bytes,
            64 * 1024 * 1024
        );

        std::env::set_var("KB_MAX_CACHE_SIZE_MB", u64::MAX.to_string());
        let result = KbConfig::from_env();
        std::env::remove_var("KB_MAX_CACHE_SIZE_MB");
        assert!(matches!(result, Err(KbError::Config(_))));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = RefreshConfig {
            retry_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_secs(300));
        assert_eq!(config.retry_delay(2), Duration::from_secs(600));
        assert_eq!(config.retry_delay(3), Duration::from_secs(1200));
        assert_eq!(config.retry_delay(40), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let config = RefreshConfig::default();
        for _ in 0..50 {
            let delay = config.retry_delay(1).as_secs_f64();
            assert!((270.0..=330.0).contains(&delay));
        }
    }

    #[test]
    fn test_ensure_cache_root() {
        let tmp = TempDir::new().unwrap();
        let config = KbConfig::with_root(tmp.path().join("nested").join("cache"));
        config.ensure_cache_root().unwrap();
        assert!(config.cache_root.is_dir());
    }

    #[test]
    fn test_ensure_cache_root_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let config = KbConfig::with_root(&file);
        assert!(matches!(config.ensure_cache_root(), Err(KbError::Config(_))));
    }
}
