//! Staleness policies
//!
//! Each library maps to a [`LibraryType`], either declared in
//! configuration or inferred from its name by [`classify_library`], and
//! each type has a maximum age. An entry is stale once its age is
//! strictly greater than that maximum.

use crate::cache::types::{normalize_key, parse_timestamp};
use crate::config::StalenessConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: i64 = 86_400;

const CRITICAL_KEYWORDS: &[&str] = &["security", "auth", "jwt", "crypto", "oauth", "ssl"];
const ACTIVE_KEYWORDS: &[&str] = &["test", "mock", "spec", "beta", "dev"];

/// Library classification driving the maximum age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    /// Mature, slow-moving APIs
    Stable,
    /// Fast-moving: test tooling, pre-releases
    Active,
    /// Security-sensitive
    Critical,
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LibraryType::Stable => "stable",
            LibraryType::Active => "active",
            LibraryType::Critical => "critical",
        };
        f.write_str(name)
    }
}

impl FromStr for LibraryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stable" => Ok(LibraryType::Stable),
            "active" => Ok(LibraryType::Active),
            "critical" => Ok(LibraryType::Critical),
            other => Err(format!("unknown library type: {}", other)),
        }
    }
}

/// Infer a classification from a library name
pub fn classify_library(name: &str) -> LibraryType {
    let name = normalize_key(name);
    if CRITICAL_KEYWORDS.iter().any(|k| name.contains(k)) {
        LibraryType::Critical
    } else if ACTIVE_KEYWORDS.iter().any(|k| name.contains(k)) {
        LibraryType::Active
    } else {
        LibraryType::Stable
    }
}

/// Effective policy for one library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessPolicy {
    pub max_age_days: i64,
    pub library_type: LibraryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Refresh,
    ConsiderRefresh,
    Keep,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::Refresh => "refresh",
            Recommendation::ConsiderRefresh => "consider_refresh",
            Recommendation::Keep => "keep",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecommendation {
    pub is_stale: bool,
    /// Whole days left before the entry goes stale; negative once it has
    pub days_until_stale: i64,
    pub recommendation: Recommendation,
    pub policy: StalenessPolicy,
}

/// Evaluates entry ages against the configured policy table
#[derive(Debug, Clone, Default)]
pub struct StalenessPolicyManager {
    config: StalenessConfig,
}

impl StalenessPolicyManager {
    pub fn new(config: StalenessConfig) -> Self {
        Self { config }
    }

    /// Maximum age for a classification
    pub fn max_age_days(&self, library_type: LibraryType) -> i64 {
        match library_type {
            LibraryType::Stable => self.config.stable_max_age_days,
            LibraryType::Active => self.config.active_max_age_days,
            LibraryType::Critical => self.config.critical_max_age_days,
        }
    }

    /// Classification for a library: the argument, then configuration,
    /// then name inference
    pub fn library_type(&self, library: &str, declared: Option<LibraryType>) -> LibraryType {
        declared
            .or_else(|| self.config.library_types.get(&normalize_key(library)).copied())
            .unwrap_or_else(|| classify_library(library))
    }

    pub fn policy_for(&self, library: &str, declared: Option<LibraryType>) -> StalenessPolicy {
        let library_type = self.library_type(library, declared);
        StalenessPolicy {
            max_age_days: self.max_age_days(library_type),
            library_type,
        }
    }

    /// Whether an entry last updated at `last_updated` is stale.
    ///
    /// An unparseable timestamp counts as stale.
    pub fn is_stale(
        &self,
        library: &str,
        last_updated: &str,
        declared: Option<LibraryType>,
        now: Option<DateTime<Utc>>,
    ) -> bool {
        match parse_timestamp(last_updated) {
            Some(ts) => self.evaluate(library, ts, declared, now).is_stale,
            None => true,
        }
    }

    /// Whole days until stale; unparseable timestamps read as long stale
    pub fn days_until_stale(
        &self,
        library: &str,
        last_updated: &str,
        declared: Option<LibraryType>,
        now: Option<DateTime<Utc>>,
    ) -> i64 {
        self.refresh_recommendation(library, last_updated, declared, now)
            .days_until_stale
    }

    pub fn refresh_recommendation(
        &self,
        library: &str,
        last_updated: &str,
        declared: Option<LibraryType>,
        now: Option<DateTime<Utc>>,
    ) -> RefreshRecommendation {
        match parse_timestamp(last_updated) {
            Some(ts) => self.evaluate(library, ts, declared, now),
            None => {
                let policy = self.policy_for(library, declared);
                RefreshRecommendation {
                    is_stale: true,
                    days_until_stale: -policy.max_age_days,
                    recommendation: Recommendation::Refresh,
                    policy,
                }
            }
        }
    }

    /// Typed evaluation used by the refresh and cleanup paths
    pub fn evaluate(
        &self,
        library: &str,
        last_updated: DateTime<Utc>,
        declared: Option<LibraryType>,
        now: Option<DateTime<Utc>>,
    ) -> RefreshRecommendation {
        let now = now.unwrap_or_else(Utc::now);
        let policy = self.policy_for(library, declared);

        let age = now - last_updated;
        let remaining = Duration::days(policy.max_age_days) - age;
        let is_stale = remaining < Duration::zero();
        let mut secs = remaining.num_seconds();
        if is_stale {
            secs = secs.min(-1);
        }
        let days_until_stale = secs.div_euclid(SECONDS_PER_DAY);

        let recommendation = if is_stale {
            Recommendation::Refresh
        } else if days_until_stale <= self.config.consider_window_days {
            Recommendation::ConsiderRefresh
        } else {
            Recommendation::Keep
        };

        RefreshRecommendation {
            is_stale,
            days_until_stale,
            recommendation,
            policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::format_timestamp;
    use chrono::SubsecRound;

    // Whole seconds, so formatted timestamps parse back exactly
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }

    fn manager() -> StalenessPolicyManager {
        StalenessPolicyManager::default()
    }

    fn days_ago(now: DateTime<Utc>, days: i64) -> String {
        format_timestamp(&(now - Duration::days(days)))
    }

    #[test]
    fn test_classify_library() {
        assert_eq!(classify_library("jsonwebtoken-jwt"), LibraryType::Critical);
        assert_eq!(classify_library("next-auth"), LibraryType::Critical);
        assert_eq!(classify_library("jest-mock"), LibraryType::Active);
        assert_eq!(classify_library("Testing-Library"), LibraryType::Active);
        assert_eq!(classify_library("react"), LibraryType::Stable);
    }

    #[test]
    fn test_declared_type_wins() {
        let mut config = StalenessConfig::default();
        config.library_types.insert("react".into(), LibraryType::Critical);
        let manager = StalenessPolicyManager::new(config);

        assert_eq!(manager.library_type("React", None), LibraryType::Critical);
        assert_eq!(
            manager.library_type("react", Some(LibraryType::Active)),
            LibraryType::Active
        );
        assert_eq!(manager.policy_for("react", None).max_age_days, 7);
    }

    #[test]
    fn test_is_stale_scenarios() {
        let now = now();
        let m = manager();
        assert!(m.is_stale("react", &days_ago(now, 31), Some(LibraryType::Stable), Some(now)));
        assert!(!m.is_stale("react", &days_ago(now, 29), Some(LibraryType::Stable), Some(now)));
    }

    #[test]
    fn test_boundary_is_not_stale() {
        let now = now();
        let m = manager();
        for (library_type, max) in [
            (LibraryType::Stable, 30),
            (LibraryType::Active, 14),
            (LibraryType::Critical, 7),
        ] {
            let exact = now - Duration::days(max);
            assert!(!m.evaluate("x", exact, Some(library_type), Some(now)).is_stale);
            let past = exact - Duration::seconds(1);
            assert!(m.evaluate("x", past, Some(library_type), Some(now)).is_stale);
        }
    }

    #[test]
    fn test_unparseable_timestamp_is_stale() {
        let m = manager();
        assert!(m.is_stale("react", "not a date", None, None));
        let rec = m.refresh_recommendation("react", "", None, None);
        assert_eq!(rec.recommendation, Recommendation::Refresh);
        assert!(rec.days_until_stale < 0);
    }

    #[test]
    fn test_days_until_stale() {
        let now = now();
        let m = manager();
        assert_eq!(m.days_until_stale("react", &days_ago(now, 20), None, Some(now)), 10);
        assert_eq!(m.days_until_stale("react", &days_ago(now, 30), None, Some(now)), 0);
        assert_eq!(m.days_until_stale("react", &days_ago(now, 35), None, Some(now)), -5);
    }

    #[test]
    fn test_recommendations() {
        let now = now();
        let m = manager();
        let rec = |days| m.refresh_recommendation("react", &days_ago(now, days), None, Some(now));

        assert_eq!(rec(40).recommendation, Recommendation::Refresh);
        assert_eq!(rec(25).recommendation, Recommendation::ConsiderRefresh);
        assert_eq!(rec(23).recommendation, Recommendation::ConsiderRefresh);
        assert_eq!(rec(5).recommendation, Recommendation::Keep);
        assert_eq!(Recommendation::ConsiderRefresh.to_string(), "consider_refresh");
    }

    #[test]
    fn test_library_type_parsing() {
        assert_eq!("Critical".parse::<LibraryType>(), Ok(LibraryType::Critical));
        assert!("unknown".parse::<LibraryType>().is_err());
    }
}
