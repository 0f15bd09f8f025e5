//! Integration tests for the cache core
//!
//! These tests verify the store, staleness, fuzzy scoring, circuit breaker
//! and cleanup behaviour through the public API, including:
//! - Round-trips and hit counting
//! - Strict staleness boundaries
//! - Combined fuzzy scores
//! - Breaker rejection and fallback
//! - Size-based cleanup limits and idempotence
//! - Concurrent access from many tasks

use chrono::{Duration as ChronoDuration, Utc};
use ouroboros_kb::fuzzy::{similarity, LIBRARY_WEIGHT, TOPIC_WEIGHT};
use ouroboros_kb::{
    CacheKey, CacheStore, CircuitBreaker, CircuitBreakerConfig, CircuitState, CleanupConfig,
    CleanupEngine, FuzzyMatcher, KbError, SourceInfo, StalenessConfig, StalenessPolicyManager,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_store_get_scenario() {
    let dir = TempDir::new().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();

    let stored = assert_ok!(store.store("react", Some("hooks"), "# doc", SourceInfo::new()));
    assert_eq!(stored.hit_count, 0);

    let entry = store.get("react", Some("hooks")).unwrap();
    assert_eq!(entry.content, "# doc");
    assert_eq!(entry.hit_count, 1);
}

#[test]
fn test_round_trip_preserves_content() {
    let dir = TempDir::new().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();

    let samples = [
        "plain text",
        "# Heading\n\n```rust\nfn main() {}\n```\n",
        "---\nlooks like a separator\n---\n<!-- and a comment -->",
        "unicode: 日本語 ✓ émoji 🦀",
        "  leading and trailing whitespace  \n\n",
    ];

    for (i, content) in samples.iter().enumerate() {
        let topic = format!("sample{}", i);
        store
            .store("roundtrip", Some(&topic), content, SourceInfo::new())
            .unwrap();
        let entry = store.get("roundtrip", Some(&topic)).unwrap();
        assert_eq!(&entry.content, content, "content {} changed on disk", i);
    }
}

#[test]
fn test_staleness_scenario() {
    let policy = StalenessPolicyManager::new(StalenessConfig::default());
    let now = Utc::now();

    let old = (now - ChronoDuration::days(31)).to_rfc3339();
    let recent = (now - ChronoDuration::days(29)).to_rfc3339();
    assert!(policy.is_stale("react", &old, None, Some(now)));
    assert!(!policy.is_stale("react", &recent, None, Some(now)));

    // Exactly at the limit is not yet stale
    let boundary = now - ChronoDuration::days(30);
    assert!(!policy.evaluate("react", boundary, None, Some(now)).is_stale);
    assert!(
        policy
            .evaluate("react", boundary - ChronoDuration::seconds(1), None, Some(now))
            .is_stale
    );
}

#[test]
fn test_combined_score_weights() {
    let matcher = FuzzyMatcher::new(0.0);
    let candidates = vec![
        CacheKey::new("react", Some("hooks")),
        CacheKey::new("react-dom", Some("render")),
        CacheKey::new("preact", Some("hooks")),
        CacheKey::new("vue", Some("router")),
    ];

    let matches = matcher.find_matching_entry("reac", "hook", &candidates, 10);
    assert!(!matches.is_empty());
    for m in &matches {
        let expected = LIBRARY_WEIGHT * similarity("reac", &m.key.library)
            + TOPIC_WEIGHT * similarity("hook", &m.key.topic);
        assert!((m.score - expected).abs() < 1e-9);
    }
    assert_eq!(matches[0].key, CacheKey::new("react", Some("hooks")));
}

#[test]
fn test_circuit_breaker_scenario() {
    tokio_test::block_on(async {
        let breaker = CircuitBreaker::new(
            "scenario",
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
        );
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result: ouroboros_kb::Result<()> = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(KbError::RemoteUnavailable("down".to_string()))
                })
                .await;
            assert_err!(result);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let value = breaker
            .call_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("remote")
                },
                "fallback",
            )
            .await;
        assert_eq!(value, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.stats().rejected_requests, 1);
    });
}

#[tokio::test]
async fn test_circuit_breaker_half_open_trial() {
    let breaker = CircuitBreaker::new(
        "half-open",
        CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_millis(50),
            call_timeout: Duration::from_secs(1),
        },
    );

    let _ = breaker
        .call(|| async { Err::<(), _>(KbError::RemoteUnavailable("down".into())) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let value = breaker.call(|| async { Ok(42) }).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

fn fill(store: &CacheStore, library: &str, count: usize, size: usize) {
    for i in 0..count {
        store
            .store(
                library,
                Some(&format!("topic{}", i)),
                &"x".repeat(size),
                SourceInfo::new(),
            )
            .unwrap();
    }
}

#[test]
fn test_cleanup_by_size_limits() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    fill(&store, "bulk", 10, 2_000);

    let engine = CleanupEngine::new(
        store.clone(),
        Arc::new(StalenessPolicyManager::default()),
        CleanupConfig::default(),
    );

    let before = store.total_size_bytes();
    let entry_size = before / 10;
    let target = before / 2;

    let result = engine.cleanup_by_size(Some(target), false).unwrap();
    let after = store.total_size_bytes();

    assert!(after <= target);
    assert_eq!(result.bytes_freed, before - after);
    // Never more than one entry beyond what was needed
    assert!(result.bytes_freed < (before - target) + entry_size + entry_size / 10);

    let second = engine.cleanup_by_size(Some(target), false).unwrap();
    assert_eq!(second.entries_removed, 0);
    assert_eq!(store.total_size_bytes(), after);
}

#[test]
fn test_cleanup_recommendations_do_not_remove() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());
    fill(&store, "bulk", 4, 1_000);

    let engine = CleanupEngine::new(
        store.clone(),
        Arc::new(StalenessPolicyManager::default()),
        CleanupConfig {
            max_cache_size_bytes: 1_000,
            max_entries: 2,
            ..Default::default()
        },
    );

    let recs = engine.get_cleanup_recommendations();
    assert!(recs.over_size_limit);
    assert_eq!(recs.total_entries, 4);
    assert!(!recs.recommendations.is_empty());
    assert_eq!(store.scan().len(), 4);
}

#[tokio::test]
async fn test_concurrent_access_across_libraries() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(dir.path()).unwrap());

    let writers = (0..8).map(|i| {
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            for t in 0..5 {
                store
                    .store(
                        &format!("lib{}", i % 4),
                        Some(&format!("topic{}-{}", i, t)),
                        &format!("content {} {}", i, t),
                        SourceInfo::new(),
                    )
                    .unwrap();
                store.get(&format!("lib{}", i % 4), Some(&format!("topic{}-{}", i, t)));
            }
        })
    });
    for joined in futures::future::join_all(writers).await {
        joined.unwrap();
    }

    assert_eq!(store.scan().len(), 40);
    let index = store.index().load_cache_index().unwrap();
    assert_eq!(index.total_entries, 40);
    assert_eq!(index.library_names().len(), 4);

    let stats = store.stats();
    assert_eq!(stats.stores, 40);
    assert_eq!(stats.hits, 40);
}
