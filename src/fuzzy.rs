//! Approximate name matching for cache misses
//!
//! Similarity is normalised Levenshtein distance over lower-cased names:
//! `1 - distance / max_len`, so identical names score 1.0 and names with
//! nothing in common score close to 0.0.

use crate::cache::types::{normalize_key, CacheKey};
use crate::config::FuzzyConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Weight of the library score in a combined entry score
pub const LIBRARY_WEIGHT: f64 = 0.6;
/// Weight of the topic score in a combined entry score
pub const TOPIC_WEIGHT: f64 = 0.4;

/// Edit distance between two strings, counted in chars
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Case-insensitive similarity in [0.0, 1.0]
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_key(a);
    let b = normalize_key(b);

    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// A single-name match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

/// Which half of an entry key cleared the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Both,
    Library,
    Topic,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::Both => "both",
            MatchType::Library => "library",
            MatchType::Topic => "topic",
        };
        f.write_str(s)
    }
}

/// A (library, topic) match with its combined score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMatch {
    pub key: CacheKey,
    /// `0.6 * library_score + 0.4 * topic_score`
    pub score: f64,
    pub library_score: f64,
    pub topic_score: f64,
    pub match_type: MatchType,
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    threshold: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(FuzzyConfig::default().threshold)
    }
}

impl FuzzyMatcher {
    /// Threshold is clamped to [0.0, 1.0]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &FuzzyConfig) -> Self {
        Self::new(config.threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_match(&self, a: &str, b: &str) -> bool {
        similarity(a, b) >= self.threshold
    }

    /// Libraries similar to `query`, best first
    pub fn find_matching_library<I, S>(
        &self,
        query: &str,
        candidates: I,
        max_results: usize,
    ) -> Vec<FuzzyMatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rank(query, candidates, max_results)
    }

    /// Topics of `library` similar to `query`, best first
    pub fn find_matching_topic<I, S>(
        &self,
        query: &str,
        library: &str,
        candidates: I,
        max_results: usize,
    ) -> Vec<FuzzyMatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matches = self.rank(query, candidates, max_results);
        debug!(
            "Topic matches for {}/{}: {}",
            library,
            query,
            matches.len()
        );
        matches
    }

    /// Score (library, topic) pairs against both halves of a query.
    ///
    /// A pair is kept when either sub-score clears the threshold.
    pub fn find_matching_entry<'a, I>(
        &self,
        library_query: &str,
        topic_query: &str,
        candidates: I,
        max_results: usize,
    ) -> Vec<EntryMatch>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        if library_query.trim().is_empty() || max_results == 0 {
            return Vec::new();
        }

        let mut matches: Vec<EntryMatch> = candidates
            .into_iter()
            .filter_map(|key| {
                let library_score = similarity(library_query, &key.library);
                let topic_score = similarity(topic_query, &key.topic);

                let match_type = match (
                    library_score >= self.threshold,
                    topic_score >= self.threshold,
                ) {
                    (true, true) => MatchType::Both,
                    (true, false) => MatchType::Library,
                    (false, true) => MatchType::Topic,
                    (false, false) => return None,
                };

                Some(EntryMatch {
                    key: key.clone(),
                    score: LIBRARY_WEIGHT * library_score + TOPIC_WEIGHT * topic_score,
                    library_score,
                    topic_score,
                    match_type,
                })
            })
            .collect();

        matches.sort_by(|a, b| by_score(a.score, b.score).then_with(|| a.key.cmp(&b.key)));
        matches.truncate(max_results);
        matches
    }

    /// Highest-scoring candidate at or above the threshold
    pub fn get_best_match<I, S>(&self, query: &str, candidates: I) -> Option<FuzzyMatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rank(query, candidates, 1).into_iter().next()
    }

    fn rank<I, S>(&self, query: &str, candidates: I, max_results: usize) -> Vec<FuzzyMatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if query.trim().is_empty() || max_results == 0 {
            return Vec::new();
        }

        let mut matches: Vec<FuzzyMatch> = candidates
            .into_iter()
            .map(|c| FuzzyMatch {
                score: similarity(query, c.as_ref()),
                candidate: c.as_ref().to_string(),
            })
            .filter(|m| m.score >= self.threshold)
            .collect();

        matches.sort_by(|a, b| by_score(a.score, b.score).then_with(|| a.candidate.cmp(&b.candidate)));
        matches.truncate(max_results);
        matches
    }
}

fn by_score(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("React", "react"), 1.0);
        assert_eq!(similarity("", "react"), 0.0);
        assert!((similarity("react", "preact") - (1.0 - 1.0 / 6.0)).abs() < 1e-9);
        assert!(similarity("react", "django") < 0.5);
    }

    #[test]
    fn test_find_matching_library() {
        let matcher = FuzzyMatcher::default();
        let candidates = ["react", "preact", "react-dom", "vue"];

        let matches = matcher.find_matching_library("reactt", candidates, 5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, "react");
        assert!(matches[0].score >= 0.7);

        let matches = FuzzyMatcher::new(0.5).find_matching_library("react", candidates, 5);
        assert_eq!(matches[0].candidate, "react");
        assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(matcher.find_matching_library("", candidates, 5).is_empty());
        assert!(matcher.find_matching_library("react", Vec::<String>::new(), 5).is_empty());
    }

    #[test]
    fn test_max_results() {
        let matcher = FuzzyMatcher::new(0.0);
        let matches = matcher.find_matching_library("a", ["a", "b", "c", "d"], 2);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].candidate, "a");
    }

    #[test]
    fn test_find_matching_topic() {
        let matcher = FuzzyMatcher::default();
        let matches = matcher.find_matching_topic("hook", "react", ["hooks", "state", "routing"], 5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, "hooks");
    }

    #[test]
    fn test_combined_score_weights() {
        let matcher = FuzzyMatcher::new(0.0);
        let keys = vec![
            CacheKey::new("react", Some("hooks")),
            CacheKey::new("preact", Some("state")),
            CacheKey::new("vue", Some("hooks")),
        ];

        for m in matcher.find_matching_entry("react", "hook", &keys, 10) {
            let expected = 0.6 * m.library_score + 0.4 * m.topic_score;
            assert!((m.score - expected).abs() < 1e-9);
            assert_eq!(m.library_score, similarity("react", &m.key.library));
            assert_eq!(m.topic_score, similarity("hook", &m.key.topic));
        }
    }

    #[test]
    fn test_match_types() {
        let matcher = FuzzyMatcher::default();
        let keys = vec![
            CacheKey::new("react", Some("hooks")),
            CacheKey::new("react", Some("testing")),
            CacheKey::new("svelte", Some("hooks")),
            CacheKey::new("django", Some("models")),
        ];

        let matches = matcher.find_matching_entry("react", "hooks", &keys, 10);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].key, CacheKey::new("react", Some("hooks")));
        assert_eq!(matches[0].match_type, MatchType::Both);
        assert!((matches[0].score - 1.0).abs() < 1e-9);

        let by_key = |lib: &str, topic: &str| {
            matches
                .iter()
                .find(|m| m.key == CacheKey::new(lib, Some(topic)))
                .map(|m| m.match_type)
        };
        assert_eq!(by_key("react", "testing"), Some(MatchType::Library));
        assert_eq!(by_key("svelte", "hooks"), Some(MatchType::Topic));
        assert_eq!(by_key("django", "models"), None);
    }

    #[test]
    fn test_is_match_and_best_match() {
        let matcher = FuzzyMatcher::default();
        assert!(matcher.is_match("NextJS", "nextjs"));
        assert!(!matcher.is_match("next", "django"));

        let best = matcher.get_best_match("expres", ["express", "fastify"]).unwrap();
        assert_eq!(best.candidate, "express");
        assert!(matcher.get_best_match("zzz", ["express"]).is_none());
    }
}
