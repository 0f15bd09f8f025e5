//! Cache entry documents
//!
//! Each entry is a Markdown file: a heading, a human-readable metadata
//! block, the raw documentation between two `---` separators, and a
//! trailing HTML comment with every field in `key: value` form. Only the
//! trailer is read back; the header is regenerated on every write.

use crate::cache::types::{format_timestamp, parse_timestamp, CacheKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HEADER_END: &str = "\n\n---\n\n";
const TRAILER_START: &str = "\n\n---\n<!-- ouroboros-kb:entry\n";
const TRAILER_END: &str = "-->";

/// One cached documentation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub library: String,
    pub topic: String,
    pub content: String,
    pub source_id: Option<String>,
    pub trust_score: Option<f64>,
    pub snippet_count: u32,
    pub token_count: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: u64,
}

/// Why an entry document could not be read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("metadata trailer not found")]
    MissingTrailer,

    #[error("trailer is not terminated")]
    UnterminatedTrailer,

    #[error("content separator not found")]
    MissingSeparator,

    #[error("required field missing: {0}")]
    MissingField(&'static str),
}

impl CacheEntry {
    /// Create a fresh entry cached now
    pub fn new(key: &CacheKey, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();

        Self {
            library: key.library.clone(),
            topic: key.topic.clone(),
            token_count: estimate_tokens(&content),
            content,
            source_id: None,
            trust_score: None,
            snippet_count: 0,
            cached_at: now,
            last_accessed: now,
            hit_count: 0,
        }
    }

    pub fn with_source_id(mut self, source_id: Option<String>) -> Self {
        self.source_id = source_id;
        self
    }

    /// Trust scores outside 0.0 - 1.0 are clamped
    pub fn with_trust_score(mut self, trust_score: Option<f64>) -> Self {
        self.trust_score = trust_score.map(|t| t.clamp(0.0, 1.0));
        self
    }

    pub fn with_snippet_count(mut self, snippet_count: u32) -> Self {
        self.snippet_count = snippet_count;
        self
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            library: self.library.clone(),
            topic: self.topic.clone(),
        }
    }

    /// Record a read
    pub fn mark_accessed(&mut self) {
        self.last_accessed = Utc::now().max(self.last_accessed);
        self.hit_count += 1;
    }

    /// Age of the content relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.cached_at
    }

    /// Time since the entry was last read (or written)
    pub fn idle_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_accessed
    }

    /// Render the on-disk document
    pub fn to_document(&self) -> String {
        let source = self.source_id.as_deref().map(one_line);
        let source_value = self.source_id.as_deref().map(trailer_value);
        let trust = self
            .trust_score
            .map(|t| format!("{:.2}", t))
            .unwrap_or_else(|| "unknown".to_string());

        let mut doc = String::with_capacity(self.content.len() + 512);
        doc.push_str(&format!(
            "# {} / {}\n\n",
            one_line(&self.library),
            one_line(&self.topic)
        ));
        doc.push_str(&format!(
            "- **Source**: {}\n",
            source.as_deref().unwrap_or("unknown")
        ));
        doc.push_str(&format!("- **Trust score**: {}\n", trust));
        doc.push_str(&format!("- **Snippet count**: {}\n", self.snippet_count));
        doc.push_str(&format!("- **Token count**: {}\n", self.token_count));
        doc.push_str(&format!(
            "- **Last updated**: {}\n",
            self.cached_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        doc.push_str(&format!("- **Cache hits**: {}", self.hit_count));

        doc.push_str(HEADER_END);
        doc.push_str(&self.content);
        doc.push_str(TRAILER_START);

        let mut field = |k: &str, v: &str| doc.push_str(&format!("{}: {}\n", k, v));
        field("library", &trailer_value(&self.library));
        field("topic", &trailer_value(&self.topic));
        if let Some(source) = &source_value {
            field("source_id", source);
        }
        if let Some(trust) = self.trust_score {
            field("trust_score", &trust.to_string());
        }
        field("snippet_count", &self.snippet_count.to_string());
        field("token_count", &self.token_count.to_string());
        field("cached_at", &format_timestamp(&self.cached_at));
        field("last_accessed", &format_timestamp(&self.last_accessed));
        field("hit_count", &self.hit_count.to_string());

        doc.push_str(TRAILER_END);
        doc.push('\n');
        doc
    }
}

/// Parse an entry document.
///
/// Unknown or malformed optional fields fall back to defaults; only a
/// missing trailer, separator, library or topic makes the entry corrupt.
pub fn parse_entry(document: &str) -> Result<CacheEntry, ParseError> {
    let trailer_at = document
        .rfind(TRAILER_START)
        .ok_or(ParseError::MissingTrailer)?;
    let trailer = &document[trailer_at + TRAILER_START.len()..];
    let trailer = &trailer[..trailer.find(TRAILER_END).ok_or(ParseError::UnterminatedTrailer)?];

    let content_start = document
        .find(HEADER_END)
        .map(|i| i + HEADER_END.len())
        .filter(|&start| start <= trailer_at)
        .ok_or(ParseError::MissingSeparator)?;
    let content = document[content_start..trailer_at].to_string();

    let mut library = None;
    let mut topic = None;
    let mut source_id = None;
    let mut trust_score = None;
    let mut snippet_count = None;
    let mut token_count = None;
    let mut cached_at = None;
    let mut last_accessed = None;
    let mut hit_count = None;

    for line in trailer.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "library" if !value.is_empty() => library = Some(unescape(value)),
            "topic" if !value.is_empty() => topic = Some(unescape(value)),
            "source_id" if !value.is_empty() => source_id = Some(unescape(value)),
            "trust_score" => trust_score = value.parse::<f64>().ok().filter(|t| t.is_finite()),
            "snippet_count" => snippet_count = value.parse().ok(),
            "token_count" => token_count = value.parse().ok(),
            "cached_at" => cached_at = parse_timestamp(value),
            "last_accessed" => last_accessed = parse_timestamp(value),
            "hit_count" => hit_count = value.parse().ok(),
            _ => {}
        }
    }

    // An unknown cache time reads as very old, so the entry gets refreshed.
    let cached_at = cached_at.unwrap_or_else(unix_epoch);

    Ok(CacheEntry {
        library: library.ok_or(ParseError::MissingField("library"))?,
        topic: topic.ok_or(ParseError::MissingField("topic"))?,
        token_count: token_count.unwrap_or_else(|| estimate_tokens(&content)),
        content,
        source_id,
        trust_score: trust_score.map(|t| t.clamp(0.0, 1.0)),
        snippet_count: snippet_count.unwrap_or(0),
        cached_at,
        last_accessed: last_accessed.unwrap_or(cached_at),
        hit_count: hit_count.unwrap_or(0),
    })
}

/// Rough token estimate: four characters per token
pub fn estimate_tokens(content: &str) -> u64 {
    (content.chars().count() / 4) as u64
}

pub(crate) fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

fn one_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

/// Trailer form of a text field: one line, and `>` escaped so the value
/// can never close the comment
fn trailer_value(s: &str) -> String {
    one_line(s).replace('\\', "\\\\").replace('>', "\\>")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            _ => out.push(c),
        }
    }
    out
}
