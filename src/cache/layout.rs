//! On-disk layout of the cache root
//!
//! ```text
//! <root>/index.json
//! <root>/refresh_queue.json
//! <root>/libraries/<lib>/<topic>.md
//! <root>/metadata/<lib>/library.json
//! ```

use crate::cache::types::CacheKey;
use std::path::{Path, PathBuf};

pub const ENTRY_EXTENSION: &str = "md";

/// Path derivation for everything under the cache root
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn refresh_queue_file(&self) -> PathBuf {
        self.root.join("refresh_queue.json")
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.root.join("libraries")
    }

    pub fn library_dir(&self, library: &str) -> PathBuf {
        self.libraries_dir().join(slug(library))
    }

    pub fn entry_file(&self, key: &CacheKey) -> PathBuf {
        self.library_dir(&key.library)
            .join(format!("{}.{}", slug(&key.topic), ENTRY_EXTENSION))
    }

    pub fn metadata_dir(&self, library: &str) -> PathBuf {
        self.root.join("metadata").join(slug(library))
    }

    pub fn library_metadata_file(&self, library: &str) -> PathBuf {
        self.metadata_dir(library).join("library.json")
    }
}

/// File-system safe form of an (already lower-cased) key component.
///
/// Bytes outside `[a-z0-9._-]` become `%XX`, as does a leading dot, so
/// distinct names never share a path and no name maps to `.` or `..`.
pub fn slug(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }

    let mut slug = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        match byte {
            b'.' if i == 0 => slug.push_str("%2E"),
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => slug.push(byte as char),
            _ => slug.push_str(&format!("%{:02X}", byte)),
        }
    }
    slug
}

/// Inverse of [`slug`]; `None` for names [`slug`] never produces
pub fn unslug(slug: &str) -> Option<String> {
    if slug == "%" {
        return Some(String::new());
    }

    let raw = slug.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = std::str::from_utf8(raw.get(i + 1..i + 3)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}
