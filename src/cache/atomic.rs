//! Atomic file replacement (write to a sibling temp file, then rename)

use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Write `contents` to `path` so readers see either the old file or the
/// complete new one, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_sibling(path);

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written.and_then(|_| fs::rename(&tmp_path, path)) {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", tmp_path.display(), cleanup);
            }
        }
        return Err(e.into());
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

/// Temp files are hidden siblings so directory scans can skip them
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp"))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}
