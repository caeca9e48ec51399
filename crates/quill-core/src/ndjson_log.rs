use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_NDJSON_ROTATION_MAX_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_NDJSON_ROTATION_MAX_FILES: usize = 4;
const NDJSON_ROTATION_MAX_BYTES_ENV: &str = "QUILL_LOG_ROTATION_MAX_BYTES";
const NDJSON_ROTATION_MAX_FILES_ENV: &str = "QUILL_LOG_ROTATION_MAX_FILES";

/// Size-based rotation limits for append-only NDJSON logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdjsonRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for NdjsonRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_NDJSON_ROTATION_MAX_BYTES,
            max_files: DEFAULT_NDJSON_ROTATION_MAX_FILES,
        }
    }
}

impl NdjsonRotationPolicy {
    /// Reads `QUILL_LOG_ROTATION_MAX_BYTES` / `QUILL_LOG_ROTATION_MAX_FILES`,
    /// falling back to defaults for missing, zero, or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env_value(NDJSON_ROTATION_MAX_BYTES_ENV)
                .unwrap_or(defaults.max_bytes),
            max_files: positive_env_value(NDJSON_ROTATION_MAX_FILES_ENV)
                .unwrap_or(defaults.max_files),
        }
    }

    fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

fn positive_env_value<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Appends one NDJSON line to `path`, rotating first when the line would
/// push the active file past `policy.max_bytes`.
pub fn append_ndjson_line(path: &Path, line: &str, policy: NdjsonRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() && path.exists() {
        let active_size = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if active_size.saturating_add(incoming) > policy.max_bytes {
            rotate_ndjson_file(path, policy)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

/// Path of the `index`-th rotated backup (`events.jsonl.1`, `events.jsonl.2`, ...).
pub fn rotated_ndjson_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

fn rotate_ndjson_file(path: &Path, policy: NdjsonRotationPolicy) -> Result<()> {
    if policy.max_files <= 1 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to rotate {}", path.display()));
    }

    for index in (1..policy.max_files).rev() {
        let source = if index == 1 {
            path.to_path_buf()
        } else {
            rotated_ndjson_path(path, index - 1)
        };
        if !source.exists() {
            continue;
        }
        let destination = rotated_ndjson_path(path, index);
        if destination.exists() {
            std::fs::remove_file(&destination)
                .with_context(|| format!("failed to replace {}", destination.display()))?;
        }
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                source.display(),
                destination.display()
            )
        })?;
    }
    Ok(())
}
