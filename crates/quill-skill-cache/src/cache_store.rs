//! Per-skill persistence of bucket maps.
//!
//! Each skill owns one JSON object mapping `bucketKey -> {content, generatedAt}`.
//! Entries that fail to decode are skipped so older or newer writers never make
//! a whole file unreadable.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quill_core::{lock_unpoisoned, remove_file_if_exists, write_text_atomic};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CACHE_FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Latest successful result for one (skill, bucket) pair.
pub struct CacheEntry {
    pub skill_id: String,
    pub bucket_key: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

/// In-memory bucket map of one skill, keyed by bucket label.
pub type BucketMap = BTreeMap<String, CacheEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedBucket {
    content: String,
    generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedBuckets {
    pub buckets: BucketMap,
    pub malformed_buckets: usize,
}

/// Storage backend for per-skill bucket maps.
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    fn load(&self, skill_id: &str) -> Result<Option<LoadedBuckets>>;
    fn save(&self, skill_id: &str, buckets: &BucketMap) -> Result<()>;
    fn remove(&self, skill_id: &str) -> Result<()>;
}

pub fn encode_bucket_map(buckets: &BucketMap) -> Result<String> {
    let persisted = buckets
        .iter()
        .map(|(key, entry)| {
            (
                key.clone(),
                PersistedBucket {
                    content: entry.content.clone(),
                    generated_at: entry.generated_at,
                },
            )
        })
        .collect::<BTreeMap<_, _>>();
    let mut encoded =
        serde_json::to_string_pretty(&persisted).context("failed to encode bucket map")?;
    encoded.push('\n');
    Ok(encoded)
}

pub fn decode_bucket_map(skill_id: &str, raw: &str) -> Result<LoadedBuckets> {
    let object = serde_json::from_str::<BTreeMap<String, Value>>(raw)
        .context("cache file is not a JSON object")?;
    let mut loaded = LoadedBuckets::default();
    for (bucket_key, value) in object {
        match serde_json::from_value::<PersistedBucket>(value) {
            Ok(bucket) => {
                loaded.buckets.insert(
                    bucket_key.clone(),
                    CacheEntry {
                        skill_id: skill_id.to_string(),
                        bucket_key,
                        content: bucket.content,
                        generated_at: bucket.generated_at,
                    },
                );
            }
            Err(_) => loaded.malformed_buckets = loaded.malformed_buckets.saturating_add(1),
        }
    }
    Ok(loaded)
}

/// Maps a skill id onto a file-name-safe stem (`topics:ai` -> `topics%3Aai`).
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, so distinct ids never
/// share a file.
pub fn skill_file_stem(skill_id: &str) -> String {
    let mut stem = String::with_capacity(skill_id.len());
    for byte in skill_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[derive(Debug, Clone)]
/// Stores each skill's bucket map as `<dir>/<skill>.json`.
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn skill_path(&self, skill_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{CACHE_FILE_EXTENSION}", skill_file_stem(skill_id)))
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self, skill_id: &str) -> Result<Option<LoadedBuckets>> {
        let path = self.skill_path(skill_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        decode_bucket_map(skill_id, &raw)
            .with_context(|| format!("failed to decode {}", path.display()))
            .map(Some)
    }

    fn save(&self, skill_id: &str, buckets: &BucketMap) -> Result<()> {
        write_text_atomic(&self.skill_path(skill_id), &encode_bucket_map(buckets)?)
    }

    fn remove(&self, skill_id: &str) -> Result<()> {
        remove_file_if_exists(&self.skill_path(skill_id)).map(|_| ())
    }
}

#[derive(Debug, Default)]
/// Keeps encoded files in memory; used where disk I/O is unwanted.
pub struct MemoryCacheStore {
    files: Mutex<HashMap<String, String>>,
    saves: Mutex<usize>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the raw file body for a skill, as if written by another process.
    pub fn insert_raw(&self, skill_id: &str, raw: impl Into<String>) {
        lock_unpoisoned(&self.files).insert(skill_file_stem(skill_id), raw.into());
    }

    pub fn raw(&self, skill_id: &str) -> Option<String> {
        lock_unpoisoned(&self.files)
            .get(&skill_file_stem(skill_id))
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        *lock_unpoisoned(&self.saves)
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, skill_id: &str) -> Result<Option<LoadedBuckets>> {
        match self.raw(skill_id) {
            Some(raw) => decode_bucket_map(skill_id, &raw).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, skill_id: &str, buckets: &BucketMap) -> Result<()> {
        let encoded = encode_bucket_map(buckets)?;
        lock_unpoisoned(&self.files).insert(skill_file_stem(skill_id), encoded);
        *lock_unpoisoned(&self.saves) += 1;
        Ok(())
    }

    fn remove(&self, skill_id: &str) -> Result<()> {
        lock_unpoisoned(&self.files).remove(&skill_file_stem(skill_id));
        Ok(())
    }
}
