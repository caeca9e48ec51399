use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use quill_core::write_text_atomic;
use serde::{Deserialize, Serialize};

pub const SCHEDULE_STATE_SCHEMA_VERSION: u32 = 1;

fn schedule_state_schema_version() -> u32 {
    SCHEDULE_STATE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutCursor {
    pub cursor: usize,
    pub last_run_tick: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Marks the bucket occurrence a skill last fetched successfully.
pub struct SuccessfulBucket {
    pub bucket_key: String,
    pub bucket_started_unix_ms: u64,
    pub fetched_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    #[serde(default = "schedule_state_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub tick_count: u64,
    #[serde(default)]
    pub cursors: BTreeMap<String, FanOutCursor>,
    #[serde(default)]
    pub last_successful: BTreeMap<String, SuccessfulBucket>,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            schema_version: SCHEDULE_STATE_SCHEMA_VERSION,
            tick_count: 0,
            cursors: BTreeMap::new(),
            last_successful: BTreeMap::new(),
        }
    }
}

pub fn load_schedule_state(path: &Path) -> Result<ScheduleState> {
    if !path.exists() {
        return Ok(ScheduleState::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state = serde_json::from_str::<ScheduleState>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if state.schema_version != SCHEDULE_STATE_SCHEMA_VERSION {
        bail!(
            "unsupported schedule state schema_version {} in {} (expected {})",
            state.schema_version,
            path.display(),
            SCHEDULE_STATE_SCHEMA_VERSION
        );
    }
    Ok(state)
}

pub fn save_schedule_state(path: &Path, state: &ScheduleState) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(state).context("failed to encode schedule state")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

#[cfg(test)]
mod tests {
    use super::{
        load_schedule_state, save_schedule_state, FanOutCursor, ScheduleState, SuccessfulBucket,
    };

    #[test]
    fn functional_state_round_trips_and_defaults_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scheduler/state.json");
        assert_eq!(load_schedule_state(&path).expect("missing"), ScheduleState::default());

        let mut state = ScheduleState {
            tick_count: 7,
            ..ScheduleState::default()
        };
        state.cursors.insert(
            "topics".to_string(),
            FanOutCursor {
                cursor: 2,
                last_run_tick: Some(6),
            },
        );
        state.last_successful.insert(
            "trending".to_string(),
            SuccessfulBucket {
                bucket_key: "09".to_string(),
                bucket_started_unix_ms: 1_000,
                fetched_unix_ms: 1_500,
            },
        );
        save_schedule_state(&path, &state).expect("save");
        let loaded = load_schedule_state(&path).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn regression_unknown_schema_version_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        std::fs::write(&path, r#"{"schema_version":99}"#).expect("write");
        let error = load_schedule_state(&path).expect_err("schema mismatch");
        assert!(error.to_string().contains("unsupported schedule state schema_version"));
    }
}
