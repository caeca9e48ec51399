//! Proactive fetch loop that keeps tracked skills' current buckets filled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use quill_core::{append_ndjson_line, current_unix_timestamp_ms, unix_ms_from_datetime, NdjsonRotationPolicy};
use quill_skill_cache::{SkillExecutionCoordinator, SkillJobErrorKind};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::plan::{FetchPlan, ScheduledSkill};
use crate::state::{load_schedule_state, save_schedule_state, ScheduleState, SuccessfulBucket};
use crate::ticker::Ticker;

pub const FETCH_SCHEDULER_STATE_FILE: &str = "state.json";
pub const FETCH_SCHEDULER_EVENTS_LOG_FILE: &str = "events.jsonl";
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

const FETCH_REASON_BUCKET_FRESH: &str = "fetch_bucket_fresh";
const FETCH_REASON_SUCCEEDED: &str = "fetch_succeeded";
const FETCH_REASON_JOINED_CACHED: &str = "fetch_joined_cached_result";
const FETCH_REASON_RETRIES_EXHAUSTED: &str = "fetch_retries_exhausted";
const FETCH_REASON_NON_RETRYABLE: &str = "fetch_non_retryable_error";
const FETCH_REASON_UNKNOWN_SKILL: &str = "fetch_unknown_skill";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSchedulerConfig {
    pub state_dir: PathBuf,
    pub retry: RetryPolicy,
    pub rotation: NdjsonRotationPolicy,
}

impl FetchSchedulerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            retry: RetryPolicy::default(),
            rotation: NdjsonRotationPolicy::from_env(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(FETCH_SCHEDULER_STATE_FILE)
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.state_dir.join(FETCH_SCHEDULER_EVENTS_LOG_FILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    CatchUp,
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Fresh,
    Fetched,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillFetchOutcome {
    pub skill_id: String,
    pub group: Option<String>,
    pub status: FetchStatus,
    pub reason_code: String,
    pub attempts: usize,
    pub bucket_key: Option<String>,
    pub error_kind: Option<SkillJobErrorKind>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// One line of `events.jsonl`.
pub struct FetchCycleReport {
    pub trigger: CycleTrigger,
    pub tick: u64,
    pub started_unix_ms: u64,
    pub finished_unix_ms: u64,
    pub fetched: usize,
    pub fresh: usize,
    pub failed: usize,
    pub outcomes: Vec<SkillFetchOutcome>,
}

impl FetchCycleReport {
    pub fn outcome(&self, skill_id: &str) -> Option<&SkillFetchOutcome> {
        self.outcomes.iter().find(|outcome| outcome.skill_id == skill_id)
    }
}

#[derive(Debug)]
pub struct FetchScheduler {
    config: FetchSchedulerConfig,
    plan: FetchPlan,
    coordinator: SkillExecutionCoordinator,
    state: ScheduleState,
}

impl FetchScheduler {
    pub fn new(
        config: FetchSchedulerConfig,
        plan: FetchPlan,
        coordinator: SkillExecutionCoordinator,
    ) -> Result<Self> {
        if config.retry.max_attempts == 0 {
            bail!("fetch scheduler max_attempts must be greater than 0");
        }
        plan.validate()?;
        let state = load_schedule_state(&config.state_path())?;
        Ok(Self {
            config,
            plan,
            coordinator,
            state,
        })
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn plan(&self) -> &FetchPlan {
        &self.plan
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.config.events_log_path()
    }

    /// Runs one pass over every due skill. A failing skill never stops the batch.
    pub async fn run_cycle(&mut self, trigger: CycleTrigger) -> FetchCycleReport {
        let started_unix_ms = current_unix_timestamp_ms();
        if trigger == CycleTrigger::Tick {
            self.state.tick_count = self.state.tick_count.saturating_add(1);
        }
        let tick = self.state.tick_count;
        let due = self.due_skills(trigger, tick);

        let mut outcomes = Vec::with_capacity(due.len());
        for (group, skill) in due {
            let mut outcome = self.fetch_skill(&skill).await;
            outcome.group = group;
            outcomes.push(outcome);
        }

        let count = |status: FetchStatus| {
            outcomes
                .iter()
                .filter(|outcome| outcome.status == status)
                .count()
        };
        let report = FetchCycleReport {
            trigger,
            tick,
            started_unix_ms,
            finished_unix_ms: current_unix_timestamp_ms(),
            fetched: count(FetchStatus::Fetched),
            fresh: count(FetchStatus::Fresh),
            failed: count(FetchStatus::Failed),
            outcomes,
        };
        self.persist_cycle(&report);
        tracing::info!(
            trigger = ?trigger,
            tick,
            fetched = report.fetched,
            fresh = report.fresh,
            failed = report.failed,
            "fetch cycle finished"
        );
        report
    }

    /// Runs the catch-up pass to completion, then keeps running a cycle on
    /// every tick until shut down or the ticker is exhausted.
    pub async fn start(mut self, mut ticker: Box<dyn Ticker>) -> FetchSchedulerHandle {
        let catch_up = self.run_cycle(CycleTrigger::CatchUp).await;
        let completed_cycles = Arc::new(AtomicU64::new(0));
        let loop_cycles = Arc::clone(&completed_cycles);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = ticker.tick() => {
                        if tick.is_none() {
                            tracing::debug!("fetch scheduler ticker exhausted");
                            break;
                        }
                        self.run_cycle(CycleTrigger::Tick).await;
                        loop_cycles.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        FetchSchedulerHandle {
            catch_up,
            completed_cycles,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn due_skills(&mut self, trigger: CycleTrigger, tick: u64) -> Vec<(Option<String>, ScheduledSkill)> {
        let mut due = self
            .plan
            .skills
            .iter()
            .map(|skill| (None, skill.clone()))
            .collect::<Vec<_>>();
        for group in &self.plan.fan_out {
            let group_due = match trigger {
                CycleTrigger::CatchUp => true,
                CycleTrigger::Tick => tick % u64::from(group.every_ticks) == 0,
            };
            if !group_due {
                continue;
            }
            let cursor = self.state.cursors.entry(group.group.clone()).or_default();
            let (batch, next_cursor) = group.batch_at(cursor.cursor);
            cursor.cursor = next_cursor;
            cursor.last_run_tick = Some(tick);
            due.extend(
                batch
                    .into_iter()
                    .map(|skill| (Some(group.group.clone()), skill.clone())),
            );
        }
        due
    }

    async fn fetch_skill(&mut self, skill: &ScheduledSkill) -> SkillFetchOutcome {
        let skill_id = skill.skill_id.as_str();
        let cache = Arc::clone(self.coordinator.cache());
        let Some(slot) = cache
            .policy(skill_id)
            .map(|policy| policy.current_slot(cache.now()))
        else {
            tracing::warn!(skill_id = %skill_id, "scheduled skill has no bucket policy");
            return failed_outcome(skill_id, FETCH_REASON_UNKNOWN_SKILL, 0, None, None);
        };
        let bucket_started_unix_ms = unix_ms_from_datetime(slot.starts_at);
        if cache.get(skill_id).is_some() {
            return SkillFetchOutcome {
                skill_id: skill_id.to_string(),
                group: None,
                status: FetchStatus::Fresh,
                reason_code: FETCH_REASON_BUCKET_FRESH.to_string(),
                attempts: 0,
                bucket_key: Some(slot.key),
                error_kind: None,
                error: None,
            };
        }

        let retry = self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .coordinator
                .get_or_execute(skill_id, skill.input.clone())
                .await
            {
                Ok(result) => {
                    let bucket_key = result.bucket_key.unwrap_or_else(|| slot.key.clone());
                    self.state.last_successful.insert(
                        skill_id.to_string(),
                        SuccessfulBucket {
                            bucket_key: bucket_key.clone(),
                            bucket_started_unix_ms,
                            fetched_unix_ms: current_unix_timestamp_ms(),
                        },
                    );
                    let (status, reason_code) = if result.cached {
                        (FetchStatus::Fresh, FETCH_REASON_JOINED_CACHED)
                    } else {
                        (FetchStatus::Fetched, FETCH_REASON_SUCCEEDED)
                    };
                    return SkillFetchOutcome {
                        skill_id: skill_id.to_string(),
                        group: None,
                        status,
                        reason_code: reason_code.to_string(),
                        attempts,
                        bucket_key: Some(bucket_key),
                        error_kind: None,
                        error: None,
                    };
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    if retryable && attempts < retry.max_attempts {
                        tracing::warn!(
                            skill_id = %skill_id,
                            attempt = attempts,
                            max_attempts = retry.max_attempts,
                            error = %error,
                            "scheduled fetch failed; retrying"
                        );
                        tokio::time::sleep(retry.retry_delay).await;
                        continue;
                    }
                    tracing::warn!(
                        skill_id = %skill_id,
                        attempts,
                        kind = error.kind.as_str(),
                        error = %error,
                        "scheduled fetch failed"
                    );
                    let reason_code = if retryable {
                        FETCH_REASON_RETRIES_EXHAUSTED
                    } else {
                        FETCH_REASON_NON_RETRYABLE
                    };
                    return failed_outcome(
                        skill_id,
                        reason_code,
                        attempts,
                        Some(slot.key),
                        Some((error.kind, error.message)),
                    );
                }
            }
        }
    }

    fn persist_cycle(&self, report: &FetchCycleReport) {
        let state_path = self.config.state_path();
        if let Err(error) = save_schedule_state(&state_path, &self.state) {
            tracing::warn!(path = %state_path.display(), error = %error, "failed to persist fetch scheduler state");
        }
        let events_path = self.config.events_log_path();
        if let Err(error) = append_cycle_report(&events_path, report, self.config.rotation) {
            tracing::warn!(path = %events_path.display(), error = %error, "failed to append fetch cycle report");
        }
    }
}

fn failed_outcome(
    skill_id: &str,
    reason_code: &str,
    attempts: usize,
    bucket_key: Option<String>,
    error: Option<(SkillJobErrorKind, String)>,
) -> SkillFetchOutcome {
    let (error_kind, error) = match error {
        Some((kind, message)) => (Some(kind), Some(message)),
        None => (None, None),
    };
    SkillFetchOutcome {
        skill_id: skill_id.to_string(),
        group: None,
        status: FetchStatus::Failed,
        reason_code: reason_code.to_string(),
        attempts,
        bucket_key,
        error_kind,
        error,
    }
}

fn append_cycle_report(path: &Path, report: &FetchCycleReport, rotation: NdjsonRotationPolicy) -> Result<()> {
    let line = serde_json::to_string(report)?;
    append_ndjson_line(path, &line, rotation)
}

#[derive(Debug)]
/// Controls a running fetch loop.
pub struct FetchSchedulerHandle {
    catch_up: FetchCycleReport,
    completed_cycles: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FetchSchedulerHandle {
    pub fn catch_up_report(&self) -> &FetchCycleReport {
        &self.catch_up
    }

    /// Number of tick cycles finished since start, excluding catch-up.
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
