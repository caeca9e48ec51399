use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use quill_core::{ManualClock, NdjsonRotationPolicy};
use quill_scheduler::{
    CycleTrigger, FetchPlan, FetchScheduler, FetchSchedulerConfig, FetchStatus, RetryPolicy,
    ScheduledSkill,
};
use quill_skill_cache::{
    skill_event_channel, BucketPolicy, FileCacheStore, FlightRole, SingleFlightCoordinator,
    SkillExecutionConfig, SkillExecutionCoordinator, SkillJobError, SkillJobExecutor,
    SkillJobOutcome, SkillJobRequest, SkillStreamEvent, WindowedCache,
};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "quill-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[derive(Default)]
struct ScriptedExecutor {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<SkillJobOutcome>>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(&self, skill_id: &str, outcomes: Vec<SkillJobOutcome>) {
        self.scripts
            .lock()
            .expect("scripts")
            .insert(skill_id.to_string(), outcomes.into());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SkillJobExecutor for ScriptedExecutor {
    async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        request.report_progress("working");
        let scripted = self
            .scripts
            .lock()
            .expect("scripts")
            .get_mut(&request.skill_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(format!("{}@{call}", request.skill_id)))
    }
}

fn start_clock() -> ManualClock {
    ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 14, 9, 10, 0)
            .single()
            .expect("start instant"),
    )
}

fn file_cache(root: &Path, skill_ids: &[&str], clock: &ManualClock) -> Arc<WindowedCache> {
    let policies = skill_ids
        .iter()
        .map(|id| {
            (
                id.to_string(),
                BucketPolicy::frequent(3, Tz::UTC).expect("policy"),
            )
        })
        .collect::<BTreeMap<_, _>>();
    Arc::new(WindowedCache::new(
        policies,
        Arc::new(FileCacheStore::new(root.join("cache"))),
        Arc::new(clock.clone()),
    ))
}

fn coordinator(
    cache: Arc<WindowedCache>,
    executor: Arc<ScriptedExecutor>,
) -> SkillExecutionCoordinator {
    SkillExecutionCoordinator::new(
        cache,
        Arc::new(SingleFlightCoordinator::new()),
        executor,
        SkillExecutionConfig {
            heartbeat_interval: Duration::ZERO,
            ..SkillExecutionConfig::default()
        },
    )
}

fn scheduler_config(root: &Path) -> FetchSchedulerConfig {
    FetchSchedulerConfig {
        state_dir: root.join("scheduler"),
        retry: RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        },
        rotation: NdjsonRotationPolicy::default(),
    }
}

fn plan(skill_ids: &[&str]) -> FetchPlan {
    FetchPlan {
        skills: skill_ids.iter().map(|id| ScheduledSkill::new(*id)).collect(),
        fan_out: Vec::new(),
    }
}

#[tokio::test]
async fn integration_scheduled_buckets_survive_restart_and_expire_with_window() {
    let workspace = IsolatedWorkspace::new("restart");
    let clock = start_clock();
    let executor = Arc::new(ScriptedExecutor::default());
    let cache = file_cache(workspace.root(), &["trending"], &clock);
    let mut scheduler = FetchScheduler::new(
        scheduler_config(workspace.root()),
        plan(&["trending"]),
        coordinator(Arc::clone(&cache), Arc::clone(&executor)),
    )
    .expect("scheduler");

    assert_eq!(scheduler.run_cycle(CycleTrigger::CatchUp).await.fetched, 1);
    clock.advance(chrono::Duration::hours(1));
    assert_eq!(scheduler.run_cycle(CycleTrigger::Tick).await.fetched, 1);
    assert_eq!(executor.calls(), 2);
    assert!(workspace.root().join("cache/trending.json").exists());

    let restarted = file_cache(workspace.root(), &["trending"], &clock);
    let report = restarted.load_all();
    assert_eq!(report.loaded_buckets, 2);
    assert_eq!(
        restarted.get("trending").map(|entry| entry.content),
        Some("trending@2".to_string())
    );
    assert_eq!(
        restarted
            .get_by_bucket("trending", "09")
            .map(|entry| entry.content),
        Some("trending@1".to_string())
    );
    let listed = restarted
        .list_available_buckets("trending")
        .into_iter()
        .map(|bucket| (bucket.bucket_key, bucket.has_data))
        .collect::<Vec<_>>();
    assert_eq!(
        listed,
        vec![
            ("10".to_string(), true),
            ("09".to_string(), true),
            ("08".to_string(), false)
        ]
    );

    clock.advance(chrono::Duration::hours(3));
    let expired = file_cache(workspace.root(), &["trending"], &clock);
    let report = expired.load_all();
    assert_eq!(report.pruned_buckets, 2);
    assert!(expired.get("trending").is_none());

    let state = fs::read_to_string(workspace.root().join("scheduler/state.json")).expect("state");
    let state: serde_json::Value = serde_json::from_str(&state).expect("state json");
    assert_eq!(state["last_successful"]["trending"]["bucket_key"], "10");
}

#[tokio::test]
async fn integration_concurrent_requests_share_one_execution_per_bucket() {
    let workspace = IsolatedWorkspace::new("single-flight");
    let clock = start_clock();
    let executor = Arc::new(ScriptedExecutor::with_delay(Duration::from_millis(50)));
    let coordinator = coordinator(
        file_cache(workspace.root(), &["trending"], &clock),
        Arc::clone(&executor),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let (events, mut receiver) = skill_event_channel();
            let result = coordinator.request("trending", None, Some(events)).await;
            let mut collected = Vec::new();
            while let Ok(event) = receiver.try_recv() {
                collected.push(event);
            }
            (result, collected)
        }));
    }

    let mut owners = 0;
    for task in tasks {
        let (result, events) = task.await.expect("join");
        assert_eq!(result.expect("shared result").content, "trending@1");
        owners += events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    SkillStreamEvent::Start {
                        role: FlightRole::Owner,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(events.last().map(SkillStreamEvent::kind), Some("done"));
    }
    assert_eq!(owners, 1);
    assert_eq!(executor.calls(), 1);

    let cached = coordinator
        .get_or_execute("trending", None)
        .await
        .expect("cached");
    assert!(cached.cached);

    clock.advance(chrono::Duration::hours(1));
    let rolled = coordinator
        .get_or_execute("trending", None)
        .await
        .expect("next bucket");
    assert!(!rolled.cached);
    assert_eq!(rolled.bucket_key.as_deref(), Some("10"));
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn integration_scheduler_retries_transient_failures_and_isolates_hard_ones() {
    let workspace = IsolatedWorkspace::new("retry");
    let clock = start_clock();
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script(
        "flaky",
        vec![Err(SkillJobError::other("failed to parse upstream payload"))],
    );
    executor.script(
        "broken",
        vec![Err(SkillJobError::timeout("timed out after 300000ms"))],
    );
    let skills = ["flaky", "broken", "steady"];
    let mut scheduler = FetchScheduler::new(
        scheduler_config(workspace.root()),
        plan(&skills),
        coordinator(file_cache(workspace.root(), &skills, &clock), Arc::clone(&executor)),
    )
    .expect("scheduler");

    let report = scheduler.run_cycle(CycleTrigger::CatchUp).await;
    let flaky = report.outcome("flaky").expect("flaky");
    assert_eq!(flaky.status, FetchStatus::Fetched);
    assert_eq!(flaky.attempts, 2);
    let broken = report.outcome("broken").expect("broken");
    assert_eq!(broken.status, FetchStatus::Failed);
    assert_eq!(broken.attempts, 1);
    assert_eq!(
        report.outcome("steady").map(|outcome| outcome.status),
        Some(FetchStatus::Fetched)
    );

    let retry = scheduler.run_cycle(CycleTrigger::Tick).await;
    assert_eq!(retry.fresh, 2);
    assert_eq!(
        retry.outcome("broken").map(|outcome| outcome.status),
        Some(FetchStatus::Fetched)
    );

    let log = fs::read_to_string(scheduler.events_log_path()).expect("events log");
    let cycles = log
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("cycle json"))
        .collect::<Vec<_>>();
    assert_eq!(cycles.len(), 2);
    assert_eq!(cycles[0]["failed"], 1);
    assert_eq!(cycles[1]["trigger"], "tick");
}
