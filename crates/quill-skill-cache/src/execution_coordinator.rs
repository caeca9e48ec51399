//! On-demand get-or-execute path: cache first, then a single shared execution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::single_flight::{FlightOwner, FlightTicket, FlightWait, SingleFlightCoordinator};
use crate::skill_job::{SkillJobError, SkillJobExecutor, SkillJobOutcome, SkillJobRequest};
use crate::stream_events::{emit, FlightRole, SkillEventSender, SkillStreamEvent};
use crate::windowed_cache::WindowedCache;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_MISSED_WAITS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillExecutionConfig {
    /// Interval between heartbeat events while a caller waits. Zero disables them.
    pub heartbeat_interval: Duration,
    /// How many times a caller re-checks after its waiter missed a release.
    pub max_missed_waits: usize,
}

impl Default for SkillExecutionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_waits: DEFAULT_MAX_MISSED_WAITS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Content returned to a caller together with where it came from.
pub struct SkillResult {
    pub skill_id: String,
    pub bucket_key: Option<String>,
    pub content: String,
    pub cached: bool,
}

#[derive(Clone)]
pub struct SkillExecutionCoordinator {
    cache: Arc<WindowedCache>,
    flights: Arc<SingleFlightCoordinator>,
    executor: Arc<dyn SkillJobExecutor>,
    config: SkillExecutionConfig,
}

impl std::fmt::Debug for SkillExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillExecutionCoordinator")
            .field("cache", &self.cache)
            .field("flights", &self.flights)
            .field("config", &self.config)
            .finish()
    }
}

impl SkillExecutionCoordinator {
    pub fn new(
        cache: Arc<WindowedCache>,
        flights: Arc<SingleFlightCoordinator>,
        executor: Arc<dyn SkillJobExecutor>,
        config: SkillExecutionConfig,
    ) -> Self {
        Self {
            cache,
            flights,
            executor,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<WindowedCache> {
        &self.cache
    }

    pub fn flights(&self) -> &Arc<SingleFlightCoordinator> {
        &self.flights
    }

    pub async fn get_or_execute(
        &self,
        skill_id: &str,
        input: Option<String>,
    ) -> Result<SkillResult, SkillJobError> {
        self.request(skill_id, input, None).await
    }

    /// Serves `skill_id` from the current bucket, or runs it once for every
    /// concurrent caller, streaming status events to `events`.
    ///
    /// Dropping the returned future does not cancel a started execution.
    pub async fn request(
        &self,
        skill_id: &str,
        input: Option<String>,
        events: Option<SkillEventSender>,
    ) -> Result<SkillResult, SkillJobError> {
        let skill_id = skill_id.trim();
        emit(
            events.as_ref(),
            SkillStreamEvent::Connected {
                skill_id: skill_id.to_string(),
            },
        );
        let outcome = self.resolve(skill_id, input, events.as_ref()).await;
        match &outcome {
            Ok(result) => {
                emit(
                    events.as_ref(),
                    SkillStreamEvent::Report {
                        skill_id: skill_id.to_string(),
                        bucket_key: result.bucket_key.clone(),
                        content: result.content.clone(),
                        cached: result.cached,
                    },
                );
                emit(
                    events.as_ref(),
                    SkillStreamEvent::Done {
                        skill_id: skill_id.to_string(),
                    },
                );
            }
            Err(error) => emit(events.as_ref(), SkillStreamEvent::error(skill_id, error)),
        }
        outcome
    }

    async fn resolve(
        &self,
        skill_id: &str,
        input: Option<String>,
        events: Option<&SkillEventSender>,
    ) -> Result<SkillResult, SkillJobError> {
        if skill_id.is_empty() || self.cache.policy(skill_id).is_none() {
            return Err(SkillJobError::rejected(format!("unknown skill '{skill_id}'")));
        }

        for _ in 0..=self.config.max_missed_waits {
            if let Some(entry) = self.cache.get(skill_id) {
                return Ok(SkillResult {
                    skill_id: entry.skill_id,
                    bucket_key: Some(entry.bucket_key),
                    content: entry.content,
                    cached: true,
                });
            }

            match self.flights.acquire_or_wait(skill_id) {
                FlightTicket::Owner(owner) => {
                    // Another owner may have filled the bucket between the
                    // cache check and acquiring the lock.
                    if let Some(entry) = self.cache.get(skill_id) {
                        owner.release(Ok(entry.content.clone()));
                        return Ok(SkillResult {
                            skill_id: entry.skill_id,
                            bucket_key: Some(entry.bucket_key),
                            content: entry.content,
                            cached: true,
                        });
                    }
                    emit(
                        events,
                        SkillStreamEvent::Start {
                            skill_id: skill_id.to_string(),
                            role: FlightRole::Owner,
                        },
                    );
                    return self.run_as_owner(owner, input, events).await;
                }
                FlightTicket::Waiter(waiter) => {
                    emit(
                        events,
                        SkillStreamEvent::Start {
                            skill_id: skill_id.to_string(),
                            role: FlightRole::Waiter,
                        },
                    );
                    match self.with_heartbeats(skill_id, events, waiter.wait()).await {
                        FlightWait::Resolved(outcome) => {
                            return outcome.map(|content| SkillResult {
                                skill_id: skill_id.to_string(),
                                bucket_key: self.current_bucket_key(skill_id),
                                content,
                                cached: false,
                            });
                        }
                        FlightWait::Missed => {
                            tracing::debug!(skill_id = %skill_id, "skill waiter missed release; re-checking");
                        }
                    }
                }
            }
        }
        Err(SkillJobError::rejected(format!(
            "skill '{skill_id}' stayed contended after {} waits",
            self.config.max_missed_waits + 1
        )))
    }

    async fn run_as_owner(
        &self,
        owner: FlightOwner,
        input: Option<String>,
        events: Option<&SkillEventSender>,
    ) -> Result<SkillResult, SkillJobError> {
        let skill_id = owner.skill_id().to_string();
        let mut request = SkillJobRequest::new(skill_id.clone(), input);
        if let Some(events) = events.cloned() {
            let progress_skill_id = skill_id.clone();
            request = request.with_progress(Arc::new(move |text: &str| {
                let _ = events.send(SkillStreamEvent::Log {
                    skill_id: progress_skill_id.clone(),
                    message: text.to_string(),
                });
            }));
        }

        let cache = Arc::clone(&self.cache);
        let executor = Arc::clone(&self.executor);
        // Detached so that a disconnected caller never strands the waiters.
        let execution = tokio::spawn(async move {
            let started = Instant::now();
            let outcome: SkillJobOutcome = executor.execute(request).await;
            let mut bucket_key = None;
            match &outcome {
                Ok(content) => match cache.set(owner.skill_id(), content.clone()) {
                    Ok(entry) => bucket_key = Some(entry.bucket_key),
                    Err(error) => {
                        tracing::warn!(skill_id = %owner.skill_id(), error = %error, "failed to cache skill result");
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        skill_id = %owner.skill_id(),
                        kind = error.kind.as_str(),
                        error = %error,
                        "skill execution failed"
                    );
                }
            }
            tracing::info!(
                skill_id = %owner.skill_id(),
                ok = outcome.is_ok(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "skill execution finished"
            );
            owner.release(outcome.clone());
            (outcome, bucket_key)
        });

        match self.with_heartbeats(&skill_id, events, execution).await {
            Ok((outcome, bucket_key)) => outcome.map(|content| SkillResult {
                bucket_key: bucket_key.or_else(|| self.current_bucket_key(&skill_id)),
                skill_id: skill_id.clone(),
                content,
                cached: false,
            }),
            Err(error) => {
                tracing::warn!(skill_id = %skill_id, error = %error, "skill execution task failed");
                Err(SkillJobError::abandoned(&skill_id))
            }
        }
    }

    async fn with_heartbeats<F>(
        &self,
        skill_id: &str,
        events: Option<&SkillEventSender>,
        future: F,
    ) -> F::Output
    where
        F: Future,
    {
        let period = self.config.heartbeat_interval;
        let Some(events) = events.filter(|_| !period.is_zero()) else {
            return future.await;
        };
        tokio::pin!(future);
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                output = &mut future => return output,
                _ = ticker.tick() => {
                    let _ = events.send(SkillStreamEvent::Heartbeat {
                        skill_id: skill_id.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    fn current_bucket_key(&self, skill_id: &str) -> Option<String> {
        self.cache
            .policy(skill_id)
            .map(|policy| policy.current_slot(self.cache.now()).key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;
    use quill_core::ManualClock;

    use super::{SkillExecutionConfig, SkillExecutionCoordinator};
    use crate::bucket_policy::BucketPolicy;
    use crate::cache_store::MemoryCacheStore;
    use crate::single_flight::SingleFlightCoordinator;
    use crate::skill_job::{
        SkillJobError, SkillJobErrorKind, SkillJobExecutor, SkillJobOutcome, SkillJobRequest,
    };
    use crate::stream_events::{skill_event_channel, FlightRole, SkillStreamEvent};
    use crate::windowed_cache::WindowedCache;

    struct ScriptedExecutor {
        calls: AtomicUsize,
        delay: Duration,
        outcomes: Mutex<VecDeque<SkillJobOutcome>>,
    }

    impl ScriptedExecutor {
        fn new(delay: Duration, outcomes: Vec<SkillJobOutcome>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                outcomes: Mutex::new(outcomes.into()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SkillJobExecutor for ScriptedExecutor {
        async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            request.report_progress("working");
            tokio::time::sleep(self.delay).await;
            self.outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or_else(|| Ok(format!("{}-run-{call}", request.skill_id)))
        }
    }

    fn coordinator(
        executor: Arc<ScriptedExecutor>,
        config: SkillExecutionConfig,
    ) -> SkillExecutionCoordinator {
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 14, 9, 5, 0)
                .single()
                .expect("start"),
        );
        let policies = BTreeMap::from([
            ("alpha".to_string(), BucketPolicy::frequent(6, Tz::UTC).expect("alpha")),
            ("beta".to_string(), BucketPolicy::frequent(6, Tz::UTC).expect("beta")),
        ]);
        let cache = Arc::new(WindowedCache::new(
            policies,
            Arc::new(MemoryCacheStore::new()),
            Arc::new(clock),
        ));
        SkillExecutionCoordinator::new(
            cache,
            Arc::new(SingleFlightCoordinator::new()),
            executor,
            config,
        )
    }

    fn quiet() -> SkillExecutionConfig {
        SkillExecutionConfig {
            heartbeat_interval: Duration::ZERO,
            ..SkillExecutionConfig::default()
        }
    }

    #[tokio::test]
    async fn integration_concurrent_requests_share_one_execution() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_millis(50), Vec::new()));
        let service = coordinator(executor.clone(), quiet());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.get_or_execute("alpha", None).await
            }));
        }
        let mut contents = Vec::new();
        for handle in handles {
            contents.push(handle.await.expect("join").expect("result").content);
        }

        assert_eq!(executor.calls(), 1);
        assert!(contents.iter().all(|content| content == "alpha-run-1"));
        let cached = service.get_or_execute("alpha", None).await.expect("cached");
        assert!(cached.cached);
        assert_eq!(cached.bucket_key.as_deref(), Some("09"));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn integration_shared_failure_releases_lock_for_next_caller() {
        let executor = Arc::new(ScriptedExecutor::new(
            Duration::from_millis(40),
            vec![Err(SkillJobError::execution_failed("scraper exited with status 1"))],
        ));
        let service = coordinator(executor.clone(), quiet());

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.get_or_execute("beta", None).await }
        });
        let second = tokio::spawn({
            let service = service.clone();
            async move { service.get_or_execute("beta", None).await }
        });
        let first = first.await.expect("join first").expect_err("first fails");
        let second = second.await.expect("join second").expect_err("second fails");
        assert_eq!(first, second);
        assert_eq!(first.kind, SkillJobErrorKind::ExecutionFailed);
        assert!(!service.flights().is_locked("beta"));

        let third = service.get_or_execute("beta", None).await.expect("third succeeds");
        assert_eq!(third.content, "beta-run-2");
        assert!(!third.cached);
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn functional_request_streams_status_events_in_order() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_millis(60), Vec::new()));
        let service = coordinator(
            executor,
            SkillExecutionConfig {
                heartbeat_interval: Duration::from_millis(10),
                ..SkillExecutionConfig::default()
            },
        );
        let (sender, mut receiver) = skill_event_channel();
        service
            .request("alpha", Some("ai".to_string()), Some(sender))
            .await
            .expect("request");

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        let kinds = events.iter().map(SkillStreamEvent::kind).collect::<Vec<_>>();
        assert_eq!(kinds.first(), Some(&"connected"));
        assert_eq!(
            events.get(1),
            Some(&SkillStreamEvent::Start {
                skill_id: "alpha".to_string(),
                role: FlightRole::Owner
            })
        );
        assert!(kinds.contains(&"log"));
        assert!(kinds.contains(&"heartbeat"));
        assert_eq!(&kinds[kinds.len() - 2..], &["report", "done"]);
    }

    #[tokio::test]
    async fn functional_cached_result_reports_cached_flag() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::ZERO, Vec::new()));
        let service = coordinator(executor.clone(), quiet());
        service.cache().set("alpha", "warm").expect("seed");

        let (sender, mut receiver) = skill_event_channel();
        let result = service.request("alpha", None, Some(sender)).await.expect("request");
        assert!(result.cached);
        assert_eq!(executor.calls(), 0);
        let mut saw_cached_report = false;
        while let Ok(event) = receiver.try_recv() {
            if let SkillStreamEvent::Report { cached, content, .. } = event {
                saw_cached_report = cached && content == "warm";
            }
        }
        assert!(saw_cached_report);
    }

    #[tokio::test]
    async fn regression_dropped_caller_does_not_cancel_execution() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_millis(40), Vec::new()));
        let service = coordinator(executor.clone(), quiet());
        let caller = tokio::spawn({
            let service = service.clone();
            async move { service.get_or_execute("alpha", None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while service.cache().get("alpha").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "execution never completed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!service.flights().is_locked("alpha"));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn unit_unknown_skill_is_rejected_without_execution() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::ZERO, Vec::new()));
        let service = coordinator(executor.clone(), quiet());
        let error = service.get_or_execute("gamma", None).await.expect_err("unknown");
        assert_eq!(error.kind, SkillJobErrorKind::Rejected);
        assert_eq!(executor.calls(), 0);
    }
}
