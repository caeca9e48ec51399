//! Proactive fetch scheduling for tracked skills.
//!
//! [`FetchScheduler`] runs a catch-up pass at start, then on every tick of a
//! [`Ticker`] fetches each skill whose current bucket is still empty, plus a
//! rotating batch of every fan-out group on its own lower frequency.

pub mod plan;
pub mod scheduler;
pub mod state;
pub mod ticker;

pub use plan::{FanOutGroup, FetchPlan, ScheduledSkill};
pub use scheduler::{
    CycleTrigger, FetchCycleReport, FetchScheduler, FetchSchedulerConfig, FetchSchedulerHandle,
    FetchStatus, RetryPolicy, SkillFetchOutcome, FETCH_SCHEDULER_EVENTS_LOG_FILE,
    FETCH_SCHEDULER_STATE_FILE,
};
pub use state::{
    load_schedule_state, save_schedule_state, FanOutCursor, ScheduleState, SuccessfulBucket,
    SCHEDULE_STATE_SCHEMA_VERSION,
};
pub use ticker::{CronTicker, IntervalTicker, ManualTickTrigger, ManualTicker, Ticker};
