//! Windowed result cache and single-flight execution for skills.
//!
//! A request for a skill result first consults [`WindowedCache`]; on a miss,
//! [`SkillExecutionCoordinator`] runs the job once through
//! [`SingleFlightCoordinator`] and shares the outcome with every concurrent
//! caller.

pub mod bucket_policy;
pub mod cache_store;
pub mod error;
pub mod execution_coordinator;
pub mod single_flight;
pub mod skill_job;
pub mod stream_events;
pub mod windowed_cache;

pub use bucket_policy::{
    default_periodic_slots, BucketPolicy, BucketSlot, PeriodicSlot, SkillClass,
    MAX_FREQUENT_WINDOW_HOURS,
};
pub use cache_store::{
    BucketMap, CacheEntry, CacheStore, FileCacheStore, LoadedBuckets, MemoryCacheStore,
};
pub use error::SkillCacheError;
pub use execution_coordinator::{SkillExecutionConfig, SkillExecutionCoordinator, SkillResult};
pub use single_flight::{FlightOwner, FlightTicket, FlightWait, SingleFlightCoordinator, SkillWaiter};
pub use skill_job::{
    SkillJobError, SkillJobErrorKind, SkillJobExecutor, SkillJobOutcome, SkillJobRequest,
    SkillProgressSink,
};
pub use stream_events::{
    skill_event_channel, FlightRole, SkillEventReceiver, SkillEventSender, SkillStreamEvent,
};
pub use windowed_cache::{BucketAvailability, CacheLoadReport, WindowedCache};
