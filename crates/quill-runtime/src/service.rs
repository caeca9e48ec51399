//! Wires catalog, cache, agent pool, coordinator, and scheduler together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use quill_agent_pool::{
    AgentCommandConfig, AgentPoolConfig, AgentProcessPool, AgentTransport,
    SubprocessAgentTransport,
};
use quill_core::{Clock, NdjsonRotationPolicy, SystemClock};
use quill_scheduler::{FetchScheduler, FetchSchedulerConfig, RetryPolicy};
use quill_skill_cache::{
    CacheLoadReport, CacheStore, FileCacheStore, SingleFlightCoordinator, SkillEventSender,
    SkillExecutionConfig, SkillExecutionCoordinator, SkillJobError, SkillResult, WindowedCache,
};

use crate::catalog::{load_skill_catalog, SkillCatalog};
use crate::router::SkillExecutorRouter;

pub const CACHE_DIR_NAME: &str = "cache";
pub const SCHEDULER_DIR_NAME: &str = "scheduler";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuillServiceConfig {
    pub catalog_path: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    pub agent: AgentCommandConfig,
    pub pool: AgentPoolConfig,
    pub execution: SkillExecutionConfig,
    pub retry: RetryPolicy,
    pub rotation: NdjsonRotationPolicy,
}

impl QuillServiceConfig {
    /// Places the cache and scheduler state under `data_dir`.
    pub fn new(catalog_path: impl Into<PathBuf>, data_dir: &Path) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            cache_dir: data_dir.join(CACHE_DIR_NAME),
            state_dir: data_dir.join(SCHEDULER_DIR_NAME),
            agent: AgentCommandConfig::default(),
            pool: AgentPoolConfig::default(),
            execution: SkillExecutionConfig::default(),
            retry: RetryPolicy::default(),
            rotation: NdjsonRotationPolicy::from_env(),
        }
    }

    pub fn scheduler_config(&self) -> FetchSchedulerConfig {
        FetchSchedulerConfig {
            state_dir: self.state_dir.clone(),
            retry: self.retry,
            rotation: self.rotation,
        }
    }
}

#[derive(Debug)]
pub struct QuillService {
    catalog: SkillCatalog,
    pool: Arc<AgentProcessPool>,
    coordinator: SkillExecutionCoordinator,
    scheduler_config: FetchSchedulerConfig,
}

impl QuillService {
    /// Builds the service against the filesystem, the system clock, and a
    /// subprocess agent transport.
    pub fn build(config: &QuillServiceConfig) -> Result<Self> {
        let catalog = load_skill_catalog(&config.catalog_path)?;
        let transport = SubprocessAgentTransport::new(config.agent.clone())
            .context("invalid agent command configuration")?;
        Self::from_parts(
            catalog,
            Arc::new(FileCacheStore::new(&config.cache_dir)),
            Arc::new(SystemClock),
            Arc::new(transport),
            config,
        )
    }

    pub fn from_parts(
        catalog: SkillCatalog,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn AgentTransport>,
        config: &QuillServiceConfig,
    ) -> Result<Self> {
        let pool = Arc::new(
            AgentProcessPool::with_clock(config.pool.clone(), transport, Arc::clone(&clock))
                .context("invalid agent pool configuration")?,
        );
        let router = SkillExecutorRouter::from_catalog(&catalog, &pool)?;
        let cache = Arc::new(WindowedCache::new(catalog.bucket_policies(), store, clock));
        let coordinator = SkillExecutionCoordinator::new(
            cache,
            Arc::new(SingleFlightCoordinator::new()),
            Arc::new(router),
            config.execution.clone(),
        );
        Ok(Self {
            catalog,
            pool,
            coordinator,
            scheduler_config: config.scheduler_config(),
        })
    }

    pub fn catalog(&self) -> &SkillCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<WindowedCache> {
        self.coordinator.cache()
    }

    pub fn pool(&self) -> &Arc<AgentProcessPool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &SkillExecutionCoordinator {
        &self.coordinator
    }

    /// Reloads persisted buckets, dropping the ones that expired while down.
    pub fn load_cache(&self) -> CacheLoadReport {
        let report = self.cache().load_all();
        tracing::info!(
            skills = report.loaded_skills,
            buckets = report.loaded_buckets,
            pruned = report.pruned_buckets,
            ignored = report.ignored_buckets,
            failed = report.failed_skills.len(),
            "skill cache loaded"
        );
        report
    }

    pub fn fetch_scheduler(&self) -> Result<FetchScheduler> {
        FetchScheduler::new(
            self.scheduler_config.clone(),
            self.catalog.fetch_plan(),
            self.coordinator.clone(),
        )
    }

    /// On-demand request. `input` overrides the catalog's default input.
    pub async fn request(
        &self,
        skill_id: &str,
        input: Option<String>,
        events: Option<SkillEventSender>,
    ) -> Result<SkillResult, SkillJobError> {
        let input = input.or_else(|| {
            self.catalog
                .skill(skill_id.trim())
                .and_then(|skill| skill.input.clone())
        });
        self.coordinator.request(skill_id, input, events).await
    }

    /// Terminates every agent session. Returns how many were live.
    pub async fn shutdown(&self) -> usize {
        let terminated = self.pool.shutdown_all().await;
        tracing::info!(terminated, "quill service shut down");
        terminated
    }
}
