use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quill_agent_pool::AgentProcessPool;
use quill_skill_cache::{SkillJobError, SkillJobExecutor, SkillJobOutcome, SkillJobRequest};

use crate::agent_executor::AgentSkillExecutor;
use crate::catalog::{SkillCatalog, SkillExecutorSpec};
use crate::command_executor::CommandSkillExecutor;

#[derive(Default)]
/// Dispatches each job to the executor registered for its skill id.
pub struct SkillExecutorRouter {
    executors: BTreeMap<String, Arc<dyn SkillJobExecutor>>,
}

impl std::fmt::Debug for SkillExecutorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillExecutorRouter")
            .field("skills", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SkillExecutorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: &SkillCatalog, pool: &Arc<AgentProcessPool>) -> Result<Self> {
        let mut router = Self::new();
        for skill in catalog.skills() {
            let executor: Arc<dyn SkillJobExecutor> = match &skill.executor {
                SkillExecutorSpec::Command(spec) => Arc::new(
                    CommandSkillExecutor::new(spec.clone())
                        .with_context(|| format!("skill '{}'", skill.id))?,
                ),
                SkillExecutorSpec::Agent(spec) => Arc::new(
                    AgentSkillExecutor::new(Arc::clone(pool), spec.clone())
                        .with_context(|| format!("skill '{}'", skill.id))?,
                ),
            };
            router.insert(&skill.id, executor);
        }
        Ok(router)
    }

    pub fn insert(&mut self, skill_id: &str, executor: Arc<dyn SkillJobExecutor>) {
        self.executors.insert(skill_id.to_string(), executor);
    }

    pub fn skill_ids(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}

#[async_trait]
impl SkillJobExecutor for SkillExecutorRouter {
    async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome {
        let Some(executor) = self.executors.get(&request.skill_id) else {
            return Err(SkillJobError::rejected(format!(
                "no executor registered for skill '{}'",
                request.skill_id
            )));
        };
        executor.execute(request).await
    }
}
