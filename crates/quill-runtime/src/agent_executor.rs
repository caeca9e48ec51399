use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use quill_agent_pool::{AgentChunkSink, AgentPoolError, AgentProcessPool};
use quill_core::lock_unpoisoned;
use quill_skill_cache::{SkillJobError, SkillJobExecutor, SkillJobOutcome, SkillJobRequest};

use crate::catalog::{render_skill_template, AgentSkillSpec};
use crate::command_executor::validate_json_output;

/// Maps pool failures onto the job error taxonomy the retry policy reads.
pub fn skill_error_from_pool(error: AgentPoolError) -> SkillJobError {
    let message = error.to_string();
    match error {
        AgentPoolError::HandshakeTimeout { .. } => SkillJobError::timeout(message),
        AgentPoolError::SpawnFailed(_) => SkillJobError::spawn_failed(message),
        AgentPoolError::CapacityExhausted { .. }
        | AgentPoolError::Busy(_)
        | AgentPoolError::NotReady(_)
        | AgentPoolError::ShutDown
        | AgentPoolError::InvalidMessage
        | AgentPoolError::InvalidConfig(_) => SkillJobError::rejected(message),
        AgentPoolError::Io { .. }
        | AgentPoolError::ProcessExited { .. }
        | AgentPoolError::AgentReported(_) => {
            SkillJobError::execution_failed(format!("agent execution failed: {message}"))
        }
        AgentPoolError::SessionNotFound(_) => SkillJobError::other(message),
    }
}

#[derive(Debug)]
/// Runs a skill as one turn on a pooled agent session, resuming the skill's
/// previous conversation when it is still known.
pub struct AgentSkillExecutor {
    pool: Arc<AgentProcessPool>,
    spec: AgentSkillSpec,
    sessions: Mutex<HashMap<String, String>>,
}

impl AgentSkillExecutor {
    pub fn new(pool: Arc<AgentProcessPool>, spec: AgentSkillSpec) -> Result<Self> {
        if spec.prompt.trim().is_empty() {
            bail!("agent prompt must be non-empty");
        }
        if spec.timeout_ms == 0 {
            bail!("agent timeout must be greater than 0ms");
        }
        Ok(Self {
            pool,
            spec,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Session id the next run of `skill_id` will resume, if any.
    pub fn remembered_session(&self, skill_id: &str) -> Option<String> {
        lock_unpoisoned(&self.sessions).get(skill_id).cloned()
    }
}

#[async_trait]
impl SkillJobExecutor for AgentSkillExecutor {
    async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome {
        let skill_id = request.skill_id.as_str();
        let input = request.input.as_deref().unwrap_or_default();
        let prompt = render_skill_template(&self.spec.prompt, skill_id, input);
        let resume = if self.spec.resume {
            self.remembered_session(skill_id)
        } else {
            None
        };

        let handle = self
            .pool
            .get_or_create(resume.as_deref())
            .await
            .map_err(skill_error_from_pool)?;
        let progress = request.clone();
        let on_chunk: AgentChunkSink = Arc::new(move |chunk: &str| progress.report_progress(chunk));
        let timeout = Duration::from_millis(self.spec.timeout_ms);
        let turn = match tokio::time::timeout(timeout, self.pool.send(&handle, &prompt, on_chunk)).await {
            Ok(turn) => turn.map_err(skill_error_from_pool)?,
            Err(_) => {
                // The session still owns an unfinished turn, so it cannot be reused.
                if let Err(error) = self.pool.close(&handle).await {
                    tracing::debug!(skill_id = %skill_id, error = %error, "timed out agent session already gone");
                }
                lock_unpoisoned(&self.sessions).remove(skill_id);
                return Err(SkillJobError::timeout(format!(
                    "agent turn for skill '{skill_id}' timed out after {}ms",
                    self.spec.timeout_ms
                )));
            }
        };

        if self.spec.resume {
            lock_unpoisoned(&self.sessions).insert(skill_id.to_string(), turn.session_id.clone());
        }
        let content = turn.text.trim();
        if content.is_empty() {
            return Err(SkillJobError::missing_output(format!(
                "agent returned no output for skill '{skill_id}'"
            )));
        }
        if self.spec.expect_json {
            validate_json_output(content)?;
        }
        tracing::debug!(skill_id = %skill_id, session_id = %turn.session_id, "agent skill turn finished");
        Ok(content.to_string())
    }
}
