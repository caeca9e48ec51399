//! Job executor contract shared by on-demand requests and the fetch scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SkillJobErrorKind` values.
pub enum SkillJobErrorKind {
    Parse,
    ExecutionFailed,
    MissingOutput,
    Timeout,
    SpawnFailed,
    Rejected,
    Abandoned,
    Other,
}

impl SkillJobErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::ExecutionFailed => "execution_failed",
            Self::MissingOutput => "missing_output",
            Self::Timeout => "timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
            Self::Other => "other",
        }
    }
}

const RETRYABLE_MESSAGE_SIGNATURES: &[&str] = &[
    "failed to parse",
    "parse error",
    "execution failed",
    "exited with",
    "output file not found",
    "no output",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
/// Failure reported by a skill job; shared verbatim with every waiter.
pub struct SkillJobError {
    pub kind: SkillJobErrorKind,
    pub message: String,
}

impl SkillJobError {
    pub fn new(kind: SkillJobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::Parse, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::ExecutionFailed, message)
    }

    pub fn missing_output(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::MissingOutput, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::Timeout, message)
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::SpawnFailed, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::Rejected, message)
    }

    pub fn abandoned(skill_id: &str) -> Self {
        Self::new(
            SkillJobErrorKind::Abandoned,
            format!("execution for skill '{skill_id}' ended without a result"),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(SkillJobErrorKind::Other, message)
    }

    /// Only parse failures, generic execution failures, and missing output are
    /// worth another attempt. Untyped errors are classified by message.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            SkillJobErrorKind::Parse
            | SkillJobErrorKind::ExecutionFailed
            | SkillJobErrorKind::MissingOutput => true,
            SkillJobErrorKind::Other => {
                let message = self.message.to_ascii_lowercase();
                RETRYABLE_MESSAGE_SIGNATURES
                    .iter()
                    .any(|signature| message.contains(signature))
            }
            _ => false,
        }
    }
}

impl From<anyhow::Error> for SkillJobError {
    fn from(error: anyhow::Error) -> Self {
        Self::other(format!("{error:#}"))
    }
}

pub type SkillJobOutcome = Result<String, SkillJobError>;

/// Receives incremental progress text while a job runs.
pub type SkillProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct SkillJobRequest {
    pub skill_id: String,
    pub input: Option<String>,
    pub progress: Option<SkillProgressSink>,
}

impl SkillJobRequest {
    pub fn new(skill_id: impl Into<String>, input: Option<String>) -> Self {
        Self {
            skill_id: skill_id.into(),
            input,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: SkillProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report_progress(&self, text: &str) {
        if let Some(progress) = &self.progress {
            progress(text);
        }
    }
}

impl std::fmt::Debug for SkillJobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillJobRequest")
            .field("skill_id", &self.skill_id)
            .field("input", &self.input)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[async_trait]
/// Produces the textual artifact for a skill, or an error the retry
/// classifier can inspect.
pub trait SkillJobExecutor: Send + Sync {
    async fn execute(&self, request: SkillJobRequest) -> SkillJobOutcome;
}
