use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::skill_job::{SkillJobError, SkillJobErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Whether a caller is running the job or waiting on someone else's run.
pub enum FlightRole {
    Owner,
    Waiter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Status events forwarded to upstream request handlers.
pub enum SkillStreamEvent {
    Connected {
        skill_id: String,
    },
    Start {
        skill_id: String,
        role: FlightRole,
    },
    Log {
        skill_id: String,
        message: String,
    },
    Report {
        skill_id: String,
        bucket_key: Option<String>,
        content: String,
        cached: bool,
    },
    Done {
        skill_id: String,
    },
    Error {
        skill_id: String,
        kind: SkillJobErrorKind,
        message: String,
    },
    Heartbeat {
        skill_id: String,
        elapsed_ms: u64,
    },
}

impl SkillStreamEvent {
    pub fn error(skill_id: &str, error: &SkillJobError) -> Self {
        Self::Error {
            skill_id: skill_id.to_string(),
            kind: error.kind,
            message: error.message.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Start { .. } => "start",
            Self::Log { .. } => "log",
            Self::Report { .. } => "report",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

pub type SkillEventSender = mpsc::UnboundedSender<SkillStreamEvent>;
pub type SkillEventReceiver = mpsc::UnboundedReceiver<SkillStreamEvent>;

pub fn skill_event_channel() -> (SkillEventSender, SkillEventReceiver) {
    mpsc::unbounded_channel()
}

/// Sends an event if anyone is still listening. A disconnected caller never
/// affects the execution it started.
pub(crate) fn emit(events: Option<&SkillEventSender>, event: SkillStreamEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}
