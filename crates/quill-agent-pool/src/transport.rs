//! Adapters that open a duplex byte stream to one agent instance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use crate::error::AgentPoolError;

pub type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type AgentReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait AgentTerminator: Send {
    /// Runs after the agent's stdin has been closed. Waits up to `grace` for a
    /// clean exit, then forces one.
    async fn terminate(&mut self, grace: Duration);
}

pub struct AgentConnection {
    pub stdin: AgentWriter,
    pub stdout: AgentReader,
    pub terminator: Box<dyn AgentTerminator>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection").finish_non_exhaustive()
    }
}

#[async_trait]
/// Opens a new agent instance, optionally resuming an earlier session.
pub trait AgentTransport: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        resume_session_id: Option<&str>,
    ) -> Result<AgentConnection, AgentPoolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommandConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Flag placed before the session id when resuming.
    pub resume_flag: String,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--verbose".to_string(),
                "--input-format".to_string(),
                "stream-json".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            env: BTreeMap::new(),
            working_dir: None,
            resume_flag: "--resume".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
/// Spawns one child process per session and talks to it over stdio.
pub struct SubprocessAgentTransport {
    config: AgentCommandConfig,
}

impl SubprocessAgentTransport {
    pub fn new(config: AgentCommandConfig) -> Result<Self, AgentPoolError> {
        if config.executable.trim().is_empty() {
            return Err(AgentPoolError::InvalidConfig(
                "agent executable must be non-empty".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &AgentCommandConfig {
        &self.config
    }
}

#[async_trait]
impl AgentTransport for SubprocessAgentTransport {
    async fn connect(
        &self,
        resume_session_id: Option<&str>,
    ) -> Result<AgentConnection, AgentPoolError> {
        let executable = self.config.executable.trim();
        let mut command = Command::new(executable);
        command.kill_on_drop(true);
        command.args(&self.config.args);
        if let Some(session_id) = resume_session_id {
            command.arg(&self.config.resume_flag);
            command.arg(session_id);
        }
        command.envs(&self.config.env);
        if let Some(working_dir) = &self.config.working_dir {
            command.current_dir(working_dir);
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = spawn_with_text_file_busy_retry(&mut command)
            .await
            .map_err(|error| {
                AgentPoolError::SpawnFailed(format!("failed to spawn agent '{executable}': {error}"))
            })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AgentPoolError::SpawnFailed(format!(
                "agent '{executable}' started without piped stdio"
            )));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, line = %line, "agent stderr");
                }
            });
        }
        tracing::debug!(pid, resume = resume_session_id.is_some(), "agent process spawned");
        Ok(AgentConnection {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            terminator: Box::new(ChildTerminator { child }),
        })
    }
}

struct ChildTerminator {
    child: Child,
}

#[async_trait]
impl AgentTerminator for ChildTerminator {
    async fn terminate(&mut self, grace: Duration) {
        let pid = self.child.id();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid, %status, "agent process exited"),
            Ok(Err(error)) => tracing::warn!(pid, error = %error, "failed to wait for agent process"),
            Err(_) => {
                if let Err(error) = self.child.kill().await {
                    tracing::warn!(pid, error = %error, "failed to kill agent process");
                } else {
                    tracing::debug!(pid, "agent process killed after grace period");
                }
            }
        }
    }
}

/// Spawns `command`, retrying briefly while the executable is still being
/// written (`ETXTBSY`).
pub async fn spawn_with_text_file_busy_retry(command: &mut Command) -> std::io::Result<Child> {
    const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
    const TEXT_FILE_BUSY_ERRNO: i32 = 26;
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Err(error)
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            spawned => return spawned,
        }
    }
}
