use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Enumerates failures surfaced by the agent session pool.
pub enum AgentPoolError {
    #[error("message must be non-empty")]
    InvalidMessage,
    #[error("invalid agent pool configuration: {0}")]
    InvalidConfig(String),
    #[error("agent session '{0}' was not found")]
    SessionNotFound(String),
    #[error("agent session '{0}' is not ready")]
    NotReady(String),
    #[error("agent session '{0}' is busy")]
    Busy(String),
    #[error("agent pool is at capacity ({limit}) with no idle session to evict")]
    CapacityExhausted { limit: usize },
    #[error("agent did not complete its handshake within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),
    #[error("agent session '{session_key}' I/O failed: {error}")]
    Io { session_key: String, error: String },
    #[error("agent session '{session_key}' exited: {reason}")]
    ProcessExited { session_key: String, reason: String },
    #[error("agent reported an error: {0}")]
    AgentReported(String),
    #[error("agent pool is shutting down")]
    ShutDown,
}
