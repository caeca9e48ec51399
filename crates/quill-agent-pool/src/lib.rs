//! Pool of long-lived agent sessions speaking line-delimited JSON.
//!
//! The pool logic only sees an [`AgentTransport`]; the subprocess adapter in
//! [`transport`] is one implementation, in-memory duplex streams another.

pub mod error;
pub mod pool;
pub mod protocol;
pub mod sweeper;
pub mod transport;

pub use error::AgentPoolError;
pub use pool::{
    AgentChunkSink, AgentPoolConfig, AgentProcessPool, AgentSessionHandle, AgentSessionSnapshot,
    AgentTurnResult,
};
pub use protocol::{decode_agent_frame, encode_user_frame, AgentFrame, AgentFrameError};
pub use sweeper::AgentIdleSweeperHandle;
pub use transport::{
    AgentCommandConfig, AgentConnection, AgentReader, AgentTerminator, AgentTransport,
    AgentWriter, SubprocessAgentTransport, spawn_with_text_file_busy_retry,
};
