//! Keyed pool of long-lived agent sessions.
//!
//! Each session owns one agent instance reached through an [`AgentTransport`].
//! A session accepts a turn only while it is ready and not busy; the reader
//! task completes the turn when the agent's `result` frame arrives. The pool
//! never holds more than `max_sessions` sessions, evicting the least recently
//! active idle session when a new one is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use quill_core::{lock_unpoisoned, Clock, SystemClock};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::AgentPoolError;
use crate::protocol::{decode_agent_frame, encode_user_frame, AgentFrame};
use crate::transport::{AgentReader, AgentTerminator, AgentTransport, AgentWriter};

const DEFAULT_MAX_SESSIONS: usize = 4;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPoolConfig {
    pub max_sessions: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub termination_grace: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

impl AgentPoolConfig {
    pub fn validate(&self) -> Result<(), AgentPoolError> {
        if self.max_sessions == 0 {
            return Err(AgentPoolError::InvalidConfig(
                "max_sessions must be greater than 0".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(AgentPoolError::InvalidConfig(
                "handshake_timeout must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(AgentPoolError::InvalidConfig(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Caller-side reference to a pooled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSessionHandle {
    pub key: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionSnapshot {
    pub key: String,
    pub session_id: Option<String>,
    pub is_ready: bool,
    pub is_busy: bool,
    pub created_unix_ms: u64,
    pub last_activity_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTurnResult {
    pub session_id: String,
    pub text: String,
}

/// Receives streamed text chunks of the current turn.
pub type AgentChunkSink = Arc<dyn Fn(&str) + Send + Sync>;

type TurnOutcome = Result<AgentTurnResult, AgentPoolError>;
type SharedWriter = Arc<tokio::sync::Mutex<AgentWriter>>;

struct PendingTurn {
    on_chunk: AgentChunkSink,
    text: String,
    completion: oneshot::Sender<TurnOutcome>,
}

struct SessionRecord {
    key: String,
    session_id: Option<String>,
    is_ready: bool,
    is_busy: bool,
    created_unix_ms: u64,
    last_activity_unix_ms: u64,
    pending: Option<PendingTurn>,
    handshake: Option<oneshot::Sender<Result<String, AgentPoolError>>>,
    writer: Option<SharedWriter>,
    terminator: Option<Box<dyn AgentTerminator>>,
    reader: Option<JoinHandle<()>>,
}

impl SessionRecord {
    fn snapshot(&self) -> AgentSessionSnapshot {
        AgentSessionSnapshot {
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            is_ready: self.is_ready,
            is_busy: self.is_busy,
            created_unix_ms: self.created_unix_ms,
            last_activity_unix_ms: self.last_activity_unix_ms,
        }
    }

    fn is_idle(&self) -> bool {
        self.is_ready && !self.is_busy
    }
}

#[derive(Default)]
struct PoolState {
    next_key: u64,
    closed: bool,
    sessions: HashMap<String, SessionRecord>,
    session_index: HashMap<String, String>,
}

impl PoolState {
    fn remove_session(&mut self, key: &str) -> Option<SessionRecord> {
        let record = self.sessions.remove(key)?;
        self.session_index.retain(|_, owner| owner != key);
        Some(record)
    }
}

struct PoolShared {
    config: AgentPoolConfig,
    transport: Arc<dyn AgentTransport>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct AgentProcessPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for AgentProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcessPool")
            .field("config", &self.shared.config)
            .field("transport", &self.shared.transport)
            .field("live_sessions", &self.live_session_count())
            .finish()
    }
}

impl AgentProcessPool {
    pub fn new(
        config: AgentPoolConfig,
        transport: Arc<dyn AgentTransport>,
    ) -> Result<Self, AgentPoolError> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AgentPoolConfig,
        transport: Arc<dyn AgentTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AgentPoolError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                transport,
                clock,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn config(&self) -> &AgentPoolConfig {
        &self.shared.config
    }

    pub fn live_session_count(&self) -> usize {
        lock_unpoisoned(&self.shared.state).sessions.len()
    }

    /// Returns the ready session that owns `session_id`, or spawns a new one
    /// (resuming `session_id` when given) and waits for its handshake.
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
    ) -> Result<AgentSessionHandle, AgentPoolError> {
        let resume = session_id.map(str::trim).filter(|value| !value.is_empty());
        let (key, handshake_rx, evicted) = {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.closed {
                return Err(AgentPoolError::ShutDown);
            }
            if let Some(resume) = resume {
                if let Some(handle) = self.existing_handle(&mut state, resume) {
                    return Ok(handle);
                }
            }
            let evicted = self.make_room(&mut state)?;
            state.next_key = state.next_key.saturating_add(1);
            let key = format!("agent-{}", state.next_key);
            let now = self.shared.clock.now_unix_ms();
            let (handshake_tx, handshake_rx) = oneshot::channel();
            state.sessions.insert(
                key.clone(),
                SessionRecord {
                    key: key.clone(),
                    session_id: None,
                    is_ready: false,
                    is_busy: false,
                    created_unix_ms: now,
                    last_activity_unix_ms: now,
                    pending: None,
                    handshake: Some(handshake_tx),
                    writer: None,
                    terminator: None,
                    reader: None,
                },
            );
            (key, handshake_rx, evicted)
        };
        if let Some(evicted) = evicted {
            tracing::info!(evicted = %evicted.key, "evicted least recently active agent session");
            // Finish the eviction first so live processes never exceed the cap.
            teardown_session(evicted, self.shared.config.termination_grace, AgentPoolError::ShutDown)
                .await;
        }

        let connection = match self.shared.transport.connect(resume).await {
            Ok(connection) => connection,
            Err(error) => {
                lock_unpoisoned(&self.shared.state).remove_session(&key);
                return Err(error);
            }
        };
        let reader = tokio::spawn(run_session_reader(
            Arc::downgrade(&self.shared),
            key.clone(),
            connection.stdout,
        ));
        let mut leftover = None;
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            match state.sessions.get_mut(&key) {
                Some(record) => {
                    record.writer = Some(Arc::new(tokio::sync::Mutex::new(connection.stdin)));
                    record.terminator = Some(connection.terminator);
                    record.reader = Some(reader);
                }
                None => leftover = Some((connection.stdin, connection.terminator, reader)),
            }
        }
        if let Some((stdin, mut terminator, reader)) = leftover {
            // The pool shut down or the reader already hit EOF while connecting.
            drop(stdin);
            terminator.terminate(self.shared.config.termination_grace).await;
            reader.abort();
            return Err(AgentPoolError::ProcessExited {
                session_key: key,
                reason: "session removed during handshake".to_string(),
            });
        }

        let timeout = self.shared.config.handshake_timeout;
        match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(Ok(session_id))) => {
                tracing::debug!(key = %key, session_id = %session_id, "agent session ready");
                Ok(AgentSessionHandle { key, session_id })
            }
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_)) => Err(AgentPoolError::ProcessExited {
                session_key: key,
                reason: "handshake channel closed".to_string(),
            }),
            Err(_) => {
                let removed = lock_unpoisoned(&self.shared.state).remove_session(&key);
                if let Some(record) = removed {
                    self.spawn_teardown(record);
                }
                Err(AgentPoolError::HandshakeTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Sends one user turn and resolves when the agent's `result` frame arrives.
    /// Fails immediately when the session is not ready or already busy.
    pub async fn send(
        &self,
        handle: &AgentSessionHandle,
        message: &str,
        on_chunk: AgentChunkSink,
    ) -> Result<AgentTurnResult, AgentPoolError> {
        if message.trim().is_empty() {
            return Err(AgentPoolError::InvalidMessage);
        }
        let (writer, completion_rx) = {
            let mut state = lock_unpoisoned(&self.shared.state);
            let now = self.shared.clock.now_unix_ms();
            let Some(record) = state.sessions.get_mut(&handle.key) else {
                return Err(AgentPoolError::SessionNotFound(handle.key.clone()));
            };
            if !record.is_ready {
                return Err(AgentPoolError::NotReady(handle.key.clone()));
            }
            if record.is_busy {
                return Err(AgentPoolError::Busy(handle.key.clone()));
            }
            let Some(writer) = record.writer.clone() else {
                return Err(AgentPoolError::NotReady(handle.key.clone()));
            };
            let (completion_tx, completion_rx) = oneshot::channel();
            record.is_busy = true;
            record.last_activity_unix_ms = now;
            record.pending = Some(PendingTurn {
                on_chunk,
                text: String::new(),
                completion: completion_tx,
            });
            (writer, completion_rx)
        };

        let frame = encode_user_frame(message);
        let write_result = {
            let mut writer = writer.lock().await;
            match writer.write_all(frame.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(error) => Err(error),
            }
        };
        if let Err(error) = write_result {
            let removed = lock_unpoisoned(&self.shared.state).remove_session(&handle.key);
            if let Some(record) = removed {
                self.spawn_teardown(record);
            }
            return Err(AgentPoolError::Io {
                session_key: handle.key.clone(),
                error: error.to_string(),
            });
        }

        completion_rx.await.unwrap_or_else(|_| {
            Err(AgentPoolError::ProcessExited {
                session_key: handle.key.clone(),
                reason: "turn dropped without a result".to_string(),
            })
        })
    }

    pub fn snapshot(&self) -> Vec<AgentSessionSnapshot> {
        let state = lock_unpoisoned(&self.shared.state);
        let mut sessions = state
            .sessions
            .values()
            .map(SessionRecord::snapshot)
            .collect::<Vec<_>>();
        sessions.sort_by(|left, right| left.key.cmp(&right.key));
        sessions
    }

    /// Tears down one session and waits for its process to exit.
    pub async fn close(&self, handle: &AgentSessionHandle) -> Result<AgentSessionSnapshot, AgentPoolError> {
        let record = lock_unpoisoned(&self.shared.state)
            .remove_session(&handle.key)
            .ok_or_else(|| AgentPoolError::SessionNotFound(handle.key.clone()))?;
        let snapshot = record.snapshot();
        teardown_session(record, self.shared.config.termination_grace, AgentPoolError::ShutDown).await;
        Ok(snapshot)
    }

    /// Tears down ready sessions idle for longer than the idle timeout.
    pub async fn reap_idle_sessions(&self) -> Vec<AgentSessionSnapshot> {
        let now = self.shared.clock.now_unix_ms();
        let idle_ms = u64::try_from(self.shared.config.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let expired = {
            let mut state = lock_unpoisoned(&self.shared.state);
            let keys = state
                .sessions
                .values()
                .filter(|record| {
                    record.is_idle()
                        && now.saturating_sub(record.last_activity_unix_ms) > idle_ms
                })
                .map(|record| record.key.clone())
                .collect::<Vec<_>>();
            keys.iter()
                .filter_map(|key| state.remove_session(key))
                .collect::<Vec<_>>()
        };
        let mut reaped = Vec::with_capacity(expired.len());
        for record in expired {
            tracing::info!(key = %record.key, "reaping idle agent session");
            reaped.push(record.snapshot());
            teardown_session(record, self.shared.config.termination_grace, AgentPoolError::ShutDown)
                .await;
        }
        reaped.sort_by(|left, right| left.key.cmp(&right.key));
        reaped
    }

    /// Refuses new sessions and terminates every owned agent process.
    pub async fn shutdown_all(&self) -> usize {
        let records = {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.closed = true;
            state.session_index.clear();
            state.sessions.drain().map(|(_, record)| record).collect::<Vec<_>>()
        };
        let count = records.len();
        let grace = self.shared.config.termination_grace;
        let tasks = records
            .into_iter()
            .map(|record| tokio::spawn(teardown_session(record, grace, AgentPoolError::ShutDown)))
            .collect::<Vec<_>>();
        for task in tasks {
            let _ = task.await;
        }
        if count > 0 {
            tracing::info!(sessions = count, "agent pool shut down");
        }
        count
    }

    fn existing_handle(&self, state: &mut PoolState, session_id: &str) -> Option<AgentSessionHandle> {
        let key = state.session_index.get(session_id)?.clone();
        let now = self.shared.clock.now_unix_ms();
        let record = state.sessions.get_mut(&key)?;
        if !record.is_ready {
            return None;
        }
        record.last_activity_unix_ms = now;
        Some(AgentSessionHandle {
            key,
            session_id: record.session_id.clone().unwrap_or_else(|| session_id.to_string()),
        })
    }

    fn make_room(&self, state: &mut PoolState) -> Result<Option<SessionRecord>, AgentPoolError> {
        let limit = self.shared.config.max_sessions;
        if state.sessions.len() < limit {
            return Ok(None);
        }
        let victim = state
            .sessions
            .values()
            .filter(|record| record.is_idle())
            .min_by(|left, right| {
                left.last_activity_unix_ms
                    .cmp(&right.last_activity_unix_ms)
                    .then_with(|| left.created_unix_ms.cmp(&right.created_unix_ms))
            })
            .map(|record| record.key.clone());
        match victim {
            Some(key) => Ok(state.remove_session(&key)),
            None => Err(AgentPoolError::CapacityExhausted { limit }),
        }
    }

    fn spawn_teardown(&self, record: SessionRecord) {
        let grace = self.shared.config.termination_grace;
        tokio::spawn(teardown_session(record, grace, AgentPoolError::ShutDown));
    }
}

/// Fails outstanding work, closes stdin, and terminates the agent.
async fn teardown_session(mut record: SessionRecord, grace: Duration, reason: AgentPoolError) {
    if let Some(pending) = record.pending.take() {
        let _ = pending.completion.send(Err(reason.clone()));
    }
    if let Some(handshake) = record.handshake.take() {
        let _ = handshake.send(Err(reason));
    }
    if let Some(writer) = record.writer.take() {
        let mut writer = writer.lock().await;
        let _ = writer.shutdown().await;
    }
    if let Some(mut terminator) = record.terminator.take() {
        terminator.terminate(grace).await;
    }
    if let Some(reader) = record.reader.take() {
        reader.abort();
    }
}

async fn run_session_reader(shared: Weak<PoolShared>, key: String, stdout: AgentReader) {
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();
    let exit_reason = loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break "agent closed its output stream".to_string(),
            Ok(_) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let line = match std::str::from_utf8(&buffer) {
                    Ok(line) => line.trim_end_matches(['\n', '\r']),
                    Err(error) => {
                        tracing::warn!(key = %key, error = %error, "dropping non-utf8 agent output line");
                        continue;
                    }
                };
                if !handle_agent_line(&shared, &key, line) {
                    return;
                }
            }
            Err(error) => break format!("failed to read agent output: {error}"),
        }
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let removed = lock_unpoisoned(&shared.state).remove_session(&key);
    if let Some(mut record) = removed {
        tracing::warn!(key = %key, reason = %exit_reason, "agent session ended");
        // This task is the reader; teardown must not abort it mid-cleanup.
        record.reader = None;
        teardown_session(
            record,
            shared.config.termination_grace,
            AgentPoolError::ProcessExited {
                session_key: key,
                reason: exit_reason,
            },
        )
        .await;
    }
}

/// Applies one output line to the session. Returns false once the session is gone.
fn handle_agent_line(shared: &PoolShared, key: &str, line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let frame = match decode_agent_frame(line) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(key = %key, error = %error, "dropping malformed agent output line");
            return true;
        }
    };
    let now = shared.clock.now_unix_ms();
    let mut state = lock_unpoisoned(&shared.state);
    let Some(record) = state.sessions.get_mut(key) else {
        return false;
    };
    record.last_activity_unix_ms = now;
    match frame {
        AgentFrame::Init { session_id } => {
            let session_id = match &record.session_id {
                Some(existing) if existing != &session_id => {
                    tracing::debug!(key = %key, existing = %existing, reported = %session_id, "ignoring session id change");
                    existing.clone()
                }
                _ => session_id,
            };
            record.session_id = Some(session_id.clone());
            record.is_ready = true;
            if let Some(handshake) = record.handshake.take() {
                let _ = handshake.send(Ok(session_id.clone()));
            }
            state.session_index.insert(session_id, key.to_string());
        }
        AgentFrame::Delta { text } => {
            let Some(pending) = record.pending.as_mut() else {
                tracing::debug!(key = %key, "dropping agent output outside a turn");
                return true;
            };
            pending.text.push_str(&text);
            let on_chunk = Arc::clone(&pending.on_chunk);
            drop(state);
            on_chunk(&text);
        }
        AgentFrame::Result {
            session_id,
            is_error,
            result,
        } => {
            if record.session_id.is_none() {
                record.session_id = session_id;
            }
            record.is_busy = false;
            let resolved_session_id = record.session_id.clone().unwrap_or_default();
            let Some(pending) = record.pending.take() else {
                tracing::debug!(key = %key, "agent result without a pending turn");
                return true;
            };
            let text = result.unwrap_or(pending.text);
            let outcome = if is_error {
                Err(AgentPoolError::AgentReported(text))
            } else {
                Ok(AgentTurnResult {
                    session_id: resolved_session_id,
                    text,
                })
            };
            let _ = pending.completion.send(outcome);
        }
        AgentFrame::Ignored { frame_type } => {
            tracing::trace!(key = %key, frame_type = %frame_type, "ignoring agent frame");
        }
    }
    true
}
