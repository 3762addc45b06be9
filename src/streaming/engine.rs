//! Active-stream table and the `begin`/`append`/`finish`/`interrupt`/
//! `snapshot` operations.
//!
//! Every operation here is synchronous: the table is guarded by a
//! `parking_lot::RwLock` held only for the map mutation itself, with all
//! I/O performed outside the lock. This is what lets [`crate::orchestrator`] call `append`
//! directly from the (synchronous) LLM chunk callback without needing an
//! async closure type — the callback mutates state reachable through
//! this table, never a pointer captured at `begin` time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{AppError, AppResult};
use crate::store::{ConversationId, ProjectId, ToolCallRecord, ToolCallStatus, UserId};

/// Terminal outcome of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Running,
    Completed,
    Interrupted(String),
    Failed(String),
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Running)
    }
}

/// The caller-facing terminal status passed to [`StreamingEngine::finish`].
#[derive(Debug, Clone)]
pub enum TerminalStatus {
    Completed,
    Interrupted(String),
    Failed(String),
}

/// The in-memory record of an in-progress (or just-terminated, within the
/// grace window) assistant response.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub conversation_id: ConversationId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub last_chunk_at: DateTime<Utc>,
    pub content: String,
    pub tool_calls: HashMap<String, ToolCallRecord>,
    pub status: StreamStatus,
}

impl ActiveStream {
    fn new(conversation_id: ConversationId, project_id: ProjectId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            project_id,
            user_id,
            started_at: now,
            last_chunk_at: now,
            content: String::new(),
            tool_calls: HashMap::new(),
            status: StreamStatus::Running,
        }
    }
}

/// The result of a [`StreamingEngine::append`] call: what the caller
/// should broadcast, and whether the byte cap forced termination.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The delta just appended.
    pub delta: String,
    /// The full accumulated content after this append.
    pub accumulated: String,
    /// `true` if the per-stream byte cap was exceeded by this append,
    /// meaning the stream is now terminal with `response_too_large`.
    pub capped: bool,
}

/// The active-stream registry and its five operations.
pub struct StreamingEngine {
    table: RwLock<HashMap<ConversationId, ActiveStream>>,
    grace_window: Duration,
    max_bytes: usize,
}

impl StreamingEngine {
    pub fn new(grace_window: Duration, max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(HashMap::new()),
            grace_window,
            max_bytes,
        })
    }

    /// Insert a new active stream. Fails with `Conflict` if a non-terminal
    /// entry already exists for this conversation.
    pub fn begin(&self, conversation_id: ConversationId, project_id: ProjectId, user_id: UserId) -> AppResult<()> {
        let mut table = self.table.write();
        if let Some(existing) = table.get(&conversation_id) {
            if !existing.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "stream already active for conversation {conversation_id}"
                )));
            }
        }
        table.insert(
            conversation_id,
            ActiveStream::new(conversation_id, project_id, user_id),
        );
        tracing::info!(%conversation_id, "stream begin");
        Ok(())
    }

    /// Mutate the accumulator **through the table entry** — never through a
    /// pointer captured outside this method — and return what changed so
    /// the caller (the orchestrator's chunk callback) can fan it out.
    pub fn append(&self, conversation_id: ConversationId, chunk: &str) -> AppResult<AppendOutcome> {
        let mut table = self.table.write();
        let stream = table
            .get_mut(&conversation_id)
            .ok_or_else(|| AppError::Internal(format!("append on unknown stream {conversation_id}")))?;

        if stream.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "append on terminal stream {conversation_id}"
            )));
        }

        stream.content.push_str(chunk);
        stream.last_chunk_at = Utc::now();

        let capped = stream.content.len() > self.max_bytes;
        if capped {
            stream.status = StreamStatus::Interrupted("response_too_large".to_string());
            tracing::warn!(%conversation_id, bytes = stream.content.len(), "stream exceeded byte cap");
        }

        Ok(AppendOutcome {
            delta: chunk.to_string(),
            accumulated: stream.content.clone(),
            capped,
        })
    }

    /// Register a newly-observed tool call as `pending`.
    pub fn register_tool_call(&self, conversation_id: ConversationId, record: ToolCallRecord) -> AppResult<()> {
        let mut table = self.table.write();
        let stream = table
            .get_mut(&conversation_id)
            .ok_or_else(|| AppError::Internal(format!("tool call on unknown stream {conversation_id}")))?;
        stream.tool_calls.insert(record.id.clone(), record);
        Ok(())
    }

    /// Update a tool call's status/result in place.
    pub fn update_tool_call(
        &self,
        conversation_id: ConversationId,
        tool_call_id: &str,
        status: ToolCallStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> AppResult<()> {
        let mut table = self.table.write();
        let stream = table
            .get_mut(&conversation_id)
            .ok_or_else(|| AppError::Internal(format!("tool call update on unknown stream {conversation_id}")))?;
        let record = stream.tool_calls.get_mut(tool_call_id).ok_or_else(|| {
            AppError::Internal(format!("unknown tool call {tool_call_id} on stream {conversation_id}"))
        })?;
        record.status = status;
        record.result = result;
        record.error = error;
        record.duration_ms = duration_ms;
        Ok(())
    }

    /// Transition the stream to a terminal state and schedule its removal
    /// after the grace window. Returns the final snapshot for persistence.
    pub fn finish(self: &Arc<Self>, conversation_id: ConversationId, terminal: TerminalStatus) -> AppResult<ActiveStream> {
        let snapshot = {
            let mut table = self.table.write();
            let stream = table
                .get_mut(&conversation_id)
                .ok_or_else(|| AppError::Internal(format!("finish on unknown stream {conversation_id}")))?;
            stream.status = match terminal {
                TerminalStatus::Completed => StreamStatus::Completed,
                TerminalStatus::Interrupted(reason) => StreamStatus::Interrupted(reason),
                TerminalStatus::Failed(reason) => StreamStatus::Failed(reason),
            };
            stream.clone()
        };
        tracing::info!(%conversation_id, status = ?snapshot.status, "stream finish");
        self.schedule_removal(conversation_id);
        Ok(snapshot)
    }

    /// Idempotent: once terminal, repeated calls are no-ops and observe
    /// the same terminal status.
    pub fn interrupt(self: &Arc<Self>, conversation_id: ConversationId, reason: &str) {
        let became_terminal = {
            let mut table = self.table.write();
            match table.get_mut(&conversation_id) {
                Some(stream) if !stream.status.is_terminal() => {
                    stream.status = StreamStatus::Interrupted(reason.to_string());
                    true
                }
                _ => false,
            }
        };
        if became_terminal {
            tracing::info!(%conversation_id, reason, "stream interrupted");
            self.schedule_removal(conversation_id);
        }
    }

    /// A read-only copy of the current state, for resume requests and
    /// tests. `None` once the entry has been removed (terminal + past the
    /// grace window).
    pub fn snapshot(&self, conversation_id: ConversationId) -> Option<ActiveStream> {
        self.table.read().get(&conversation_id).cloned()
    }

    pub fn is_active(&self, conversation_id: ConversationId) -> bool {
        self.table
            .read()
            .get(&conversation_id)
            .is_some_and(|s| !s.status.is_terminal())
    }

    fn schedule_removal(self: &Arc<Self>, conversation_id: ConversationId) {
        let engine = self.clone();
        let grace_window = self.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(grace_window).await;
            let mut table = engine.table.write();
            if let Some(stream) = table.get(&conversation_id) {
                if stream.status.is_terminal() {
                    table.remove(&conversation_id);
                    tracing::debug!(%conversation_id, "removed stream after grace window");
                }
            }
        });
    }
}
