//! The relational store — an external collaborator.
//!
//! The core only depends on the [`Store`] trait; persistence itself is out
//! of scope. [`memory::MemoryStore`] is a complete in-process
//! implementation used by the default binary and by tests. A
//! PostgreSQL-backed implementation is available behind the `postgres`
//! feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;

pub type ProjectId = Uuid;
pub type ConversationId = Uuid;
pub type DataSourceId = String;
pub type TenantId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A tool call recorded against an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: DateTime<Utc>,
    pub tokens_used: Option<u64>,
}

impl Message {
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
            tokens_used: None,
        }
    }

    pub fn assistant(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
            tokens_used: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub project_id: ProjectId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    Sql,
    Http,
}

/// A project-scoped data source a tool call may reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub project_id: ProjectId,
    pub kind: DataSourceKind,
    /// Opaque connection descriptor — a DSN for SQL, a base URL + auth for HTTP.
    pub config: serde_json::Value,
}

/// The tenant row the client-config cache loads on a miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfigRow {
    pub tenant_id: TenantId,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The session row the handshake token check resolves against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub token_hash: String,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub expires_at: DateTime<Utc>,
}

/// The relational store interface the core consumes.
///
/// Every method is fallible and asynchronous; implementations own their
/// own connection pooling and retry policy. The core never assumes a
/// specific backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_conversation(
        &self,
        project_id: ProjectId,
        title: Option<String>,
    ) -> AppResult<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> AppResult<Conversation>;

    async fn list_conversations(&self, project_id: ProjectId) -> AppResult<Vec<Conversation>>;

    async fn delete_conversation(&self, id: ConversationId) -> AppResult<()>;

    async fn append_message(&self, conversation_id: ConversationId, message: Message) -> AppResult<()>;

    async fn get_data_source(&self, id: &str) -> AppResult<DataSource>;

    async fn get_tenant_config(&self, tenant_id: &str) -> AppResult<Option<TenantConfigRow>>;

    async fn get_session(&self, token_hash: &str) -> AppResult<Option<SessionRow>>;
}

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
