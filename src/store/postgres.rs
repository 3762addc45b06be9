//! PostgreSQL-backed [`Store`] (feature `postgres`).
//!
//! A `sqlx::PgPool` wrapper with an idempotent `migrate()` and
//! straightforward `query`/`query_as` calls, no ORM layer.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};

use super::{
    Conversation, ConversationId, DataSource, DataSourceKind, Message, MessageRole, ProjectId,
    SessionRow, Store, TenantConfigRow,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                title TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                conversation_id UUID NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls JSONB NOT NULL DEFAULT '[]'::jsonb,
                tokens_used BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_sources (
                id TEXT PRIMARY KEY,
                project_id UUID NOT NULL,
                kind TEXT NOT NULL,
                config JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_configs (
                tenant_id TEXT PRIMARY KEY,
                api_key TEXT,
                base_url TEXT,
                model TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }
}

fn pg_err(e: sqlx::Error) -> AppError {
    AppError::Internal(format!("postgres error: {e}"))
}

fn role_to_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_str(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_conversation(
        &self,
        project_id: ProjectId,
        title: Option<String>,
    ) -> AppResult<Conversation> {
        let id = ConversationId::new_v4();
        let title = title.unwrap_or_else(|| "Untitled conversation".to_string());
        let row = sqlx::query_as::<_, (chrono::DateTime<chrono::Utc>,)>(
            "INSERT INTO conversations (id, project_id, title) VALUES ($1, $2, $3) RETURNING created_at",
        )
        .bind(id)
        .bind(project_id)
        .bind(&title)
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(Conversation {
            id,
            project_id,
            title,
            created_at: row.0,
            messages: Vec::new(),
        })
    }

    async fn get_conversation(&self, id: ConversationId) -> AppResult<Conversation> {
        let conv_row = sqlx::query_as::<_, (ProjectId, String, chrono::DateTime<chrono::Utc>)>(
            "SELECT project_id, title, created_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| AppError::NotFound(format!("conversation {id} not found")))?;

        let message_rows = sqlx::query_as::<_, (
            uuid::Uuid,
            String,
            String,
            serde_json::Value,
            Option<i64>,
            chrono::DateTime<chrono::Utc>,
        )>(
            "SELECT id, role, content, tool_calls, tokens_used, created_at FROM messages WHERE conversation_id = $1 ORDER BY created_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        let messages = message_rows
            .into_iter()
            .map(|(mid, role, content, tool_calls, tokens_used, created_at)| Message {
                id: mid,
                conversation_id: id,
                role: role_from_str(&role),
                content,
                tool_calls: serde_json::from_value(tool_calls).unwrap_or_default(),
                created_at,
                tokens_used: tokens_used.map(|v| v as u64),
            })
            .collect();

        Ok(Conversation {
            id,
            project_id: conv_row.0,
            title: conv_row.1,
            created_at: conv_row.2,
            messages,
        })
    }

    async fn list_conversations(&self, project_id: ProjectId) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, (ConversationId,)>(
            "SELECT id FROM conversations WHERE project_id = $1 ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for (id,) in rows {
            out.push(self.get_conversation(id).await?);
        }
        Ok(out)
    }

    async fn delete_conversation(&self, id: ConversationId) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("conversation {id} not found")));
        }
        Ok(())
    }

    async fn append_message(&self, conversation_id: ConversationId, message: Message) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, tool_calls, tokens_used) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(conversation_id)
        .bind(role_to_str(message.role))
        .bind(&message.content)
        .bind(serde_json::to_value(&message.tool_calls).unwrap_or_default())
        .bind(message.tokens_used.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn get_data_source(&self, id: &str) -> AppResult<DataSource> {
        let row = sqlx::query_as::<_, (String, ProjectId, String, serde_json::Value)>(
            "SELECT id, project_id, kind, config FROM data_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| AppError::NotFound(format!("data source {id} not found")))?;

        let kind = match row.2.as_str() {
            "http" => DataSourceKind::Http,
            _ => DataSourceKind::Sql,
        };

        Ok(DataSource {
            id: row.0,
            project_id: row.1,
            kind,
            config: row.3,
        })
    }

    async fn get_tenant_config(&self, tenant_id: &str) -> AppResult<Option<TenantConfigRow>> {
        let row = sqlx::query_as::<_, (String, Option<String>, Option<String>, Option<String>, chrono::DateTime<chrono::Utc>)>(
            "SELECT tenant_id, api_key, base_url, model, updated_at FROM tenant_configs WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(|(tenant_id, api_key, base_url, model, updated_at)| TenantConfigRow {
            tenant_id,
            api_key,
            base_url,
            model,
            updated_at,
        }))
    }

    async fn get_session(&self, token_hash: &str) -> AppResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, (String, String, String, chrono::DateTime<chrono::Utc>)>(
            "SELECT token_hash, user_id, tenant_id, expires_at FROM sessions WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(|(token_hash, user_id, tenant_id, expires_at)| SessionRow {
            token_hash,
            user_id,
            tenant_id,
            expires_at,
        }))
    }
}
