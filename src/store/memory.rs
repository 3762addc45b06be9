//! In-process [`Store`] implementation.
//!
//! The default backend for the binary and the backbone of the integration
//! tests in `tests/scenarios.rs`. Guarded the same way the hub and
//! streaming engine guard their tables: one `RwLock` per map, held only
//! for the map mutation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{AppError, AppResult};

use super::{
    Conversation, ConversationId, DataSource, Message, ProjectId, SessionRow, Store,
    TenantConfigRow,
};

#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    data_sources: RwLock<HashMap<String, DataSource>>,
    tenant_configs: RwLock<HashMap<String, TenantConfigRow>>,
    sessions: RwLock<HashMap<String, SessionRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session row (handshake token lookup target). Test/bootstrap helper.
    pub fn insert_session(&self, session: SessionRow) {
        self.sessions.write().insert(session.token_hash.clone(), session);
    }

    /// Seed a data source. Test/bootstrap helper.
    pub fn insert_data_source(&self, data_source: DataSource) {
        self.data_sources.write().insert(data_source.id.clone(), data_source);
    }

    /// Seed a tenant config row. Test/bootstrap helper.
    pub fn insert_tenant_config(&self, config: TenantConfigRow) {
        self.tenant_configs.write().insert(config.tenant_id.clone(), config);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_conversation(
        &self,
        project_id: ProjectId,
        title: Option<String>,
    ) -> AppResult<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new_v4(),
            project_id,
            title: title.unwrap_or_else(|| "Untitled conversation".to_string()),
            created_at: chrono::Utc::now(),
            messages: Vec::new(),
        };
        self.conversations
            .write()
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> AppResult<Conversation> {
        self.conversations
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("conversation {id} not found")))
    }

    async fn list_conversations(&self, project_id: ProjectId) -> AppResult<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .conversations
            .read()
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        list.sort_by_key(|c| c.created_at);
        Ok(list)
    }

    async fn delete_conversation(&self, id: ConversationId) -> AppResult<()> {
        self.conversations
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("conversation {id} not found")))
    }

    async fn append_message(&self, conversation_id: ConversationId, message: Message) -> AppResult<()> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| AppError::NotFound(format!("conversation {conversation_id} not found")))?;
        conversation.messages.push(message);
        Ok(())
    }

    async fn get_data_source(&self, id: &str) -> AppResult<DataSource> {
        self.data_sources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("data source {id} not found")))
    }

    async fn get_tenant_config(&self, tenant_id: &str) -> AppResult<Option<TenantConfigRow>> {
        Ok(self.tenant_configs.read().get(tenant_id).cloned())
    }

    async fn get_session(&self, token_hash: &str) -> AppResult<Option<SessionRow>> {
        Ok(self.sessions.read().get(token_hash).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DataSourceKind, MessageRole};

    #[tokio::test]
    async fn create_then_get_conversation() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let created = store.create_conversation(project, Some("t".into())).await.unwrap();
        let fetched = store.get_conversation(created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.title, "t");
    }

    #[tokio::test]
    async fn append_message_then_list() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let conv = store.create_conversation(project, None).await.unwrap();
        store
            .append_message(conv.id, Message::user(conv.id, "hi"))
            .await
            .unwrap();
        let fetched = store.get_conversation(conv.id).await.unwrap();
        assert_eq!(fetched.messages.len(), 1);
        assert_eq!(fetched.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn delete_removes_conversation() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(ProjectId::new_v4(), None).await.unwrap();
        store.delete_conversation(conv.id).await.unwrap();
        assert!(store.get_conversation(conv.id).await.is_err());
    }

    #[tokio::test]
    async fn data_source_scoped_lookup() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        store.insert_data_source(DataSource {
            id: "ds-1".into(),
            project_id: project,
            kind: DataSourceKind::Sql,
            config: serde_json::json!({"dsn": "postgres://x"}),
        });
        let ds = store.get_data_source("ds-1").await.unwrap();
        assert_eq!(ds.project_id, project);
    }
}
