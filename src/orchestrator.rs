//! The chat orchestrator: the turn loop tying the hub, the streaming
//! engine, the tool registry and the per-tenant LLM client cache together.
//!
//! [`Orchestrator::handle_frame`] is the single entry point the WebSocket
//! reader task calls for every decoded inbound [`Envelope`]. Everything
//! that talks to the LLM runs on its own spawned task so the reader loop
//! is never blocked on a model response; the chunk callback handed to
//! [`crate::llm_client::LLMClient::stream_chat`] is synchronous and
//! mutates the streaming engine directly, forwarding what
//! changed to an unbounded channel a sibling task drains into
//! [`Hub::broadcast_to_project`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{inbound, outbound, Envelope};
use crate::config_cache::ClientConfigCache;
use crate::error::{AppError, AppResult};
use crate::hub::{Connection, Hub};
use crate::llm_client::{ChunkCallback, LlmChunk, LlmMessage};
use crate::store::{
    ConversationId, Message, MessageRole, ProjectId, Store, TenantId, ToolCallRecord, ToolCallStatus,
};
use crate::streaming::{StreamingEngine, TerminalStatus};
use crate::tools::{dispatch, ToolExecutionContext, ToolRegistry};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_uuid_field(data: &Value, field: &str) -> AppResult<Uuid> {
    let raw = data
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest(format!("missing required field '{field}'")))?;
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("'{field}' is not a valid uuid")))
}

/// Ties the shared collaborators together and dispatches inbound frames.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    streaming: Arc<StreamingEngine>,
    tools: Arc<ToolRegistry>,
    config_cache: Arc<ClientConfigCache>,
    tool_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        streaming: Arc<StreamingEngine>,
        tools: Arc<ToolRegistry>,
        config_cache: Arc<ClientConfigCache>,
        tool_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            streaming,
            tools,
            config_cache,
            tool_timeout,
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn streaming(&self) -> &Arc<StreamingEngine> {
        &self.streaming
    }

    pub fn config_cache(&self) -> &Arc<ClientConfigCache> {
        &self.config_cache
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Dispatch one decoded inbound frame. Any error is turned into an
    /// `error` envelope sent back to the originating connection rather
    /// than propagated — a malformed frame never tears down the socket.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, envelope: Envelope) {
        let result = match envelope.kind.as_str() {
            inbound::PING => {
                self.hub
                    .send_to_connection(conn.id, &Envelope::new(outbound::PONG, serde_json::json!({}), now_ms()))
                    .await;
                return;
            }
            inbound::JOIN_PROJECT => self.handle_join_project(conn, &envelope.data).await,
            inbound::LEAVE_PROJECT => self.handle_leave_project(conn, &envelope.data).await,
            inbound::USER_MESSAGE => self.handle_user_message(conn, &envelope.data).await,
            inbound::CREATE_CONVERSATION => self.handle_create_conversation(conn, &envelope.data).await,
            inbound::GET_CONVERSATIONS => self.handle_get_conversations(conn).await,
            inbound::GET_CONVERSATION => self.handle_get_conversation(conn, &envelope.data).await,
            inbound::DELETE_CONVERSATION => self.handle_delete_conversation(conn, &envelope.data).await,
            inbound::GET_STREAMING_CONVERSATION => self.handle_get_streaming_conversation(conn, &envelope.data).await,
            other => Err(AppError::BadRequest(format!("unknown frame type '{other}'"))),
        };
        if let Err(err) = result {
            self.hub.send_to_connection(conn.id, &Envelope::error(&err, now_ms())).await;
        }
    }

    /// Interrupt every in-flight turn this connection owns and unregister
    /// it from the hub. Called once by the reader task on socket close.
    pub async fn handle_disconnect(&self, conn: &Connection) {
        for conversation_id in conn.tracked_conversations() {
            self.streaming.interrupt(conversation_id, "connection_closed");
        }
        self.hub.unregister(conn.id).await;
    }

    async fn handle_join_project(&self, conn: &Connection, data: &Value) -> AppResult<()> {
        let project_id = parse_uuid_field(data, "project_id")?;
        self.hub.join(conn.id, project_id).await;
        self.hub
            .send_to_connection(
                conn.id,
                &Envelope::new(
                    outbound::PROJECT_JOINED,
                    serde_json::json!({"project_id": project_id}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_leave_project(&self, conn: &Connection, data: &Value) -> AppResult<()> {
        let project_id = parse_uuid_field(data, "project_id")?;
        self.hub.leave(conn.id, project_id).await;
        self.hub
            .send_to_connection(
                conn.id,
                &Envelope::new(
                    outbound::PROJECT_LEFT,
                    serde_json::json!({"project_id": project_id}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    async fn current_project(&self, conn: &Connection) -> AppResult<ProjectId> {
        conn.project()
            .await
            .ok_or_else(|| AppError::Forbidden("connection has not joined a project".into()))
    }

    async fn handle_user_message(&self, conn: &Arc<Connection>, data: &Value) -> AppResult<()> {
        let conversation_id = parse_uuid_field(data, "conversation_id")?;
        let content = data
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("missing required field 'content'".into()))?
            .to_string();
        self.start_turn(conn, conversation_id, content).await
    }

    async fn handle_create_conversation(&self, conn: &Arc<Connection>, data: &Value) -> AppResult<()> {
        let project_id = self.current_project(conn).await?;
        let title = data.get("title").and_then(Value::as_str).map(str::to_string);
        let initial_message = data.get("initial_message").and_then(Value::as_str).map(str::to_string);

        let conversation = self.store.create_conversation(project_id, title).await?;
        self.hub
            .broadcast_to_project(
                project_id,
                &Envelope::new(
                    outbound::CONVERSATION_CREATED,
                    serde_json::json!({"conversation": conversation}),
                    now_ms(),
                ),
            )
            .await;

        if let Some(content) = initial_message {
            self.start_turn(conn, conversation.id, content).await?;
        }
        Ok(())
    }

    async fn handle_get_conversations(&self, conn: &Connection) -> AppResult<()> {
        let project_id = self.current_project(conn).await?;
        let conversations = self.store.list_conversations(project_id).await?;
        self.hub
            .send_to_connection(
                conn.id,
                &Envelope::new(
                    outbound::CONVERSATIONS_LIST,
                    serde_json::json!({"conversations": conversations}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_get_conversation(&self, conn: &Connection, data: &Value) -> AppResult<()> {
        let conversation_id = parse_uuid_field(data, "conversation_id")?;
        let project_id = self.current_project(conn).await?;
        let conversation = self.store.get_conversation(conversation_id).await?;
        if conversation.project_id != project_id {
            return Err(AppError::Forbidden("conversation does not belong to this project".into()));
        }
        self.hub
            .send_to_connection(
                conn.id,
                &Envelope::new(
                    outbound::CONVERSATION_DETAILS,
                    serde_json::json!({"conversation": conversation}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_delete_conversation(&self, conn: &Connection, data: &Value) -> AppResult<()> {
        let conversation_id = parse_uuid_field(data, "conversation_id")?;
        let project_id = self.current_project(conn).await?;
        let conversation = self.store.get_conversation(conversation_id).await?;
        if conversation.project_id != project_id {
            return Err(AppError::Forbidden("conversation does not belong to this project".into()));
        }
        self.store.delete_conversation(conversation_id).await?;
        self.streaming.interrupt(conversation_id, "conversation_deleted");
        self.hub
            .broadcast_to_project(
                project_id,
                &Envelope::new(
                    outbound::CONVERSATION_DELETED,
                    serde_json::json!({"conversation_id": conversation_id}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    async fn handle_get_streaming_conversation(&self, conn: &Connection, data: &Value) -> AppResult<()> {
        let conversation_id = parse_uuid_field(data, "conversation_id")?;
        let project_id = self.current_project(conn).await?;

        if let Some(stream) = self.streaming.snapshot(conversation_id) {
            if stream.project_id != project_id {
                return Err(AppError::Forbidden("conversation does not belong to this project".into()));
            }
            self.hub
                .send_to_connection(
                    conn.id,
                    &Envelope::new(
                        outbound::ASSISTANT_RESPONSE,
                        serde_json::json!({
                            "conversation_id": conversation_id,
                            "content": stream.content,
                            "delta": false,
                            "done": stream.status.is_terminal(),
                            "tool_calls": stream.tool_calls.values().cloned().collect::<Vec<_>>(),
                        }),
                        now_ms(),
                    ),
                )
                .await;
            return Ok(());
        }

        let conversation = self.store.get_conversation(conversation_id).await?;
        if conversation.project_id != project_id {
            return Err(AppError::Forbidden("conversation does not belong to this project".into()));
        }
        self.hub
            .send_to_connection(
                conn.id,
                &Envelope::new(
                    outbound::CONVERSATION_DETAILS,
                    serde_json::json!({"conversation": conversation}),
                    now_ms(),
                ),
            )
            .await;
        Ok(())
    }

    /// Persist the user message, resolve the tenant's LLM client, open the
    /// active stream, and hand the turn off to a spawned driver task. The
    /// user message is always persisted before the LLM client is resolved.
    async fn start_turn(&self, conn: &Arc<Connection>, conversation_id: ConversationId, content: String) -> AppResult<()> {
        if conn.over_ceiling() {
            return Err(AppError::TokenLimitExceeded);
        }
        let project_id = self.persist_and_broadcast_user_message(conn, conversation_id, content).await?;
        let llm = self.config_cache.get(&conn.tenant_id).await?;
        self.open_stream_and_spawn_driver(conn, conversation_id, project_id, llm).await
    }

    /// [`Orchestrator::start_turn`], parameterised on the LLM client rather
    /// than resolving it through the [`ClientConfigCache`]. Exists so
    /// integration tests can drive a full turn against a
    /// [`crate::llm_client::MockLlmClient`] without standing up a real
    /// upstream provider. Preserves the same persist-before-LLM ordering.
    pub async fn start_turn_with_client(
        &self,
        conn: &Arc<Connection>,
        conversation_id: ConversationId,
        content: String,
        llm: Arc<dyn crate::llm_client::LLMClient>,
    ) -> AppResult<()> {
        if conn.over_ceiling() {
            return Err(AppError::TokenLimitExceeded);
        }
        let project_id = self.persist_and_broadcast_user_message(conn, conversation_id, content).await?;
        self.open_stream_and_spawn_driver(conn, conversation_id, project_id, llm).await
    }

    async fn persist_and_broadcast_user_message(
        &self,
        conn: &Connection,
        conversation_id: ConversationId,
        content: String,
    ) -> AppResult<ProjectId> {
        let project_id = self.current_project(conn).await?;

        let user_message = Message::user(conversation_id, content);
        self.store.append_message(conversation_id, user_message.clone()).await?;
        self.hub
            .broadcast_to_project(
                project_id,
                &Envelope::new(
                    outbound::USER_MESSAGE_SENT,
                    serde_json::json!({"message": user_message}),
                    now_ms(),
                ),
            )
            .await;
        Ok(project_id)
    }

    async fn open_stream_and_spawn_driver(
        &self,
        conn: &Arc<Connection>,
        conversation_id: ConversationId,
        project_id: ProjectId,
        llm: Arc<dyn crate::llm_client::LLMClient>,
    ) -> AppResult<()> {
        self.streaming.begin(conversation_id, project_id, conn.user_id.clone())?;
        conn.track_conversation(conversation_id);

        let driver = TurnDriver {
            store: self.store.clone(),
            hub: self.hub.clone(),
            streaming: self.streaming.clone(),
            tools: self.tools.clone(),
            tool_timeout: self.tool_timeout,
            conn: conn.clone(),
            tenant_id: conn.tenant_id.clone(),
            project_id,
            conversation_id,
        };
        tokio::spawn(async move { driver.run(llm).await });
        Ok(())
    }
}

/// Owns one turn's worth of state once handed off by
/// [`Orchestrator::start_turn`]. Lives entirely on its own spawned task so
/// a slow or stuck model response never blocks the reader loop.
struct TurnDriver {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    streaming: Arc<StreamingEngine>,
    tools: Arc<ToolRegistry>,
    tool_timeout: Duration,
    conn: Arc<Connection>,
    tenant_id: TenantId,
    project_id: ProjectId,
    conversation_id: ConversationId,
}

impl TurnDriver {
    async fn run(self, llm: Arc<dyn crate::llm_client::LLMClient>) {
        let conversation_id = self.conversation_id;
        let project_id = self.project_id;

        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(%conversation_id, error = %e, "failed to load conversation for turn");
                self.streaming.interrupt(conversation_id, "persist_error");
                self.broadcast_interrupted("persist_error").await;
                self.conn.untrack_conversation(conversation_id);
                return;
            }
        };
        let messages: Vec<LlmMessage> = conversation
            .messages
            .iter()
            .map(|m| LlmMessage {
                role: match m.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();
        let tool_specs = self.tools.tool_specs();

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let hub_forward = self.hub.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                hub_forward.broadcast_to_project(project_id, &envelope).await;
            }
        });

        let message_id = Uuid::new_v4();
        let pending_tools = Arc::new(std::sync::Mutex::new(Vec::<tokio::task::JoinHandle<()>>::new()));

        let callback: ChunkCallback = {
            let streaming = self.streaming.clone();
            let tx = tx.clone();
            let tools = self.tools.clone();
            let store = self.store.clone();
            let tenant_id = self.tenant_id.clone();
            let user_id = self.conn.user_id.clone();
            let tool_timeout = self.tool_timeout;
            let pending_tools = pending_tools.clone();
            let conn = self.conn.clone();
            Arc::new(move |chunk: LlmChunk| {
                on_llm_chunk(
                    chunk,
                    conversation_id,
                    project_id,
                    message_id,
                    &streaming,
                    &tx,
                    &tools,
                    &store,
                    &tenant_id,
                    &user_id,
                    tool_timeout,
                    &pending_tools,
                    &conn,
                )
            })
        };

        let stream_result = llm.stream_chat(messages, tool_specs, callback).await;

        // Let every tool-call task spawned from the chunk callback finish
        // before closing out the turn, so the persisted message carries
        // final tool-call statuses rather than `pending`.
        let handles = std::mem::take(&mut *pending_tools.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        let snapshot = match stream_result {
            Ok(()) => {
                if self.streaming.is_active(conversation_id) {
                    self.streaming.finish(conversation_id, TerminalStatus::Completed).ok()
                } else {
                    self.streaming.snapshot(conversation_id)
                }
            }
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "llm transport error, interrupting stream");
                self.streaming.interrupt(conversation_id, "upstream_error");
                let _ = tx.send(Envelope::new(
                    outbound::CHAT_INTERRUPTED,
                    serde_json::json!({"conversation_id": conversation_id, "reason": "upstream_error"}),
                    now_ms(),
                ));
                self.streaming.snapshot(conversation_id)
            }
        };

        if let Some(snapshot) = snapshot {
            let mut assistant_message = Message::assistant(conversation_id, snapshot.content.clone());
            assistant_message.tool_calls = snapshot.tool_calls.values().cloned().collect();
            assistant_message.tokens_used = Some(self.conn.tokens_used());
            if let Err(e) = self.store.append_message(conversation_id, assistant_message.clone()).await {
                tracing::error!(%conversation_id, error = %e, "failed to persist assistant message");
            }
            let _ = tx.send(Envelope::new(
                outbound::ASSISTANT_RESPONSE,
                serde_json::json!({
                    "conversation_id": conversation_id,
                    "message_id": message_id,
                    "content": snapshot.content,
                    "delta": false,
                    "done": true,
                    "tool_calls": assistant_message.tool_calls,
                }),
                now_ms(),
            ));
        }

        self.conn.untrack_conversation(conversation_id);
        drop(tx);
        let _ = forwarder.await;
    }

    async fn broadcast_interrupted(&self, reason: &str) {
        self.hub
            .broadcast_to_project(
                self.project_id,
                &Envelope::new(
                    outbound::CHAT_INTERRUPTED,
                    serde_json::json!({"conversation_id": self.conversation_id, "reason": reason}),
                    now_ms(),
                ),
            )
            .await;
    }
}

/// The synchronous chunk callback body, pulled out of the closure for
/// readability. Every branch either mutates the streaming engine directly
/// or spawns a short-lived async task to do so.
#[allow(clippy::too_many_arguments)]
fn on_llm_chunk(
    chunk: LlmChunk,
    conversation_id: ConversationId,
    project_id: ProjectId,
    message_id: Uuid,
    streaming: &Arc<StreamingEngine>,
    tx: &mpsc::UnboundedSender<Envelope>,
    tools: &Arc<ToolRegistry>,
    store: &Arc<dyn Store>,
    tenant_id: &TenantId,
    user_id: &str,
    tool_timeout: Duration,
    pending_tools: &Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    conn: &Arc<Connection>,
) {
    match chunk {
        LlmChunk::ContentDelta(text) => match streaming.append(conversation_id, &text) {
            Ok(outcome) => {
                let _ = tx.send(Envelope::new(
                    outbound::ASSISTANT_RESPONSE,
                    serde_json::json!({
                        "conversation_id": conversation_id,
                        "message_id": message_id,
                        "content": outcome.delta,
                        "delta": true,
                        "done": false,
                    }),
                    now_ms(),
                ));
                if outcome.capped {
                    let _ = tx.send(Envelope::new(
                        outbound::CHAT_INTERRUPTED,
                        serde_json::json!({"conversation_id": conversation_id, "reason": "response_too_large"}),
                        now_ms(),
                    ));
                }
            }
            Err(e) => tracing::warn!(%conversation_id, error = %e, "dropped content chunk"),
        },
        LlmChunk::ToolCall { id, name, arguments } => {
            let record = ToolCallRecord {
                id: id.clone(),
                tool_name: name.clone(),
                arguments: arguments.clone(),
                status: ToolCallStatus::Pending,
                result: None,
                error: None,
                duration_ms: None,
            };
            if let Err(e) = streaming.register_tool_call(conversation_id, record) {
                tracing::warn!(%conversation_id, error = %e, "dropped tool call registration");
                return;
            }
            let _ = tx.send(Envelope::new(
                outbound::TOOL_EXECUTION_STARTED,
                serde_json::json!({"conversation_id": conversation_id, "tool_call_id": id, "tool_name": name}),
                now_ms(),
            ));

            let streaming = streaming.clone();
            let tx = tx.clone();
            let tools = tools.clone();
            let store = store.clone();
            let tenant_id = tenant_id.clone();
            let user_id = user_id.to_string();
            let handle = tokio::spawn(async move {
                let ctx = ToolExecutionContext {
                    tenant_id,
                    project_id,
                    user_id,
                    store,
                    timeout: tool_timeout,
                };
                let started = Instant::now();
                let outcome = tokio::time::timeout(tool_timeout, dispatch(&tools, &ctx, &name, &arguments)).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let (status, result, error, code) = match outcome {
                    Ok(Ok(value)) => (ToolCallStatus::Completed, Some(value), None, None),
                    Ok(Err(err)) => (ToolCallStatus::Failed, None, Some(err.to_string()), Some(err.code())),
                    Err(_) => (
                        ToolCallStatus::Failed,
                        None,
                        Some("tool execution timed out".to_string()),
                        Some(AppError::ToolExecutionFailed("timed out".into()).code()),
                    ),
                };
                let _ = streaming.update_tool_call(conversation_id, &id, status, result.clone(), error.clone(), Some(duration_ms));

                let frame = match status {
                    ToolCallStatus::Completed => Envelope::new(
                        outbound::TOOL_EXECUTION_COMPLETED,
                        serde_json::json!({
                            "conversation_id": conversation_id,
                            "tool_call_id": id,
                            "tool_name": name,
                            "result": result,
                            "execution_time_ms": duration_ms,
                        }),
                        now_ms(),
                    ),
                    _ => Envelope::new(
                        outbound::TOOL_EXECUTION_FAILED,
                        serde_json::json!({
                            "conversation_id": conversation_id,
                            "tool_call_id": id,
                            "tool_name": name,
                            "error": error,
                            "code": code,
                            "execution_time_ms": duration_ms,
                        }),
                        now_ms(),
                    ),
                };
                let _ = tx.send(frame);
            });
            pending_tools.lock().unwrap().push(handle);
        }
        LlmChunk::Usage { total_tokens } => {
            conn.record_tokens(total_tokens);
            let _ = tx.send(Envelope::new(
                outbound::ASSISTANT_RESPONSE,
                serde_json::json!({
                    "conversation_id": conversation_id,
                    "message_id": message_id,
                    "content": "",
                    "delta": true,
                    "done": false,
                    "tokens_used": total_tokens,
                }),
                now_ms(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::ClientConfigCache;
    use crate::hub::Hub;
    use crate::llm_client::MockLlmClient;
    use crate::store::MemoryStore;
    use crate::streaming::StreamingEngine;
    use crate::tools::ToolRegistry;

    fn test_orchestrator() -> (Arc<Orchestrator>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hub = Hub::new();
        let streaming = StreamingEngine::new(Duration::from_millis(50), 1024 * 1024);
        let tools = Arc::new(ToolRegistry::with_default_tools());
        let config_cache = Arc::new(ClientConfigCache::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        let orchestrator = Orchestrator::new(store.clone(), hub, streaming, tools, config_cache, Duration::from_secs(5));
        (orchestrator, store)
    }

    async fn new_connection(orchestrator: &Orchestrator, tenant: &str) -> (Arc<Connection>, mpsc::Receiver<Vec<u8>>) {
        let (conn, rx) = Connection::new("u1".into(), tenant.into(), 1_000_000, 32);
        orchestrator.hub.register(conn.clone()).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn join_project_then_user_message_broadcasts_and_persists() {
        let (orchestrator, store) = test_orchestrator();
        let (conn, mut rx) = new_connection(&orchestrator, "t1").await;

        let project_id = Uuid::new_v4();
        orchestrator
            .handle_frame(
                &conn,
                Envelope::new(inbound::JOIN_PROJECT, serde_json::json!({"project_id": project_id}), 0),
            )
            .await;
        let _joined = rx.recv().await.unwrap();

        let conversation = store.create_conversation(project_id, None).await.unwrap();
        orchestrator
            .handle_frame(
                &conn,
                Envelope::new(
                    inbound::USER_MESSAGE,
                    serde_json::json!({"conversation_id": conversation.id, "content": "hello"}),
                    0,
                ),
            )
            .await;

        let sent = rx.recv().await.unwrap();
        let env: Envelope = serde_json::from_slice(&sent).unwrap();
        assert_eq!(env.kind, outbound::USER_MESSAGE_SENT);

        let persisted = store.get_conversation(conversation.id).await.unwrap();
        assert_eq!(persisted.messages.len(), 1);
        assert_eq!(persisted.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn token_ceiling_blocks_turn_before_any_persistence() {
        let (orchestrator, store) = test_orchestrator();
        let (conn, mut rx) = new_connection(&orchestrator, "t1").await;
        conn.set_ceiling(1);
        conn.record_tokens(1);

        let project_id = Uuid::new_v4();
        orchestrator.hub.join(conn.id, project_id).await;
        let conversation = store.create_conversation(project_id, None).await.unwrap();

        orchestrator
            .handle_frame(
                &conn,
                Envelope::new(
                    inbound::USER_MESSAGE,
                    serde_json::json!({"conversation_id": conversation.id, "content": "hello"}),
                    0,
                ),
            )
            .await;

        let sent = rx.recv().await.unwrap();
        let env: Envelope = serde_json::from_slice(&sent).unwrap();
        assert_eq!(env.kind, outbound::ERROR);
        assert_eq!(env.data["code"], "token_limit_exceeded");

        let persisted = store.get_conversation(conversation.id).await.unwrap();
        assert!(persisted.messages.is_empty());
    }

    #[tokio::test]
    async fn duplicate_turn_on_same_conversation_is_rejected() {
        let (orchestrator, store) = test_orchestrator();
        // A model that never finishes (script empty via a channel client would need extra plumbing);
        // instead exercise Conflict directly against the streaming engine, mirroring what start_turn does.
        let project_id = Uuid::new_v4();
        let conversation = store.create_conversation(project_id, None).await.unwrap();
        orchestrator
            .streaming
            .begin(conversation.id, project_id, "u1".into())
            .unwrap();
        let err = orchestrator
            .streaming
            .begin(conversation.id, project_id, "u1".into())
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn full_turn_with_mock_client_persists_assistant_message() {
        let (orchestrator, store) = test_orchestrator();
        let (conn, mut rx) = new_connection(&orchestrator, "t1").await;
        let project_id = Uuid::new_v4();
        orchestrator.hub.join(conn.id, project_id).await;
        let conversation = store.create_conversation(project_id, None).await.unwrap();

        // Swap in a client that completes immediately instead of hitting the
        // cache's HTTP default — drive the turn machinery directly.
        let llm: Arc<dyn crate::llm_client::LLMClient> = Arc::new(MockLlmClient::echoing("mock", "hi there"));
        orchestrator
            .store
            .append_message(conversation.id, Message::user(conversation.id, "hello"))
            .await
            .unwrap();
        orchestrator
            .streaming
            .begin(conversation.id, project_id, conn.user_id.clone())
            .unwrap();
        conn.track_conversation(conversation.id);
        let driver = TurnDriver {
            store: orchestrator.store.clone(),
            hub: orchestrator.hub.clone(),
            streaming: orchestrator.streaming.clone(),
            tools: orchestrator.tools.clone(),
            tool_timeout: Duration::from_secs(5),
            conn: conn.clone(),
            tenant_id: conn.tenant_id.clone(),
            project_id,
            conversation_id: conversation.id,
        };
        driver.run(llm).await;

        // Drain whatever frames landed in the queue and find the final one.
        let mut last_assistant = None;
        while let Ok(bytes) = rx.try_recv() {
            let env: Envelope = serde_json::from_slice(&bytes).unwrap();
            if env.kind == outbound::ASSISTANT_RESPONSE && env.data["done"] == serde_json::json!(true) {
                last_assistant = Some(env);
            }
        }
        let final_env = last_assistant.expect("expected a final assistant_response frame");
        assert_eq!(final_env.data["content"], "hi there");

        let persisted = store.get_conversation(conversation.id).await.unwrap();
        assert_eq!(persisted.messages.len(), 2);
        assert_eq!(persisted.messages[1].role, MessageRole::Assistant);
        assert_eq!(persisted.messages[1].content, "hi there");
    }

    /// A `Usage` chunk arriving mid-stream must increment the connection's
    /// token counter through the real callback path, not just in a test
    /// that pokes `record_tokens` directly.
    #[tokio::test]
    async fn usage_chunk_increments_connection_token_counter() {
        use crate::llm_client::MockStep;

        let (orchestrator, store) = test_orchestrator();
        let (conn, _rx) = new_connection(&orchestrator, "t1").await;
        let project_id = Uuid::new_v4();
        orchestrator.hub.join(conn.id, project_id).await;
        let conversation = store.create_conversation(project_id, None).await.unwrap();

        assert_eq!(conn.tokens_used(), 0);

        let script = vec![
            MockStep::Delta("hi".into()),
            MockStep::Usage { total_tokens: 42 },
        ];
        let llm: Arc<dyn crate::llm_client::LLMClient> = Arc::new(MockLlmClient::new("mock", script));

        orchestrator
            .streaming
            .begin(conversation.id, project_id, conn.user_id.clone())
            .unwrap();
        conn.track_conversation(conversation.id);
        let driver = TurnDriver {
            store: orchestrator.store.clone(),
            hub: orchestrator.hub.clone(),
            streaming: orchestrator.streaming.clone(),
            tools: orchestrator.tools.clone(),
            tool_timeout: Duration::from_secs(5),
            conn: conn.clone(),
            tenant_id: conn.tenant_id.clone(),
            project_id,
            conversation_id: conversation.id,
        };
        driver.run(llm).await;

        assert_eq!(conn.tokens_used(), 42);
    }

    #[tokio::test]
    async fn disconnect_interrupts_tracked_conversations() {
        let (orchestrator, store) = test_orchestrator();
        let (conn, _rx) = new_connection(&orchestrator, "t1").await;
        let project_id = Uuid::new_v4();
        let conversation = store.create_conversation(project_id, None).await.unwrap();
        orchestrator
            .streaming
            .begin(conversation.id, project_id, conn.user_id.clone())
            .unwrap();
        conn.track_conversation(conversation.id);

        orchestrator.handle_disconnect(&conn).await;

        let snap = orchestrator.streaming.snapshot(conversation.id).unwrap();
        assert!(snap.status.is_terminal());
    }
}
