//! Wire envelope codec — the framed JSON message used on the socket.
//!
//! Every inbound and outbound message is a single UTF-8 JSON object:
//!
//! ```json
//! { "type": "user_message", "data": { ... }, "timestamp": 1730000000000, "id": "..." }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// The framed envelope carried as a WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value, now_ms: i64) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: now_ms,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build an `error` envelope from an [`AppError`].
    pub fn error(err: &AppError, now_ms: i64) -> Self {
        Self::new("error", err.to_frame_data(), now_ms)
    }

    /// Encode to the UTF-8 JSON text sent on the wire.
    pub fn encode(&self) -> Result<String, AppError> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("envelope encode failed: {e}")))
    }

    /// Decode a raw text frame, rejecting frames over `max_bytes`.
    ///
    /// Oversized frames are dropped; the caller is expected to reply with
    /// an `error` envelope rather than propagate the frame.
    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self, AppError> {
        if raw.len() > max_bytes {
            return Err(AppError::BadRequest(format!(
                "frame of {} bytes exceeds ceiling of {max_bytes}",
                raw.len()
            )));
        }
        serde_json::from_str(raw).map_err(|e| AppError::BadRequest(format!("malformed envelope: {e}")))
    }
}

/// Inbound frame `type` strings.
pub mod inbound {
    pub const PING: &str = "ping";
    pub const JOIN_PROJECT: &str = "join_project";
    pub const LEAVE_PROJECT: &str = "leave_project";
    pub const USER_MESSAGE: &str = "user_message";
    pub const CREATE_CONVERSATION: &str = "create_conversation";
    pub const GET_CONVERSATIONS: &str = "get_conversations";
    pub const GET_CONVERSATION: &str = "get_conversation";
    pub const DELETE_CONVERSATION: &str = "delete_conversation";
    pub const GET_STREAMING_CONVERSATION: &str = "get_streaming_conversation";
}

/// Outbound frame `type` strings.
pub mod outbound {
    pub const PONG: &str = "pong";
    pub const PROJECT_JOINED: &str = "project_joined";
    pub const PROJECT_LEFT: &str = "project_left";
    pub const CONVERSATIONS_LIST: &str = "conversations_list";
    pub const CONVERSATION_CREATED: &str = "conversation_created";
    pub const CONVERSATION_DETAILS: &str = "conversation_details";
    pub const CONVERSATION_DELETED: &str = "conversation_deleted";
    pub const USER_MESSAGE_SENT: &str = "user_message_sent";
    pub const ASSISTANT_RESPONSE: &str = "assistant_response";
    pub const TOOL_EXECUTION_STARTED: &str = "tool_execution_started";
    pub const TOOL_EXECUTION_COMPLETED: &str = "tool_execution_completed";
    pub const TOOL_EXECUTION_FAILED: &str = "tool_execution_failed";
    pub const CHAT_INTERRUPTED: &str = "chat_interrupted";
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_modulo_key_order() {
        let env = Envelope::new(
            inbound::USER_MESSAGE,
            serde_json::json!({"conversation_id": "c1", "content": "hi"}),
            1000,
        )
        .with_id("req-1");
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded, 1024).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn rejects_oversized_frames() {
        let huge = "x".repeat(2048);
        let raw = format!(r#"{{"type":"ping","data":{{"pad":"{huge}"}},"timestamp":1}}"#);
        let err = Envelope::decode(&raw, 1024).unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn decodes_missing_optional_fields() {
        let raw = r#"{"type":"ping","timestamp":42}"#;
        let env = Envelope::decode(raw, 1024).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.data.is_null());
        assert!(env.id.is_none());
    }

    #[test]
    fn error_envelope_carries_stable_code() {
        let err = AppError::Conflict("stream already active".into());
        let env = Envelope::error(&err, 5);
        assert_eq!(env.kind, "error");
        assert_eq!(env.data["code"], "conflict");
    }
}
