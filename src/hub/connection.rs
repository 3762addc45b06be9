//! A single socket's connection state: identity, outbound queue, token
//! accounting, liveness flags.
//!
//! The outbound queue is transport-agnostic — it hands bytes to whatever
//! writer task is driving the real socket (axum's `WebSocket` in
//! `server/ws_route.rs`, or a plain `mpsc::Receiver` in tests). This keeps
//! [`Hub`](super::hub::Hub) and [`crate::streaming`] fully testable
//! without a live socket: an `mpsc::UnboundedSender<Vec<u8>>` held by the
//! connection, with the write loop owning the receiver.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::store::{ConversationId, ProjectId, TenantId, UserId};

pub type ConnId = Uuid;

/// Bounded outbound byte queue. The *only* synchronisation primitive
/// guarding closure is the monotonic `closed` flag, flipped exactly once
/// via compare-and-set.
pub struct OutboundQueue {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    closed: AtomicBool,
}

impl OutboundQueue {
    /// Build a queue of the given capacity, returning the handle paired
    /// with the receiving end the writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Non-blocking send; overflow or a closed queue both return `false`
    /// without ever blocking the caller.
    pub fn try_send(&self, bytes: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(bytes).is_ok(),
            None => false,
        }
    }

    /// Idempotent close: returns `true` only for the call that actually
    /// performed the transition.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tx.lock().take();
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One connected socket.
pub struct Connection {
    pub id: ConnId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    /// Mutated only by this connection's own reader task.
    pub project_id: RwLock<Option<ProjectId>>,
    pub outbound: OutboundQueue,
    pub token_usage: AtomicU64,
    pub token_ceiling: AtomicU64,
    pub closed: AtomicBool,
    pub unregistered: AtomicBool,
    /// Conversations this connection has an in-flight turn on, so the
    /// orchestrator can interrupt them when the socket drops.
    active_conversations: Mutex<HashSet<ConversationId>>,
}

impl Connection {
    pub fn new(
        user_id: UserId,
        tenant_id: TenantId,
        token_ceiling: u64,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = OutboundQueue::new(outbound_capacity);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            project_id: RwLock::new(None),
            outbound,
            token_usage: AtomicU64::new(0),
            token_ceiling: AtomicU64::new(token_ceiling),
            closed: AtomicBool::new(false),
            unregistered: AtomicBool::new(false),
            active_conversations: Mutex::new(HashSet::new()),
        });
        (conn, rx)
    }

    pub fn track_conversation(&self, conversation_id: ConversationId) {
        self.active_conversations.lock().insert(conversation_id);
    }

    pub fn untrack_conversation(&self, conversation_id: ConversationId) {
        self.active_conversations.lock().remove(&conversation_id);
    }

    /// Conversations this connection currently has an in-flight turn on.
    pub fn tracked_conversations(&self) -> Vec<ConversationId> {
        self.active_conversations.lock().iter().copied().collect()
    }

    pub async fn project(&self) -> Option<ProjectId> {
        *self.project_id.read().await
    }

    pub async fn set_project(&self, project_id: Option<ProjectId>) {
        *self.project_id.write().await = project_id;
    }

    /// Idempotent: closes the outbound queue and flips `closed`. Returns
    /// `true` only the first time.
    pub fn mark_closed(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.outbound.close();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    /// Add to the token-usage counter; returns the new total.
    pub fn record_tokens(&self, tokens: u64) -> u64 {
        self.token_usage.fetch_add(tokens, Ordering::Relaxed) + tokens
    }

    pub fn tokens_used(&self) -> u64 {
        self.token_usage.load(Ordering::Relaxed)
    }

    pub fn ceiling(&self) -> u64 {
        self.token_ceiling.load(Ordering::Relaxed)
    }

    pub fn set_ceiling(&self, ceiling: u64) {
        self.token_ceiling.store(ceiling, Ordering::Relaxed);
    }

    pub fn reset_tokens(&self) {
        self.token_usage.store(0, Ordering::Relaxed);
    }

    pub fn over_ceiling(&self) -> bool {
        self.tokens_used() >= self.ceiling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_queue_close_is_idempotent() {
        let (queue, _rx) = OutboundQueue::new(4);
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
    }

    #[test]
    fn try_send_fails_on_closed_queue() {
        let (queue, _rx) = OutboundQueue::new(4);
        queue.close();
        assert!(!queue.try_send(vec![1, 2, 3]));
    }

    #[test]
    fn try_send_fails_on_full_queue_without_blocking() {
        let (queue, _rx) = OutboundQueue::new(1);
        assert!(queue.try_send(vec![1]));
        assert!(!queue.try_send(vec![2]));
    }

    #[test]
    fn token_ceiling_tracks_usage() {
        let (conn, _rx) = Connection::new("u1".into(), "t1".into(), 100, 8);
        assert!(!conn.over_ceiling());
        conn.record_tokens(100);
        assert!(conn.over_ceiling());
        conn.reset_tokens();
        assert!(!conn.over_ceiling());
    }
}
