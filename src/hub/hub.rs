//! The connection registry, project rooms, and the three fan-out
//! primitives.
//!
//! Rust realization note: rather than a single
//! goroutine draining typed register/unregister/join/leave channels, the
//! hub guards its maps with `tokio::sync::RwLock` and performs mutations
//! as direct async methods — the lock acquisition *is* the serialization
//! point, matching the corpus's `GatewayState` (`RwLock<HashMap<...>>`)
//! idiom rather than a CSP-style actor loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::codec::Envelope;
use crate::store::ProjectId;

use super::connection::{ConnId, Connection};
use super::room::Rooms;

pub struct Hub {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    rooms: Rooms,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            rooms: Rooms::new(),
        })
    }

    /// Register a newly-handshaken connection.
    pub async fn register(&self, conn: Arc<Connection>) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(conn_id = %id, "connection registered");
    }

    /// Exactly-once unregister: removes the connection, drops its room
    /// memberships, and closes its outbound queue. Safe to call more than
    /// once — only the first call does anything.
    pub async fn unregister(&self, conn_id: ConnId) {
        let conn = { self.connections.write().await.remove(&conn_id) };
        let Some(conn) = conn else { return };
        if !conn.unregistered.swap(true, std::sync::atomic::Ordering::AcqRel) {
            self.rooms.leave_all(conn_id).await;
            conn.mark_closed();
            tracing::info!(conn_id = %conn_id, "connection unregistered");
        }
    }

    /// Join `conn_id` to `project_id`, leaving any prior room first
    /// (membership is mutually exclusive). Concurrent joins for the same
    /// connection serialize on the write lock; the later call wins.
    pub async fn join(&self, conn_id: ConnId, project_id: ProjectId) {
        let conn = { self.connections.read().await.get(&conn_id).cloned() };
        let Some(conn) = conn else { return };

        if let Some(prior) = conn.project().await {
            if prior != project_id {
                self.rooms.leave(prior, conn_id).await;
            }
        }
        self.rooms.join(project_id, conn_id).await;
        conn.set_project(Some(project_id)).await;
        tracing::debug!(conn_id = %conn_id, %project_id, "joined project room");
    }

    pub async fn leave(&self, conn_id: ConnId, project_id: ProjectId) {
        let conn = { self.connections.read().await.get(&conn_id).cloned() };
        self.rooms.leave(project_id, conn_id).await;
        if let Some(conn) = conn {
            if conn.project().await == Some(project_id) {
                conn.set_project(None).await;
            }
        }
        tracing::debug!(conn_id = %conn_id, %project_id, "left project room");
    }

    pub async fn get(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&conn_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Encode once, non-blocking try-send to a single connection. On
    /// failure, the recipient is evicted.
    pub async fn send_to_connection(&self, conn_id: ConnId, envelope: &Envelope) {
        let conn = { self.connections.read().await.get(&conn_id).cloned() };
        let Some(conn) = conn else { return };
        self.deliver_or_evict(conn, envelope).await;
    }

    /// Fan out to every connection joined to `project_id`. Relative order
    /// of frames from the same sender is preserved; interleaving across
    /// senders is undefined.
    pub async fn broadcast_to_project(&self, project_id: ProjectId, envelope: &Envelope) {
        let targets = self.rooms.members_of(project_id).await;
        for conn_id in targets {
            let conn = { self.connections.read().await.get(&conn_id).cloned() };
            if let Some(conn) = conn {
                self.deliver_or_evict(conn, envelope).await;
            }
        }
    }

    pub async fn broadcast_all(&self, envelope: &Envelope) {
        let targets: Vec<_> = { self.connections.read().await.values().cloned().collect() };
        for conn in targets {
            self.deliver_or_evict(conn, envelope).await;
        }
    }

    async fn deliver_or_evict(&self, conn: Arc<Connection>, envelope: &Envelope) {
        let bytes = match envelope.encode() {
            Ok(text) => text.into_bytes(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound envelope");
                return;
            }
        };
        if !conn.outbound.try_send(bytes) {
            tracing::warn!(conn_id = %conn.id, "outbound queue overflow, evicting connection");
            self.unregister(conn.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::Connection;
    use uuid::Uuid;

    fn test_envelope() -> Envelope {
        Envelope::new("ping", serde_json::json!({}), 0)
    }

    #[tokio::test]
    async fn register_unregister_is_exactly_once() {
        let hub = Hub::new();
        let (conn, _rx) = Connection::new("u1".into(), "t1".into(), 1000, 8);
        let id = conn.id;
        hub.register(conn).await;
        assert_eq!(hub.connection_count().await, 1);
        hub.unregister(id).await;
        hub.unregister(id).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn join_is_exclusive_across_rooms() {
        let hub = Hub::new();
        let (conn, _rx) = Connection::new("u1".into(), "t1".into(), 1000, 8);
        let id = conn.id;
        hub.register(conn).await;
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        hub.join(id, p1).await;
        hub.join(id, p2).await;
        assert_eq!(hub.rooms.members_of(p1).await, Vec::<ConnId>::new());
        assert_eq!(hub.rooms.members_of(p2).await, vec![id]);
    }

    #[tokio::test]
    async fn broadcast_to_project_reaches_only_members() {
        let hub = Hub::new();
        let (a, mut rx_a) = Connection::new("u1".into(), "t1".into(), 1000, 8);
        let (b, mut rx_b) = Connection::new("u2".into(), "t1".into(), 1000, 8);
        let (ida, idb) = (a.id, b.id);
        hub.register(a).await;
        hub.register(b).await;
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        hub.join(ida, p1).await;
        hub.join(idb, p2).await;

        hub.broadcast_to_project(p1, &test_envelope()).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_evicts_slow_consumer_without_blocking() {
        let hub = Hub::new();
        let (conn, _rx) = Connection::new("u1".into(), "t1".into(), 1000, 1);
        let id = conn.id;
        hub.register(conn).await;
        // Fill the single-slot queue, then force an overflow.
        hub.send_to_connection(id, &test_envelope()).await;
        hub.send_to_connection(id, &test_envelope()).await;
        assert_eq!(hub.connection_count().await, 0);
    }
}
