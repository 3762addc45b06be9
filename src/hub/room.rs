//! Project rooms: the fan-out boundary.
//!
//! A room is simply the set of connection ids currently joined to a
//! project id. Membership is exclusive: joining a new room implies
//! leaving any prior one for the same connection. A room with zero
//! members is dropped from the map.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::store::ProjectId;

use super::connection::ConnId;

#[derive(Default)]
pub struct Rooms {
    members: RwLock<HashMap<ProjectId, HashSet<ConnId>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, project_id: ProjectId, conn_id: ConnId) {
        let mut members = self.members.write().await;
        members.entry(project_id).or_default().insert(conn_id);
    }

    pub async fn leave(&self, project_id: ProjectId, conn_id: ConnId) {
        let mut members = self.members.write().await;
        if let Some(set) = members.get_mut(&project_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                members.remove(&project_id);
            }
        }
    }

    /// Remove `conn_id` from every room it belongs to (used on teardown,
    /// since a connection's prior project may not be known by the caller).
    pub async fn leave_all(&self, conn_id: ConnId) {
        let mut members = self.members.write().await;
        members.retain(|_, set| {
            set.remove(&conn_id);
            !set.is_empty()
        });
    }

    pub async fn members_of(&self, project_id: ProjectId) -> Vec<ConnId> {
        self.members
            .read()
            .await
            .get(&project_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.members.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn join_then_members_of_includes_connection() {
        let rooms = Rooms::new();
        let (p1, c1) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.join(p1, c1).await;
        assert_eq!(rooms.members_of(p1).await, vec![c1]);
    }

    #[tokio::test]
    async fn empty_room_is_removed() {
        let rooms = Rooms::new();
        let (p1, c1) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.join(p1, c1).await;
        rooms.leave(p1, c1).await;
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn leave_all_removes_from_every_room() {
        let rooms = Rooms::new();
        let (p1, p2, c1) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        rooms.join(p1, c1).await;
        rooms.join(p2, c1).await;
        rooms.leave_all(c1).await;
        assert_eq!(rooms.members_of(p1).await, Vec::<ConnId>::new());
        assert_eq!(rooms.members_of(p2).await, Vec::<ConnId>::new());
    }
}
