use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::WsMessage;

pub type WsSender = mpsc::UnboundedSender<WsMessage>;

/// Server-generated id of one live socket. A user may hold several.
pub type ConnectionId = Uuid;

struct Connection {
    user_id: Uuid,
    tx: WsSender,
    rooms: HashSet<Uuid>,
}

/// Registry of live connections and the rooms they joined.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, Connection>>,
    rooms: Arc<DashMap<Uuid, HashSet<ConnectionId>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, user_id: Uuid, tx: WsSender) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.connections.insert(
            connection_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );

        tracing::info!(%user_id, %connection_id, "connection registered");
        connection_id
    }

    /// Drops the connection and takes it out of every room it joined.
    pub fn remove_connection(&self, connection_id: ConnectionId) {
        let Some((_, connection)) = self.connections.remove(&connection_id) else {
            return;
        };

        for room_id in &connection.rooms {
            if let Some(mut members) = self.rooms.get_mut(room_id) {
                members.remove(&connection_id);
            }
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }

        tracing::info!(
            user_id = %connection.user_id,
            %connection_id,
            rooms = connection.rooms.len(),
            "connection removed"
        );
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<Uuid> {
        self.connections.get(&connection_id).map(|c| c.user_id)
    }

    /// Returns `false` if the connection was already in the room or is gone.
    pub fn join_room(&self, connection_id: ConnectionId, room_id: Uuid) -> bool {
        // Holding the entry keeps a concurrent remove_connection from missing this room.
        let Some(mut connection) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        if !connection.rooms.insert(room_id) {
            return false;
        }
        self.rooms.entry(room_id).or_default().insert(connection_id);

        true
    }

    /// Best-effort fan-out to every member of `room_id` except `exclude`.
    /// Returns how many connections accepted the message.
    pub fn broadcast_to_room(
        &self,
        room_id: Uuid,
        message: &WsMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.get(&room_id) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        members
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| self.send_to_connection(*id, message.clone()))
            .count()
    }

    pub fn send_to_connection(&self, connection_id: ConnectionId, message: WsMessage) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn room_size(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
