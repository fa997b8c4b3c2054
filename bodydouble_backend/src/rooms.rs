//! Per-user rooms of live WebSocket connections.
//!
//! A connection is represented by the sending half of its outbox; the socket
//! writer task owns the receiving half. A send that fails means the writer is
//! gone, so the connection is dropped from its room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

pub type ConnectionId = u64;

#[derive(Default)]
pub struct ConnectionRooms {
    rooms: Mutex<HashMap<String, HashMap<ConnectionId, flume::Sender<String>>>>,
    next_id: AtomicU64,
}

impl ConnectionRooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<ConnectionId, flume::Sender<String>>>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an accepted connection under `user_id`.
    pub fn join(&self, user_id: &str, outbox: flume::Sender<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(id, outbox);
        tracing::debug!("Connection {} joined room '{}'", id, user_id);
        id
    }

    pub fn leave(&self, user_id: &str, id: ConnectionId) {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get_mut(user_id) {
            if room.remove(&id).is_some() {
                tracing::debug!("Connection {} left room '{}'", id, user_id);
            }
            if room.is_empty() {
                rooms.remove(user_id);
            }
        }
    }

    /// Send `message` to every connection of `user_id`. Returns how many
    /// connections accepted it.
    pub fn broadcast<T: Serialize>(&self, user_id: &str, message: &T) -> usize {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize room message for '{}': {}", user_id, e);
                return 0;
            }
        };

        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(user_id) else {
            return 0;
        };
        let before = room.len();
        room.retain(|id, outbox| {
            let alive = outbox.send(payload.clone()).is_ok();
            if !alive {
                tracing::debug!("Dropping dead connection {} from room '{}'", id, user_id);
            }
            alive
        });
        let delivered = room.len();
        if room.is_empty() {
            rooms.remove(user_id);
        }
        if delivered < before {
            tracing::debug!(
                "Room '{}' delivered to {}/{} connection(s)",
                user_id,
                delivered,
                before
            );
        }
        delivered
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map(HashMap::len).unwrap_or(0)
    }
}
