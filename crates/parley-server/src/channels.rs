//! Room membership and group fan-out.
//!
//! Rooms exist only while they have members: the first join creates one and
//! the last leave removes it. Membership is per connection, not per user, so
//! a user's displaced login keeps receiving the rooms it joined until it
//! disconnects.
//!
//! The outer lock guards only the room map and is never held while waiting
//! on a room. Membership changes and fan-out run under that room's own mutex,
//! so traffic in one room never waits on another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use parley_shared::{ConnectionId, OutboundEvent, RoomId};

use crate::registry::ConnectionHandle;

#[derive(Default)]
struct Room {
    /// Join order; broadcasts go out in this order.
    members: Vec<ConnectionHandle>,
    /// Set by the leave that emptied the room, before it is unmapped. A join
    /// that finds a closed room retries against the map.
    closed: bool,
}

impl Room {
    fn contains(&self, conn: ConnectionId) -> bool {
        self.members.iter().any(|m| m.id() == conn)
    }
}

/// Tracks which connections are in which rooms.
#[derive(Default)]
pub struct ChannelManager {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    /// Reverse index used to tear down all memberships of a connection.
    joined: Mutex<HashMap<ConnectionId, HashSet<RoomId>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Returns `false` if the connection was already a member.
    pub async fn join(&self, handle: &ConnectionHandle, room_id: RoomId) -> bool {
        let conn = handle.id();

        let members = loop {
            let room = self.room_or_create(room_id).await;
            let mut room = room.lock().await;
            if room.closed {
                drop(room);
                tokio::task::yield_now().await;
                continue;
            }
            if room.contains(conn) {
                return false;
            }
            room.members.push(handle.clone());
            break room.members.len();
        };

        self.joined.lock().await.entry(conn).or_default().insert(room_id);

        info!(room = %room_id, connection = %conn, members, "Connection joined room");
        true
    }

    /// Remove a connection from a room. Leaving a room you are not in is a
    /// no-op and returns `false`.
    pub async fn leave(&self, conn: ConnectionId, room_id: RoomId) -> bool {
        let removed = self.remove_member(conn, room_id).await;

        {
            let mut joined = self.joined.lock().await;
            if let Some(rooms) = joined.get_mut(&conn) {
                rooms.remove(&room_id);
                if rooms.is_empty() {
                    joined.remove(&conn);
                }
            }
        }

        if removed {
            info!(room = %room_id, connection = %conn, "Connection left room");
        }
        removed
    }

    /// Drop every membership held by `conn`. Returns how many rooms it left.
    pub async fn disconnect(&self, conn: ConnectionId) -> usize {
        let Some(rooms) = self.joined.lock().await.remove(&conn) else {
            return 0;
        };

        let mut left = 0;
        for room_id in rooms {
            if self.remove_member(conn, room_id).await {
                left += 1;
            }
        }

        debug!(connection = %conn, rooms = left, "Connection removed from all rooms");
        left
    }

    /// Deliver `event` to every current member of `room_id`, the sender
    /// included.
    ///
    /// Fan-out runs under the room's mutex, so a concurrent join or leave
    /// is either fully before or fully after this broadcast. Returns how many
    /// members the event was queued for.
    pub async fn broadcast(&self, room_id: RoomId, event: &OutboundEvent) -> usize {
        let Some(room) = self.room(room_id).await else {
            debug!(room = %room_id, "Broadcast to empty room");
            return 0;
        };
        let room = room.lock().await;

        let mut delivered = 0;
        for member in &room.members {
            if member.send(event.clone()) {
                delivered += 1;
            } else {
                debug!(room = %room_id, connection = %member.id(), "Member writer gone, skipping");
            }
        }
        delivered
    }

    /// Current members of a room in join order.
    pub async fn members(&self, room_id: RoomId) -> Vec<ConnectionId> {
        match self.room(room_id).await {
            Some(room) => room.lock().await.members.iter().map(ConnectionHandle::id).collect(),
            None => Vec::new(),
        }
    }

    pub async fn is_member(&self, conn: ConnectionId, room_id: RoomId) -> bool {
        match self.room(room_id).await {
            Some(room) => room.lock().await.contains(conn),
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn room(&self, room_id: RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    async fn room_or_create(&self, room_id: RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.room(room_id).await {
            return room;
        }
        self.rooms
            .write()
            .await
            .entry(room_id)
            .or_default()
            .clone()
    }

    async fn remove_member(&self, conn: ConnectionId, room_id: RoomId) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };

        let mut guard = room.lock().await;
        let before = guard.members.len();
        guard.members.retain(|m| m.id() != conn);
        let removed = guard.members.len() != before;
        let emptied = removed && guard.members.is_empty();
        if emptied {
            guard.closed = true;
        }
        drop(guard);

        if emptied {
            let mut rooms = self.rooms.write().await;
            if rooms.get(&room_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                rooms.remove(&room_id);
                debug!(room = %room_id, "Room emptied and removed");
            }
        }
        removed
    }
}
