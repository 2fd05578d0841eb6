//! Presence: which user owns which live connection.
//!
//! The registry keeps exactly one addressable [`ConnectionHandle`] per user.
//! A second connection from the same user replaces the first in the table
//! (last connection wins); the displaced connection stays open but can no
//! longer be reached by user id.
//!
//! All operations take the same mutex and release it before any delivery,
//! so register, unregister and lookup are atomic with respect to each other
//! and the lock is never held across I/O.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use parley_shared::{ConnectionId, OutboundEvent, PresenceEntry, UserId};

/// Sending half of one live connection.
///
/// Equality is by connection id, so a clone held by a room compares equal to
/// the one held by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id. The receiver feeds the
    /// connection's socket writer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event for this connection. Returns `false` if the
    /// connection's writer is gone.
    pub fn send(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// The presence table: `UserId -> ConnectionHandle`.
#[derive(Default)]
pub struct ConnectionRegistry {
    table: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the mapping for `user`.
    ///
    /// Returns the handle that was displaced, if any. The displaced
    /// connection is not closed.
    pub async fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn = handle.id();
        let previous = {
            let mut table = self.table.lock().await;
            table.insert(user, handle)
        };

        match &previous {
            Some(old) if old.id() != conn => info!(
                user = %user,
                old_connection = %old.id(),
                new_connection = %conn,
                "Connection replaced by newer login"
            ),
            _ => debug!(user = %user, connection = %conn, "Connection registered"),
        }

        previous
    }

    /// Remove the entry whose handle is `conn`.
    ///
    /// A connection that never registered, was displaced by a newer one, or
    /// was already removed is a no-op. Returns the user that went offline.
    pub async fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
        let removed = {
            let mut table = self.table.lock().await;
            let user = table
                .iter()
                .find(|(_, handle)| handle.id() == conn)
                .map(|(user, _)| *user);
            if let Some(user) = user {
                table.remove(&user);
            }
            user
        };

        if let Some(user) = removed {
            debug!(user = %user, connection = %conn, "Connection unregistered");
        }

        removed
    }

    /// Current handle for `user`. `None` means offline, which is a normal
    /// outcome.
    pub async fn lookup(&self, user: UserId) -> Option<ConnectionHandle> {
        self.table.lock().await.get(&user).cloned()
    }

    /// Deliver to `user` if online. Returns whether the event was queued.
    pub async fn send_to(&self, user: UserId, event: OutboundEvent) -> bool {
        match self.lookup(user).await {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }

    /// Every registered `(user, connection)` pair, ordered by user id.
    pub async fn snapshot(&self) -> Vec<PresenceEntry> {
        let table = self.table.lock().await;
        let mut entries: Vec<_> = table
            .iter()
            .map(|(user, handle)| PresenceEntry {
                user_id: *user,
                connection_id: handle.id(),
            })
            .collect();
        entries.sort_by_key(|e| e.user_id);
        entries
    }

    /// Push the full presence snapshot to every registered connection.
    ///
    /// Returns the number of connections reached.
    pub async fn announce_presence(&self) -> usize {
        let (entries, handles) = {
            let table = self.table.lock().await;
            let mut entries: Vec<_> = table
                .iter()
                .map(|(user, handle)| PresenceEntry {
                    user_id: *user,
                    connection_id: handle.id(),
                })
                .collect();
            entries.sort_by_key(|e| e.user_id);
            let handles: Vec<_> = table.values().cloned().collect();
            (entries, handles)
        };

        let reached = handles
            .iter()
            .filter(|h| h.send(OutboundEvent::PresenceSnapshot(entries.clone())))
            .count();

        debug!(online = entries.len(), reached, "Presence announced");
        reached
    }
}
