//! The persistence boundary used by the router.
//!
//! Routing code only ever talks to [`PersistenceGateway`]. The production
//! implementation, [`SqliteGateway`], owns a `parley_store::Database` behind a
//! mutex and runs every call on the blocking pool, so a write already handed
//! to the store finishes even if the requesting connection goes away.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use parley_shared::{
    FriendEdge, FriendEdgeId, FriendStatus, Message, MessageEvent, MessageFlag, MessageId, RoomId,
    UserId,
};
use parley_store::{Database, StoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GatewayError::NotFound,
            StoreError::Conflict(msg) => GatewayError::Conflict(msg),
            other => GatewayError::Store(other.to_string()),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Durable storage of messages and friend edges.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store a validated message and return it with id and timestamp.
    async fn create_message(&self, event: &MessageEvent) -> GatewayResult<Message>;

    async fn find_message(&self, id: MessageId) -> GatewayResult<Option<Message>>;

    async fn set_message_flag(&self, id: MessageId, flag: MessageFlag) -> GatewayResult<Message>;

    /// Direct history between two users in both directions, oldest first.
    async fn find_messages_between(&self, a: UserId, b: UserId) -> GatewayResult<Vec<Message>>;

    async fn find_messages_in_room(&self, room: RoomId) -> GatewayResult<Vec<Message>>;

    async fn find_friend_edge(&self, a: UserId, b: UserId) -> GatewayResult<Option<FriendEdge>>;

    async fn create_friend_edge(&self, sender: UserId, receiver: UserId)
        -> GatewayResult<FriendEdge>;

    async fn transition_friend_edge(
        &self,
        id: FriendEdgeId,
        to: FriendStatus,
    ) -> GatewayResult<FriendEdge>;

    async fn pending_requests_for(&self, receiver: UserId) -> GatewayResult<Vec<FriendEdge>>;

    async fn friends_of(&self, user: UserId) -> GatewayResult<Vec<FriendEdge>>;
}

/// [`PersistenceGateway`] over a local SQLite file.
#[derive(Clone)]
pub struct SqliteGateway {
    db: Arc<Mutex<Database>>,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> GatewayResult<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn in_memory() -> GatewayResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_db<T, F>(&self, f: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| GatewayError::Unavailable("database lock poisoned".to_string()))?;
            f(&guard).map_err(GatewayError::from)
        })
        .await
        .map_err(|e| GatewayError::Unavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn create_message(&self, event: &MessageEvent) -> GatewayResult<Message> {
        let event = event.clone();
        self.with_db(move |db| db.insert_message(&event)).await
    }

    async fn find_message(&self, id: MessageId) -> GatewayResult<Option<Message>> {
        match self.with_db(move |db| db.get_message(id)).await {
            Ok(message) => Ok(Some(message)),
            Err(GatewayError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_message_flag(&self, id: MessageId, flag: MessageFlag) -> GatewayResult<Message> {
        self.with_db(move |db| db.set_message_flag(id, flag)).await
    }

    async fn find_messages_between(&self, a: UserId, b: UserId) -> GatewayResult<Vec<Message>> {
        self.with_db(move |db| db.messages_between(a, b)).await
    }

    async fn find_messages_in_room(&self, room: RoomId) -> GatewayResult<Vec<Message>> {
        self.with_db(move |db| db.messages_in_room(room)).await
    }

    async fn find_friend_edge(&self, a: UserId, b: UserId) -> GatewayResult<Option<FriendEdge>> {
        self.with_db(move |db| db.find_friend_edge(a, b)).await
    }

    async fn create_friend_edge(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> GatewayResult<FriendEdge> {
        self.with_db(move |db| db.insert_friend_request(sender, receiver))
            .await
    }

    async fn transition_friend_edge(
        &self,
        id: FriendEdgeId,
        to: FriendStatus,
    ) -> GatewayResult<FriendEdge> {
        self.with_db(move |db| db.transition_friend_edge(id, to)).await
    }

    async fn pending_requests_for(&self, receiver: UserId) -> GatewayResult<Vec<FriendEdge>> {
        self.with_db(move |db| db.pending_requests_for(receiver)).await
    }

    async fn friends_of(&self, user: UserId) -> GatewayResult<Vec<FriendEdge>> {
        self.with_db(move |db| db.friends_of(user)).await
    }
}
