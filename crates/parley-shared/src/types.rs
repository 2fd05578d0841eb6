use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_TEXT_LEN;
use crate::error::DraftError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Stable user identity, as carried in the `id` claim of an access token.
    UserId
);
uuid_id!(
    /// A room (group conversation).
    RoomId
);
uuid_id!(
    /// A persisted message. Always generated by the store.
    MessageId
);
uuid_id!(
    /// One live connection. A fresh id is minted for every accepted socket.
    ConnectionId
);
uuid_id!(FriendEdgeId);

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Where a message goes: a room broadcast or a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Room(RoomId),
    User(UserId),
}

impl Target {
    /// Build a target from the two optional addressing fields.
    ///
    /// Exactly one must be present.
    pub fn from_parts(
        room_id: Option<RoomId>,
        recipient_id: Option<UserId>,
    ) -> Result<Self, DraftError> {
        match (room_id, recipient_id) {
            (Some(room), None) => Ok(Target::Room(room)),
            (None, Some(user)) => Ok(Target::User(user)),
            _ => Err(DraftError::MalformedAddressing),
        }
    }
}

/// An unvalidated outgoing message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender_id: UserId,
    pub text: String,
    pub room_id: Option<RoomId>,
    pub recipient_id: Option<UserId>,
}

impl MessageDraft {
    pub fn direct(sender_id: UserId, recipient_id: UserId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            text: text.into(),
            room_id: None,
            recipient_id: Some(recipient_id),
        }
    }

    pub fn group(sender_id: UserId, room_id: RoomId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            text: text.into(),
            room_id: Some(room_id),
            recipient_id: None,
        }
    }

    /// Check addressing first, then the body.
    pub fn validate(self) -> Result<MessageEvent, DraftError> {
        let target = Target::from_parts(self.room_id, self.recipient_id)?;

        if self.text.trim().is_empty() {
            return Err(DraftError::EmptyText);
        }
        let len = self.text.chars().count();
        if len > MAX_TEXT_LEN {
            return Err(DraftError::TextTooLong {
                len,
                max: MAX_TEXT_LEN,
            });
        }

        Ok(MessageEvent {
            sender_id: self.sender_id,
            text: self.text,
            target,
        })
    }
}

/// A validated message, ready to be persisted. Not itself durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub sender_id: UserId,
    pub text: String,
    pub target: Target,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A stored message. `id` and `created_at` come from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    pub room_id: Option<RoomId>,
    pub recipient_id: Option<UserId>,
    pub is_unsend: bool,
    pub is_deleted: bool,
    pub is_seen: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The addressing this message was created with.
    ///
    /// Returns `None` only for a record that violates the storage invariant.
    pub fn target(&self) -> Option<Target> {
        Target::from_parts(self.room_id, self.recipient_id).ok()
    }
}

/// Soft-delete markers applied to an existing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageFlag {
    Unsend,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    Pending,
    Accepted,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendStatus::Pending => "pending",
            FriendStatus::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FriendStatus::Pending),
            "accepted" => Some(FriendStatus::Accepted),
            _ => None,
        }
    }
}

/// A friend relationship, directed from the requester to the receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendEdge {
    pub id: FriendEdgeId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: FriendStatus,
    pub created_at: DateTime<Utc>,
}

impl FriendEdge {
    pub fn involves(&self, user: UserId) -> bool {
        self.sender_id == user || self.receiver_id == user
    }
}

/// One row of the presence snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}
