//! JSON wire protocol spoken over the WebSocket.
//!
//! Every frame is a text frame of the form `{"event": "<name>", "data": ...}`.
//! Event names are kebab-case, payload fields camelCase.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_BYTES;
use crate::error::{ErrorCode, ProtocolError};
use crate::types::{
    FriendEdge, Message, MessageDraft, MessageId, PresenceEntry, RoomId, UserId,
};

/// Events a client may send once its connection is authenticated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Direct message to one user
    SendDirect { recipient_id: UserId, text: String },

    /// Message to every connection joined to a room
    SendGroup { room_id: RoomId, text: String },

    /// Loosely addressed message; exactly one of the two ids must be set
    Message {
        text: String,
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default)]
        recipient_id: Option<UserId>,
    },

    Typing { recipient_id: UserId },

    StopTyping { recipient_id: UserId },

    Unsend { message_id: MessageId },

    Delete { message_id: MessageId },

    Join { room_id: RoomId },

    Leave { room_id: RoomId },

    SendFriendRequest { receiver_id: UserId },

    /// Accept the pending request that `sender_id` sent to this user
    AcceptFriendRequest { sender_id: UserId },

    ListPendingRequests,

    ListFriends,

    /// Present a fresh access token for the same identity
    Reauthenticate { token: String },
}

impl ClientEvent {
    /// Decode a text frame, rejecting oversized input before parsing.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Convert any of the message-sending events into a draft from `sender`.
    pub fn into_draft(self, sender: UserId) -> Option<MessageDraft> {
        match self {
            ClientEvent::SendDirect { recipient_id, text } => {
                Some(MessageDraft::direct(sender, recipient_id, text))
            }
            ClientEvent::SendGroup { room_id, text } => {
                Some(MessageDraft::group(sender, room_id, text))
            }
            ClientEvent::Message {
                text,
                room_id,
                recipient_id,
            } => Some(MessageDraft {
                sender_id: sender,
                text,
                room_id,
                recipient_id,
            }),
            _ => None,
        }
    }
}

/// Events the server pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// Full list of currently addressable users
    PresenceSnapshot(Vec<PresenceEntry>),

    Message(Message),

    /// Sent back to the author once the message is persisted
    Ack { message_id: MessageId, delivered: bool },

    Typing { sender_id: UserId },

    StopTyping { sender_id: UserId },

    UnsendNotice(Message),

    DeleteNotice(Message),

    FriendRequestSent(FriendEdge),

    FriendRequestAccepted(FriendEdge),

    PendingRequests(Vec<FriendEdge>),

    Friends(Vec<FriendEdge>),

    Error { code: ErrorCode, message: String },
}

impl OutboundEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OutboundEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::PresenceSnapshot(_) => "presence-snapshot",
            OutboundEvent::Message(_) => "message",
            OutboundEvent::Ack { .. } => "ack",
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::StopTyping { .. } => "stop-typing",
            OutboundEvent::UnsendNotice(_) => "unsend-notice",
            OutboundEvent::DeleteNotice(_) => "delete-notice",
            OutboundEvent::FriendRequestSent(_) => "friend-request-sent",
            OutboundEvent::FriendRequestAccepted(_) => "friend-request-accepted",
            OutboundEvent::PendingRequests(_) => "pending-requests",
            OutboundEvent::Friends(_) => "friends",
            OutboundEvent::Error { .. } => "error",
        }
    }
}
