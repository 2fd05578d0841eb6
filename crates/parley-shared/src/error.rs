use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried by `error` events and HTTP error bodies.
///
/// `RecipientOffline` is deliberately absent: an offline recipient is a
/// normal outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredential,
    MalformedAddressing,
    PersistenceFailure,
    DuplicateRequest,
    InvalidState,
    NotFound,
    BadRequest,
    Forbidden,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredential => "INVALID_CREDENTIAL",
            ErrorCode::MalformedAddressing => "MALFORMED_ADDRESSING",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorCode::DuplicateRequest => "DUPLICATE_REQUEST",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding or encoding wire frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Reasons a [`crate::MessageDraft`] cannot become a routable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DraftError {
    #[error("Message must address exactly one of roomId or recipientId")]
    MalformedAddressing,

    #[error("Message text is empty")]
    EmptyText,

    #[error("Message text too long: {len} characters (max {max})")]
    TextTooLong { len: usize, max: usize },
}

impl DraftError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DraftError::MalformedAddressing => ErrorCode::MalformedAddressing,
            DraftError::EmptyText | DraftError::TextTooLong { .. } => ErrorCode::BadRequest,
        }
    }
}
