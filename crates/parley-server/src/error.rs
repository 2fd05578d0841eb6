use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::{DraftError, ErrorCode, MessageId};

use crate::auth::AuthError;
use crate::gateway::GatewayError;

/// Outcome of a rejected inbound event. Reported to the originating
/// connection only; never fatal to the registry or channel state.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] AuthError),

    #[error("{0}")]
    Draft(#[from] DraftError),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] GatewayError),

    #[error("Friend request already exists")]
    DuplicateRequest,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl RouterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::InvalidCredential(_) => ErrorCode::InvalidCredential,
            RouterError::Draft(e) => e.code(),
            RouterError::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            RouterError::DuplicateRequest => ErrorCode::DuplicateRequest,
            RouterError::InvalidState(_) => ErrorCode::InvalidState,
            RouterError::MessageNotFound(_) => ErrorCode::NotFound,
            RouterError::BadRequest(_) => ErrorCode::BadRequest,
        }
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("File not found: {0}")]
    BlobNotFound(String),

    #[error("File too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Router(#[from] RouterError),
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::BlobNotFound(_) => ErrorCode::NotFound,
            ServerError::BlobTooLarge { .. } | ServerError::BadRequest(_) => ErrorCode::BadRequest,
            ServerError::Unauthorized => ErrorCode::InvalidCredential,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::Router(e) => e.code(),
            ServerError::BlobStorage(_) => ErrorCode::Internal,
        }
    }
}

impl From<AuthError> for ServerError {
    fn from(_: AuthError) -> Self {
        ServerError::Unauthorized
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            ServerError::BlobNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BlobTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::BlobStorage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Blob storage error".to_string())
            }
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Router(e) => (router_status(e), e.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn router_status(err: &RouterError) -> StatusCode {
    match err {
        RouterError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
        RouterError::Draft(_) | RouterError::BadRequest(_) => StatusCode::BAD_REQUEST,
        RouterError::PersistenceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::DuplicateRequest | RouterError::InvalidState(_) => StatusCode::CONFLICT,
        RouterError::MessageNotFound(_) => StatusCode::NOT_FOUND,
    }
}
