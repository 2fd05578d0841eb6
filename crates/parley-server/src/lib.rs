//! # parley-server
//!
//! Real-time chat routing for Parley.
//!
//! This crate provides:
//! - **Presence**: one addressable connection per user, last login wins
//! - **Rooms**: per-connection group membership with in-order fan-out
//! - **Routing**: validate, persist, then deliver direct and group messages
//! - **Friend requests** with live notification of online parties
//! - **REST API** (axum) for attachments, history and message retraction,
//!   plus the WebSocket endpoint each client session runs on

pub mod api;
pub mod auth;
pub mod blob_store;
pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod friends;
pub mod gateway;
pub mod registry;
pub mod session;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
pub use error::{RouterError, ServerError};
