//! # parley-store
//!
//! Durable storage for Parley, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages and friend
//! edges. Callers on an async runtime are expected to run these on a
//! blocking thread.

pub mod database;
pub mod friends;
pub mod messages;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
