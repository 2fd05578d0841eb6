//! # parley-shared
//!
//! Types shared by the Parley store and server: identifiers, persisted
//! records, the JSON wire protocol spoken over WebSocket, and error codes.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{DraftError, ErrorCode, ProtocolError};
pub use protocol::{ClientEvent, OutboundEvent};
pub use types::*;
