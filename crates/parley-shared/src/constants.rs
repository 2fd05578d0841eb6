/// Application name
pub const APP_NAME: &str = "Parley";

/// Wire protocol version reported by `/health`
pub const PROTOCOL_VERSION: &str = "parley/1";

/// Maximum length of a message body in characters
pub const MAX_TEXT_LEN: usize = 250;

/// Maximum inbound WebSocket frame size in bytes (64 KiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Maximum attachment size in bytes (10 MiB)
pub const MAX_BLOB_SIZE: usize = 10 * 1024 * 1024;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default WebSocket ping interval in seconds
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
