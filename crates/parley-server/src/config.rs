//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_PING_INTERVAL_SECS, MAX_BLOB_SIZE};

/// Secret used when `JWT_ACCESS_SECRET` is unset. Development only.
const DEV_JWT_SECRET: &str = "parley-dev-secret-change-me";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Filesystem path where uploaded attachments are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./uploads`
    pub blob_storage_path: PathBuf,

    /// Base URL prepended to attachment keys in message bodies.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub public_base_url: String,

    /// HS256 secret shared with the auth service that issues access tokens.
    /// Env: `JWT_ACCESS_SECRET`
    /// Default: a fixed development secret (logged as a warning).
    pub jwt_secret: String,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    pub max_blob_size: usize,

    /// Allowed CORS origin. `None` allows any origin.
    /// Env: `CORS_ORIGIN`
    pub cors_origin: Option<String>,

    /// WebSocket ping interval. A connection silent for three intervals is
    /// dropped.
    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,
}

// The secret stays out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("blob_storage_path", &self.blob_storage_path)
            .field("public_base_url", &self.public_base_url)
            .field("jwt_secret", &"<redacted>")
            .field("max_blob_size", &self.max_blob_size)
            .field("cors_origin", &self.cors_origin)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            blob_storage_path: PathBuf::from("./uploads"),
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            max_blob_size: MAX_BLOB_SIZE,
            cors_origin: None,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = get("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(url) = get("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        match get("JWT_ACCESS_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => tracing::warn!("JWT_ACCESS_SECRET not set, using development secret"),
        }

        if let Some(val) = get("MAX_BLOB_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_blob_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_BLOB_SIZE, using default"),
            }
        }

        if let Some(origin) = get("CORS_ORIGIN") {
            if !origin.is_empty() {
                config.cors_origin = Some(origin);
            }
        }

        if let Some(val) = get("PING_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.ping_interval = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid PING_INTERVAL_SECS, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// How long a connection may stay silent before it is dropped.
    pub fn idle_timeout(&self) -> Duration {
        self.ping_interval * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.max_blob_size, MAX_BLOB_SIZE);
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("PUBLIC_BASE_URL", "https://chat.example.com/"),
            ("JWT_ACCESS_SECRET", "s3cret"),
            ("CORS_ORIGIN", "http://localhost:3001"),
            ("PING_INTERVAL_SECS", "5"),
        ]));

        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.public_base_url, "https://chat.example.com");
        assert_eq!(config.jwt_secret, "s3cret");
        assert_eq!(config.cors_origin.as_deref(), Some("http://localhost:3001"));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("MAX_BLOB_SIZE", "0"),
            ("PING_INTERVAL_SECS", "soon"),
        ]));

        let default = ServerConfig::default();
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.max_blob_size, default.max_blob_size);
        assert_eq!(config.ping_interval, default.ping_interval);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = ServerConfig::from_lookup(lookup(&[("JWT_ACCESS_SECRET", "hunter2")]));
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
