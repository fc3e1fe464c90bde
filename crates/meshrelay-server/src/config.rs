//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path where uploaded ciphertext is stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum blob size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    /// Default: 50 MiB
    pub max_blob_size: usize,

    /// Handles kept per rendezvous mailbox before the oldest are dropped.
    /// Env: `MAILBOX_CAP`
    /// Default: `256`
    pub mailbox_cap: usize,

    /// Requests one client IP may make per rate-limit window.
    /// Env: `RATE_LIMIT_REQUESTS`
    /// Default: `300`
    pub rate_limit_requests: usize,

    /// Length of the sliding rate-limit window.
    /// Env: `RATE_LIMIT_WINDOW_SECS`
    /// Default: `30`
    pub rate_limit_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            blob_storage_path: PathBuf::from("./blobs"),
            max_blob_size: 50 * 1024 * 1024,
            mailbox_cap: 256,
            rate_limit_requests: 300,
            rate_limit_window: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(size) = parse_positive(&lookup, "MAX_BLOB_SIZE") {
            config.max_blob_size = size;
        }

        if let Some(cap) = parse_positive(&lookup, "MAILBOX_CAP") {
            config.mailbox_cap = cap;
        }

        if let Some(requests) = parse_positive(&lookup, "RATE_LIMIT_REQUESTS") {
            config.rate_limit_requests = requests;
        }

        if let Some(secs) = parse_positive(&lookup, "RATE_LIMIT_WINDOW_SECS") {
            config.rate_limit_window = Duration::from_secs(secs as u64);
        }

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
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
        assert_eq!(config.mailbox_cap, 256);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("BLOB_STORAGE_PATH", "/tmp/relay"),
            ("MAX_BLOB_SIZE", "1024"),
            ("MAILBOX_CAP", "8"),
            ("RATE_LIMIT_REQUESTS", "20"),
            ("RATE_LIMIT_WINDOW_SECS", "5"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.blob_storage_path, PathBuf::from("/tmp/relay"));
        assert_eq!(config.max_blob_size, 1024);
        assert_eq!(config.mailbox_cap, 8);
        assert_eq!(config.rate_limit_requests, 20);
        assert_eq!(config.rate_limit_window, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("MAX_BLOB_SIZE", "huge"),
            ("MAILBOX_CAP", "0"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.max_blob_size, defaults.max_blob_size);
        assert_eq!(config.mailbox_cap, defaults.mailbox_cap);
    }
}
