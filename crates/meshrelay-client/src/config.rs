//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node starts with zero configuration on
//! a local network.

use std::path::PathBuf;
use std::time::Duration;

use meshrelay_shared::constants::{
    ACTIVE_MESSAGE_LIMIT, CLOUD_POLL_INTERVAL_SECS, DECRYPT_RETRY_INTERVAL_SECS,
    DEFAULT_NETWORKS, DEFAULT_QUIC_PORT, MESH_RETRY_INTERVAL_SECS, MESH_RETRY_QUEUE_CAP,
    MESH_SEND_TIMEOUT_MS, PENDING_DECRYPT_PER_SENDER, SEEN_CACHE_CAPACITY,
};
use meshrelay_shared::types::NetworkId;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Mesh service identifiers, one discovery session each.
    /// Env: `MESHRELAY_NETWORKS` (comma-separated)
    /// Default: `meshrelay-bt,meshrelay-wifi`
    pub networks: Vec<NetworkId>,

    /// Directory holding the identity key file and the database.
    /// Env: `MESHRELAY_DATA_DIR`
    /// Default: platform data directory, `./meshrelay-data` if unknown.
    pub data_dir: PathBuf,

    /// Base URL of the cloud relay. Cloud fallback is off when unset.
    /// Env: `MESHRELAY_CLOUD_URL`
    pub cloud_url: Option<String>,

    /// Invite discovered peers and accept invitations automatically.
    /// Env: `MESHRELAY_AUTO_CONNECT` (true/false)
    /// Default: `true`
    pub auto_connect: bool,

    /// First QUIC port; network `i` listens on `port + i` (0 = ephemeral).
    /// Env: `MESHRELAY_LISTEN_PORT`
    pub listen_port: u16,

    /// Budget of one mesh send before falling back to cloud.
    /// Env: `MESHRELAY_MESH_TIMEOUT_MS`
    pub mesh_timeout: Duration,

    /// Messages kept in the active set.
    /// Env: `MESHRELAY_ACTIVE_LIMIT`
    pub active_limit: usize,

    /// Pending-mesh-retry queue bound.
    /// Env: `MESHRELAY_RETRY_QUEUE_CAP`
    pub retry_queue_cap: usize,

    pub seen_cache_capacity: usize,
    pub pending_decrypt_per_sender: usize,
    pub mesh_retry_interval: Duration,
    pub decrypt_retry_interval: Duration,
    pub cloud_poll_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            networks: DEFAULT_NETWORKS.iter().map(|n| NetworkId::new(*n)).collect(),
            data_dir: meshrelay_store::default_data_dir()
                .unwrap_or_else(|_| PathBuf::from("./meshrelay-data")),
            cloud_url: None,
            auto_connect: true,
            listen_port: DEFAULT_QUIC_PORT,
            mesh_timeout: Duration::from_millis(MESH_SEND_TIMEOUT_MS),
            active_limit: ACTIVE_MESSAGE_LIMIT,
            retry_queue_cap: MESH_RETRY_QUEUE_CAP,
            seen_cache_capacity: SEEN_CACHE_CAPACITY,
            pending_decrypt_per_sender: PENDING_DECRYPT_PER_SENDER,
            mesh_retry_interval: Duration::from_secs(MESH_RETRY_INTERVAL_SECS),
            decrypt_retry_interval: Duration::from_secs(DECRYPT_RETRY_INTERVAL_SECS),
            cloud_poll_interval: Duration::from_secs(CLOUD_POLL_INTERVAL_SECS),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("MESHRELAY_NETWORKS") {
            let networks = parse_networks(&raw);
            if networks.is_empty() {
                tracing::warn!(value = %raw, "Empty MESHRELAY_NETWORKS, using default");
            } else {
                config.networks = networks;
            }
        }

        if let Some(dir) = lookup("MESHRELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(url) = lookup("MESHRELAY_CLOUD_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() {
                config.cloud_url = Some(url);
            }
        }

        if let Some(val) = lookup("MESHRELAY_AUTO_CONNECT") {
            config.auto_connect = val != "false" && val != "0";
        }

        if let Some(val) = lookup("MESHRELAY_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid MESHRELAY_LISTEN_PORT, using default"),
            }
        }

        if let Some(val) = lookup("MESHRELAY_MESH_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.mesh_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid MESHRELAY_MESH_TIMEOUT_MS, using default"),
            }
        }

        if let Some(val) = lookup("MESHRELAY_ACTIVE_LIMIT") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.active_limit = n,
                _ => tracing::warn!(value = %val, "Invalid MESHRELAY_ACTIVE_LIMIT, using default"),
            }
        }

        if let Some(val) = lookup("MESHRELAY_RETRY_QUEUE_CAP") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.retry_queue_cap = n,
                _ => tracing::warn!(value = %val, "Invalid MESHRELAY_RETRY_QUEUE_CAP, using default"),
            }
        }

        config
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("meshrelay.db")
    }
}

fn parse_networks(raw: &str) -> Vec<NetworkId> {
    let mut networks: Vec<NetworkId> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let network = NetworkId::new(name);
        if !networks.contains(&network) {
            networks.push(network);
        }
    }
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> NodeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.mesh_timeout, Duration::from_secs(3));
        assert_eq!(config.active_limit, 30);
        assert_eq!(config.retry_queue_cap, 500);
        assert!(config.auto_connect);
        assert!(config.cloud_url.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("MESHRELAY_NETWORKS", "lora, wifi,lora"),
            ("MESHRELAY_CLOUD_URL", "http://relay.local:8080/"),
            ("MESHRELAY_AUTO_CONNECT", "false"),
            ("MESHRELAY_MESH_TIMEOUT_MS", "1500"),
            ("MESHRELAY_DATA_DIR", "/tmp/node-a"),
        ]);

        assert_eq!(config.networks, vec![NetworkId::new("lora"), NetworkId::new("wifi")]);
        assert_eq!(config.cloud_url.as_deref(), Some("http://relay.local:8080"));
        assert!(!config.auto_connect);
        assert_eq!(config.mesh_timeout, Duration::from_millis(1500));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/node-a/meshrelay.db"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("MESHRELAY_NETWORKS", " , "),
            ("MESHRELAY_LISTEN_PORT", "not-a-port"),
            ("MESHRELAY_ACTIVE_LIMIT", "0"),
            ("MESHRELAY_RETRY_QUEUE_CAP", "-4"),
        ]);

        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.listen_port, DEFAULT_QUIC_PORT);
        assert_eq!(config.active_limit, ACTIVE_MESSAGE_LIMIT);
        assert_eq!(config.retry_queue_cap, MESH_RETRY_QUEUE_CAP);
    }
}
