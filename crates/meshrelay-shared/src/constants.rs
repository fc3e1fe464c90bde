/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/meshrelay/1.0.0";

/// Application name
pub const APP_NAME: &str = "meshrelay";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Number of BLAKE3 output bytes used for a peer's short address
pub const SHORT_ADDRESS_BYTES: usize = 10;

/// Maximum serialized wire frame size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port (0 = ephemeral)
pub const DEFAULT_QUIC_PORT: u16 = 0;

/// Default HTTP port of the cloud relay server
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default mesh service identifiers, one session per radio network
pub const DEFAULT_NETWORKS: &[&str] = &["meshrelay-bt", "meshrelay-wifi"];

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Hop ceiling stamped on every envelope created by this node
pub const MAX_HOPS: u32 = 500;

/// Upper bound of the relay dedup cache
pub const SEEN_CACHE_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Budget for a single mesh send before falling back to cloud
pub const MESH_SEND_TIMEOUT_MS: u64 = 3_000;

/// Pending-mesh-retry sweep interval
pub const MESH_RETRY_INTERVAL_SECS: u64 = 30;

/// Maximum pending-mesh-retry entries; oldest are dropped beyond this
pub const MESH_RETRY_QUEUE_CAP: usize = 500;

/// Out-of-order decryption sweep interval
pub const DECRYPT_RETRY_INTERVAL_SECS: u64 = 30;

/// Maximum buffered undecryptable messages per sender
pub const PENDING_DECRYPT_PER_SENDER: usize = 50;

/// Cloud rendezvous poll interval
pub const CLOUD_POLL_INTERVAL_SECS: u64 = 10;

/// Messages kept in the active set before older ones are archived
pub const ACTIVE_MESSAGE_LIMIT: usize = 30;

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Delay between discovering a peer and inviting it
pub const INVITE_GRACE_MS: u64 = 500;

/// Lifetime of an in-flight invitation
pub const INVITE_TIMEOUT_SECS: u64 = 30;

/// Discovery is restarted once if nothing is found within this window
pub const DISCOVERY_STALL_SECS: u64 = 5;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SHARED_SECRET: &str = "meshrelay-shared-secret-v1";
pub const KDF_CONTEXT_SEALED_BOX: &str = "meshrelay-sealed-box-v1";
pub const KDF_CONTEXT_CHAIN_ROOT: &str = "meshrelay-chain-root-v1";
pub const KDF_CONTEXT_CHAIN_STEP: &str = "meshrelay-chain-step-v1";
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "meshrelay-message-key-v1";
pub const KDF_CONTEXT_ADDRESS: &str = "meshrelay-address-v1";
