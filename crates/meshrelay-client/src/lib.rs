//! # meshrelay-client
//!
//! Delivery engine of a meshrelay node: flood relay over the local mesh,
//! cloud store-and-forward fallback, retry queues and the message ledger.

pub mod cipher;
pub mod cloud;
pub mod config;
pub mod decrypt_queue;
pub mod events;
pub mod guard;
pub mod inbound;
pub mod mesh_retry;
pub mod message_store;
pub mod node;
pub mod orchestrator;
pub mod relay;
pub mod seen_cache;

pub use cloud::{CloudRelay, HttpCloudRelay};
pub use config::NodeConfig;
pub use events::NodeEvent;
pub use inbound::{Acceptance, InboundOutcome};
pub use message_store::Conversation;
pub use node::{Collaborators, MeshRelayNode};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("meshrelay_client=debug,meshrelay_net=debug,meshrelay_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
