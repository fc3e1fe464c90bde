//! meshrelay-node: runs one node and sends stdin lines as messages.
//!
//! Input format, one message per line: `<recipient-peer-key-hex> <text>`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use meshrelay_client::{init_tracing, Collaborators, CloudRelay, HttpCloudRelay, MeshRelayNode, NodeConfig, NodeEvent};
use meshrelay_net::spawn_mesh;
use meshrelay_shared::ratchet::ChainRatchetProvider;
use meshrelay_shared::types::PeerKey;
use meshrelay_shared::Identity;
use meshrelay_store::Database;

const CLOUD_REQUEST_TIMEOUT_SECS: u64 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting meshrelay node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    let identity = Identity::load_or_create(&config.identity_path())
        .with_context(|| format!("loading identity from {}", config.identity_path().display()))?;
    let database = Database::open_at(&config.database_path())
        .with_context(|| format!("opening database at {}", config.database_path().display()))?;

    let (mesh, notifications) =
        spawn_mesh(&identity.secret_bytes(), &config.networks, config.listen_port)?;
    let mesh = Arc::new(mesh);

    let cloud: Option<Arc<dyn CloudRelay>> = match &config.cloud_url {
        Some(url) => {
            let relay = HttpCloudRelay::new(url.clone(), Duration::from_secs(CLOUD_REQUEST_TIMEOUT_SECS))
                .context("building cloud relay client")?;
            info!(url = %relay.base_url(), "Cloud fallback enabled");
            Some(Arc::new(relay))
        }
        None => {
            warn!("MESHRELAY_CLOUD_URL not set, cloud fallback disabled");
            None
        }
    };

    let node = MeshRelayNode::new(
        config,
        Collaborators {
            identity: Arc::new(identity),
            ratchets: Arc::new(ChainRatchetProvider::new()),
            transport: mesh.clone(),
            discovery: mesh.clone(),
            cloud,
        },
        database,
    )?;
    node.start(notifications);
    println!("peer key: {}", node.local_key());

    let mut events = node.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let NodeEvent::MessageReceived { .. } | NodeEvent::StatusChanged { .. } = &event {
                println!("{}", serde_json::to_string(&event).unwrap_or_default());
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = send_line(&node, &line).await {
                    warn!(error = %e, "Could not send");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown();
    mesh.shutdown().await;
    Ok(())
}

async fn send_line(node: &MeshRelayNode, line: &str) -> anyhow::Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let (recipient, text) = line
        .split_once(char::is_whitespace)
        .context("expected `<peer-key-hex> <text>`")?;
    let recipient = PeerKey::from_hex(recipient).context("invalid peer key")?;

    let sent = node.send(recipient, text.trim()).await?;
    println!(
        "{} -> {} [{} via {}]",
        sent.id,
        recipient.short(),
        sent.status.as_str(),
        sent.method.as_str()
    );
    Ok(())
}
