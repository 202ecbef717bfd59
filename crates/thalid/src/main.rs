//! thalid — Thali peer-to-peer synchronization daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::mpsc;

use thali_core::config::ThaliConfig;
use thali_core::crypto::{self, EcdhKeypair};
use thali_discovery::Platform;
use thali_services::{HttpBeaconFetcher, NotificationAction, ReplicationDriver, ReplicationFuture};

mod bridge;
mod manager;

use bridge::DisabledBridge;
use manager::Manager;

/// Stand-in replication driver until the document store is wired in.
/// Logs what would be pulled and reports success.
struct LoggingDriver;

impl ReplicationDriver for LoggingDriver {
    fn replicate(&self, action: NotificationAction) -> ReplicationFuture {
        Box::pin(async move {
            tracing::info!(
                peer = %action.peer_status.peer_id,
                link = %action.peer_status.connection_type,
                "pull replication requested"
            );
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = ThaliConfig::write_default_if_missing()?;
    let config = ThaliConfig::load()?;
    tracing::info!(path = %config_path.display(), "config loaded");

    let local = Arc::new(load_or_generate_keypair(&config.identity.keypair_path)?);
    tracing::info!(
        identity = %crypto::key_hash_id(&local.key_hash()),
        "identity ready"
    );

    let remote_keys = parse_authorized_peers(&config.trust.authorized_peers)?;
    tracing::info!(peers = remote_keys.len(), "authorized peer set loaded");

    // Desktop build: no mobile radio, so the bridge never emits anything.
    // The sender half is held so the channel stays open.
    let (_bridge_tx, bridge_rx) = mpsc::channel(8);

    // The document store mounts here once it is wired in
    let db_router = Router::new().fallback(|| async { axum::http::StatusCode::NOT_IMPLEMENTED });

    let manager = Manager::new(
        config,
        local,
        Platform::Android,
        Arc::new(DisabledBridge),
        bridge_rx,
        Arc::new(LoggingDriver),
        Arc::new(HttpBeaconFetcher::new()),
        db_router,
    );

    manager.start(remote_keys).await.context("manager start failed")?;
    if let Some(port) = manager.api_port().await {
        tracing::info!(port, "thalid up");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    manager.stop().await.context("manager stop failed")?;
    Ok(())
}

/// Load the device keypair, generating and persisting one on first run.
fn load_or_generate_keypair(path: &Path) -> Result<EcdhKeypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keypair from {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("keypair file is not valid hex")?;
        return EcdhKeypair::from_secret_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("keypair file is corrupt: {e}"));
    }

    let keypair = EcdhKeypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // The scalar is the whole identity; keep the file private
    std::fs::write(path, hex::encode(*keypair.secret_bytes()))
        .with_context(|| format!("failed to write keypair to {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(path = %path.display(), "generated new device keypair");
    Ok(keypair)
}

/// Decode hex-encoded 65-byte uncompressed public keys from config.
fn parse_authorized_peers(entries: &[String]) -> Result<Vec<k256::PublicKey>> {
    entries
        .iter()
        .map(|entry| {
            let bytes = hex::decode(entry)
                .with_context(|| format!("authorized peer is not hex: {entry}"))?;
            crypto::public_key_from_bytes(&bytes)
                .map_err(|e| anyhow::anyhow!("authorized peer is not a public key: {e}"))
        })
        .collect()
}
