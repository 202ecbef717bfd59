//! Notification client — turns peer availability into replication work.
//!
//! Subscribes to the registry's availability stream. Each newly-available
//! peer gets one beacon fetch; if a beacon in the response addresses us
//! and the address book recognizes the sender, a pull-replication action
//! is handed to the pool. Unavailability and beacon expiry cancel the
//! action.
//!
//! The fetch itself goes through [`BeaconFetcher`] — the TLS-PSK client
//! plugs in there; the default implementation speaks plain HTTP with the
//! fixed beacon identity's reqwest client.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use k256::PublicKey;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use thali_core::beacon;
use thali_core::crypto::{key_hash, EcdhKeypair, KeyHash};

use crate::pool::{NotificationAction, PeerPool};
use crate::registry::{PeerStatus, RegistryHandle};
use crate::LifecycleError;

pub type FetchFuture = Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>>;

/// Fetches a peer's published beacon stream.
pub trait BeaconFetcher: Send + Sync + 'static {
    fn fetch(&self, host: &str, port: u16) -> FetchFuture;
}

/// Plain-HTTP fetcher for `GET /NotificationBeacons`.
pub struct HttpBeaconFetcher {
    client: reqwest::Client,
}

impl HttpBeaconFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpBeaconFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconFetcher for HttpBeaconFetcher {
    fn fetch(&self, host: &str, port: u16) -> FetchFuture {
        let url = format!("http://{host}:{port}/NotificationBeacons");
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.get(&url).send().await?.error_for_status()?;
            Ok(response.bytes().await?)
        })
    }
}

pub struct NotificationClient {
    local: Arc<EcdhKeypair>,
    registry: RegistryHandle,
    pool: PeerPool,
    fetcher: Arc<dyn BeaconFetcher>,
    /// Kept outside the worker task so a stop/start cycle reuses the
    /// same subscription.
    events: Arc<Mutex<mpsc::Receiver<PeerStatus>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationClient {
    pub fn new(
        local: Arc<EcdhKeypair>,
        registry: RegistryHandle,
        pool: PeerPool,
        fetcher: Arc<dyn BeaconFetcher>,
        events: mpsc::Receiver<PeerStatus>,
    ) -> Self {
        Self {
            local,
            registry,
            pool,
            fetcher,
            events: Arc::new(Mutex::new(events)),
            worker: Mutex::new(None),
        }
    }

    /// Begin watching for peers that may hold data for us.
    ///
    /// `remote_keys` is the set of identities we are willing to pull
    /// from; it doubles as the beacon parser's address book.
    pub async fn start(&self, remote_keys: Vec<PublicKey>) -> Result<(), LifecycleError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(LifecycleError::AlreadyStarted);
        }

        let address_book: HashMap<KeyHash, PublicKey> = remote_keys
            .into_iter()
            .map(|key| (key_hash(&key), key))
            .collect();

        let local = self.local.clone();
        let registry = self.registry.clone();
        let pool = self.pool.clone();
        let fetcher = self.fetcher.clone();
        let events = self.events.clone();

        *worker = Some(tokio::spawn(async move {
            let mut events = events.lock().await;
            while let Some(status) = events.recv().await {
                handle_status(&local, &registry, &pool, fetcher.as_ref(), &address_book, status)
                    .await;
            }
        }));
        Ok(())
    }

    /// Stop watching and cancel all in-flight work.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut worker = self.worker.lock().await;
        let Some(task) = worker.take() else {
            return Err(LifecycleError::NotStarted);
        };
        task.abort();
        self.pool.stop();
        Ok(())
    }
}

async fn handle_status(
    local: &EcdhKeypair,
    registry: &RegistryHandle,
    pool: &PeerPool,
    fetcher: &dyn BeaconFetcher,
    address_book: &HashMap<KeyHash, PublicKey>,
    status: PeerStatus,
) {
    let key = status.key();

    if !status.available {
        pool.cancel(&key);
        return;
    }

    // An address change invalidates whatever attempt was running against
    // the old endpoint
    if status.new_address_port == Some(true) {
        pool.cancel(&key);
    }

    let info = match registry
        .get_peer_host_info(status.connection_type, &status.peer_id)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            tracing::debug!(peer = %status.peer_id, error = %e, "peer vanished before fetch");
            return;
        }
    };

    let stream = match fetcher.fetch(&info.host_address, info.port_number).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(peer = %status.peer_id, error = %e, "beacon fetch failed");
            return;
        }
    };

    match beacon::parse(&stream, local, address_book) {
        Ok(Some(sender_hash)) => {
            let Some(remote_public_key) = address_book.get(&sender_hash).copied() else {
                return;
            };
            tracing::info!(peer = %status.peer_id, "beacon matched, scheduling pull replication");
            pool.enqueue(NotificationAction {
                remote_public_key,
                peer_status: status,
            });

            // The beacon's word only holds until it expires
            if let Some(seconds) = beacon::expiration_seconds(&stream) {
                let pool = pool.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(seconds.max(0) as u64)).await;
                    pool.cancel(&key);
                });
            }
        }
        Ok(None) => {
            tracing::debug!(peer = %status.peer_id, "no beacon addressed to us");
        }
        Err(e) => {
            tracing::warn!(peer = %status.peer_id, error = %e, "malformed beacon stream");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
