//! Lifecycle orchestrator — owns every component and the start/stop order.
//!
//! Start: notification client → native radio → replication router →
//! SSDP listening → SSDP advertising → notification sender. Stop is the
//! mirror. The lifecycle is an explicit state machine; a second start
//! without a stop fails, as does a stop without a start.
//!
//! Radio-off results from transport starts are informational — the
//! transports re-arm themselves on radio-on, so the manager logs and
//! moves on.

use std::sync::Arc;

use axum::Router;
use k256::PublicKey;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use thali_api::ApiState;
use thali_core::config::ThaliConfig;
use thali_core::crypto::EcdhKeypair;
use thali_discovery::{
    NativeBridge, NativeBridgeEvent, NativeTransport, Platform, TransportError, TransportEvent,
    WifiTransport,
};
use thali_services::registry::{self, RegistryConfig, RegistryHandle};
use thali_services::{
    BeaconFetcher, ImmediatePolicy, LifecycleError, NativeConnector, NotificationClient,
    NotificationSender, PeerPool, ReplicationDriver, SenderError,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Sender(#[from] SenderError),

    #[error("failed to bind replication router: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct Manager {
    config: ThaliConfig,
    wifi: Arc<WifiTransport>,
    native: Arc<NativeTransport>,
    registry: RegistryHandle,
    sender: Arc<NotificationSender>,
    client: Arc<NotificationClient>,
    pool: PeerPool,
    db_router: Router,
    state: Mutex<LifecycleState>,
    api: Mutex<Option<(JoinHandle<()>, u16)>>,
}

impl Manager {
    /// Wire every component together. Nothing is started yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ThaliConfig,
        local: Arc<EcdhKeypair>,
        platform: Platform,
        bridge: Arc<dyn NativeBridge>,
        bridge_events: mpsc::Receiver<NativeBridgeEvent>,
        driver: Arc<dyn ReplicationDriver>,
        fetcher: Arc<dyn BeaconFetcher>,
        db_router: Router,
    ) -> Self {
        let peer_id = uuid::Uuid::new_v4().to_string();

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (state_tx, mut state_rx) = mpsc::channel(16);
        let (tee_tx, mut tee_rx) = mpsc::channel(64);

        let native = Arc::new(NativeTransport::new(platform, bridge, bridge_events, tee_tx));
        let registry = registry::spawn(
            RegistryConfig::from_peer_config(&config.peers),
            Some(native.clone() as Arc<dyn NativeConnector>),
            peer_tx,
            state_tx,
        );
        let wifi = Arc::new(WifiTransport::new(
            peer_id,
            config.ssdp.clone(),
            registry.transport_sender(),
        ));

        // Native bridge events flow to the registry; network changes are
        // teed off so the Wi-Fi transport can re-arm on radio-on.
        {
            let registry_tx = registry.transport_sender();
            let wifi = wifi.clone();
            tokio::spawn(async move {
                while let Some(event) = tee_rx.recv().await {
                    if let TransportEvent::NetworkChanged(network) = &event {
                        wifi.network_changed(network.wifi.is_on()).await;
                    }
                    if registry_tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
        }

        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                tracing::info!(
                    discovery = state.discovery_active,
                    advertising = state.advertising_active,
                    "discovery/advertising state changed"
                );
            }
        });

        let pool = PeerPool::new(
            driver,
            Arc::new(ImmediatePolicy),
            config.replication.pool_max_concurrency,
        );
        let sender = Arc::new(NotificationSender::new(local.clone(), config.beacon.clone()));
        let client = Arc::new(NotificationClient::new(
            local,
            registry.clone(),
            pool.clone(),
            fetcher,
            peer_rx,
        ));

        Self {
            config,
            wifi,
            native,
            registry,
            sender,
            client,
            pool,
            db_router,
            state: Mutex::new(LifecycleState::Stopped),
            api: Mutex::new(None),
        }
    }

    /// The port the replication router bound, once running.
    pub async fn api_port(&self) -> Option<u16> {
        self.api.lock().await.as_ref().map(|(_, port)| *port)
    }

    /// Bring everything up for the given set of authorized identities.
    pub async fn start(&self, remote_keys: Vec<PublicKey>) -> Result<(), ManagerError> {
        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Stopped {
                return Err(LifecycleError::AlreadyStarted.into());
            }
            *state = LifecycleState::Starting;
        }

        match self.start_sequence(remote_keys).await {
            Ok(()) => {
                *self.state.lock().await = LifecycleState::Running;
                tracing::info!("manager running");
                Ok(())
            }
            Err(e) => {
                // Unwind whatever came up before the failure
                self.teardown().await;
                *self.state.lock().await = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_sequence(&self, remote_keys: Vec<PublicKey>) -> Result<(), ManagerError> {
        self.registry.resume().await;
        self.client.start(remote_keys.clone()).await?;

        if let Err(e) = self.native.start_advertising_and_listening() {
            log_transport_start_failure("native", &e);
        }

        // Bind before advertising so LOCATION carries the real port
        let listener = tokio::net::TcpListener::bind((
            "0.0.0.0",
            self.config.replication.api_port,
        ))
        .await?;
        let port = listener.local_addr()?.port();

        let api_state = ApiState {
            psk: self.sender.psk_store(),
            beacon_stream: self.sender.beacon_stream(),
            base_db_path: self.config.replication.base_db_path.clone(),
            local_seq_point_prefix: self.config.replication.local_seq_point_prefix.clone(),
        };
        let db_router = self.db_router.clone();
        let api_task = tokio::spawn(async move {
            if let Err(e) = thali_api::serve(api_state, db_router, listener).await {
                tracing::error!(error = %e, "replication router failed");
            }
        });
        *self.api.lock().await = Some((api_task, port));

        if let Err(e) = self.wifi.start_listening_for_advertisements().await {
            log_transport_start_failure("ssdp listener", &e);
        }
        if let Err(e) = self.wifi.start_update_advertising_and_listening(port).await {
            log_transport_start_failure("ssdp advertiser", &e);
        }

        self.sender.start(remote_keys).await?;
        Ok(())
    }

    /// Take everything down in reverse start order.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Running {
                return Err(LifecycleError::NotStarted.into());
            }
            *state = LifecycleState::Stopping;
        }

        self.teardown().await;
        *self.state.lock().await = LifecycleState::Stopped;
        tracing::info!("manager stopped");
        Ok(())
    }

    async fn teardown(&self) {
        if let Err(e) = self.sender.stop().await {
            tracing::debug!(error = %e, "sender was not running");
        }
        self.wifi.stop_advertising_and_listening().await;
        self.wifi.stop_listening_for_advertisements().await;
        if let Some((task, _)) = self.api.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.native.stop_advertising_and_listening() {
            tracing::debug!(error = %e, "native transport was not running");
        }
        if let Err(e) = self.client.stop().await {
            tracing::debug!(error = %e, "client was not running");
        }
        self.pool.stop();
        self.registry.stop().await;
    }
}

fn log_transport_start_failure(what: &str, error: &TransportError) {
    match error {
        // Informational: the transport re-arms itself on radio-on
        TransportError::RadioTurnedOff => {
            tracing::info!(transport = what, "radio off, start deferred")
        }
        other => tracing::warn!(transport = what, error = %other, "transport start failed"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use thali_services::{NotificationAction, ReplicationFuture};

    struct QuietBridge;

    impl NativeBridge for QuietBridge {
        fn start_advertising_and_listening(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_advertising_and_listening(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn start_listening_for_advertisements(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_listening_for_advertisements(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn connect(&self, _peer: &str) -> Result<u16, TransportError> {
            Err(TransportError::RadioTurnedOff)
        }
    }

    struct NoopDriver;

    impl ReplicationDriver for NoopDriver {
        fn replicate(&self, _action: NotificationAction) -> ReplicationFuture {
            Box::pin(async { Ok(()) })
        }
    }

    struct NoopFetcher;

    impl BeaconFetcher for NoopFetcher {
        fn fetch(&self, _host: &str, _port: u16) -> thali_services::client::FetchFuture {
            Box::pin(async { Ok(bytes::Bytes::new()) })
        }
    }

    fn test_manager() -> (Manager, mpsc::Sender<NativeBridgeEvent>) {
        let mut config = ThaliConfig::default();
        config.ssdp.port = 0;
        config.replication.api_port = 0;

        let (bridge_tx, bridge_rx) = mpsc::channel(8);
        let manager = Manager::new(
            config,
            Arc::new(EcdhKeypair::generate()),
            Platform::Android,
            Arc::new(QuietBridge),
            bridge_rx,
            Arc::new(NoopDriver),
            Arc::new(NoopFetcher),
            Router::new().fallback(|| async { axum::http::StatusCode::NOT_IMPLEMENTED }),
        );
        (manager, bridge_tx)
    }

    #[tokio::test]
    async fn stop_before_start_fails() {
        let (manager, _bridge) = test_manager();
        assert!(matches!(
            manager.stop().await,
            Err(ManagerError::Lifecycle(LifecycleError::NotStarted))
        ));
    }

    #[tokio::test]
    async fn double_start_fails_and_restart_succeeds() {
        let (manager, _bridge) = test_manager();
        let recipient = EcdhKeypair::generate();
        let keys = vec![*recipient.public()];

        manager.start(keys.clone()).await.unwrap();
        assert!(manager.api_port().await.is_some());
        assert!(matches!(
            manager.start(keys.clone()).await,
            Err(ManagerError::Lifecycle(LifecycleError::AlreadyStarted))
        ));

        manager.stop().await.unwrap();
        assert!(manager.api_port().await.is_none());

        // Start → stop → start reproduces the initial external state
        manager.start(keys).await.unwrap();
        manager.stop().await.unwrap();
    }
}
