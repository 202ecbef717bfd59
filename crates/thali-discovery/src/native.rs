//! Native transport — driver over the mobile radio bridge.
//!
//! The bridge itself (Bluetooth on Android, Multipeer Connectivity on
//! iOS) lives outside this crate; we talk to it through [`NativeBridge`]
//! and consume its event stream. This driver normalizes bridge events
//! into [`TransportEvent`]s: on Android a peer is reachable through a
//! loopback forwarder port the bridge maintains, on iOS no address
//! exists until a connection is opened on demand.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::event::{DiscoveryState, NetworkState, Platform, RawPeerEvent, TransportEvent};
use crate::TransportError;

/// Android's bridge exposes native peers through local forwarders.
pub const NATIVE_LOOPBACK_HOST: &str = "127.0.0.1";

/// The out-of-scope radio layer, as this crate consumes it.
pub trait NativeBridge: Send + Sync {
    /// Begin advertising this device and listening for peers.
    fn start_advertising_and_listening(&self) -> Result<(), TransportError>;

    fn stop_advertising_and_listening(&self) -> Result<(), TransportError>;

    /// Begin discovery without advertising.
    fn start_listening_for_advertisements(&self) -> Result<(), TransportError>;

    fn stop_listening_for_advertisements(&self) -> Result<(), TransportError>;

    /// Open a connection to a discovered peer and return the local
    /// forwarder port bound for it. Used on iOS, where no port exists
    /// until someone asks.
    fn connect(&self, peer_identifier: &str) -> Result<u16, TransportError>;
}

/// Events the bridge delivers, in bridge vocabulary.
#[derive(Debug, Clone)]
pub enum NativeBridgeEvent {
    PeerAvailabilityChanged {
        peer_identifier: String,
        generation: u32,
        peer_available: bool,
        port_number: Option<u16>,
    },
    NetworkChanged(NetworkState),
    DiscoveryAdvertisingStateUpdate(DiscoveryState),
    ListenerRecreatedAfterFailure {
        peer_identifier: String,
        port_number: u16,
    },
}

/// Driver forwarding bridge events into the registry's transport stream.
pub struct NativeTransport {
    platform: Platform,
    bridge: Arc<dyn NativeBridge>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

impl NativeTransport {
    /// Wire the bridge's event stream into `events` and return the driver.
    pub fn new(
        platform: Platform,
        bridge: Arc<dyn NativeBridge>,
        mut bridge_events: mpsc::Receiver<NativeBridgeEvent>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            while let Some(event) = bridge_events.recv().await {
                let forwarded = normalize(platform, event);
                if events.send(forwarded).await.is_err() {
                    return;
                }
            }
        });

        Self {
            platform,
            bridge,
            forward: Mutex::new(Some(task)),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Open an on-demand connection to a native peer. iOS only path;
    /// Android peers already carry their forwarder port.
    pub fn connect(&self, peer_identifier: &str) -> Result<u16, TransportError> {
        self.bridge.connect(peer_identifier)
    }

    pub fn start_advertising_and_listening(&self) -> Result<(), TransportError> {
        self.bridge.start_advertising_and_listening()
    }

    pub fn stop_advertising_and_listening(&self) -> Result<(), TransportError> {
        self.bridge.stop_advertising_and_listening()
    }

    pub fn start_listening_for_advertisements(&self) -> Result<(), TransportError> {
        self.bridge.start_listening_for_advertisements()
    }

    pub fn stop_listening_for_advertisements(&self) -> Result<(), TransportError> {
        self.bridge.stop_listening_for_advertisements()
    }

    /// Detach from the bridge's event stream.
    pub async fn shutdown(&self) {
        if let Some(task) = self.forward.lock().await.take() {
            task.abort();
        }
    }
}

/// Map a bridge event into registry vocabulary, fixing up addressing per
/// platform.
fn normalize(platform: Platform, event: NativeBridgeEvent) -> TransportEvent {
    match event {
        NativeBridgeEvent::PeerAvailabilityChanged {
            peer_identifier,
            generation,
            peer_available,
            port_number,
        } => {
            let (host_address, port_number) = match (platform, peer_available) {
                // Android: reachable through the bridge's loopback forwarder
                (Platform::Android, true) => (Some(NATIVE_LOOPBACK_HOST.to_string()), port_number),
                // iOS: nothing is bound until connect() is called
                (Platform::Ios, true) => (None, None),
                (_, false) => (None, None),
            };

            TransportEvent::PeerAvailability(RawPeerEvent {
                peer_id: peer_identifier,
                generation,
                available: peer_available,
                connection_type: platform.native_connection_type(),
                host_address,
                port_number,
            })
        }
        NativeBridgeEvent::NetworkChanged(state) => TransportEvent::NetworkChanged(state),
        NativeBridgeEvent::DiscoveryAdvertisingStateUpdate(state) => {
            TransportEvent::DiscoveryAdvertisingState(state)
        }
        NativeBridgeEvent::ListenerRecreatedAfterFailure {
            peer_identifier,
            port_number,
        } => TransportEvent::ListenerRecreatedAfterFailure {
            peer_identifier,
            port_number,
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
