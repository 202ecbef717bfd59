//! Raw peer and radio events shared by both transports.

use serde::{Deserialize, Serialize};

/// Which link a peer was observed on.
///
/// Exactly one of the two non-TCP types is active per platform:
/// Bluetooth on Android, Multipeer Connectivity on iOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    /// Wi-Fi, discovered over SSDP; peers are reachable over plain TCP.
    TcpNative,
    Bluetooth,
    MultiPeerConnectivity,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionType::TcpNative => "tcp-native",
            ConnectionType::Bluetooth => "bluetooth",
            ConnectionType::MultiPeerConnectivity => "mpcf",
        };
        f.write_str(name)
    }
}

/// The mobile platform a node runs on, fixing the native transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// The non-TCP connection type this platform uses.
    pub fn native_connection_type(self) -> ConnectionType {
        match self {
            Platform::Android => ConnectionType::Bluetooth,
            Platform::Ios => ConnectionType::MultiPeerConnectivity,
        }
    }
}

/// One observation of a peer, exactly as a transport saw it.
///
/// Wi-Fi peers always carry host and port when available. Native peers
/// carry only a port on Android (the host is loopback via the bridge's
/// local forwarder) and neither on iOS, where a connection is opened on
/// demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPeerEvent {
    pub peer_id: String,
    pub generation: u32,
    pub available: bool,
    pub connection_type: ConnectionType,
    pub host_address: Option<String>,
    pub port_number: Option<u16>,
}

/// State of a single radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioState {
    On,
    Off,
    /// The hardware does not exist or the platform refuses to say.
    Unavailable,
}

impl RadioState {
    pub fn is_on(self) -> bool {
        matches!(self, RadioState::On)
    }
}

/// Full radio-state snapshot delivered by the native bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub wifi: RadioState,
    pub bluetooth: RadioState,
    pub bluetooth_low_energy: RadioState,
    pub cellular: RadioState,
    /// SSID of the connected access point, when on Wi-Fi.
    pub bssid_name: Option<String>,
}

/// Discovery/advertising activity flags from the native bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscoveryState {
    pub discovery_active: bool,
    pub advertising_active: bool,
}

/// Everything the transports feed into the registry.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerAvailability(RawPeerEvent),
    NetworkChanged(NetworkState),
    DiscoveryAdvertisingState(DiscoveryState),
    /// A local listener bound to a native peer was torn down and rebound.
    /// Downstream must reconnect even when the port number is unchanged.
    ListenerRecreatedAfterFailure {
        peer_identifier: String,
        port_number: u16,
    },
}
