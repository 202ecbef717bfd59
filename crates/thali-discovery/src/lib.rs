//! thali-discovery — link-layer transports feeding the peer registry.
//!
//! Two transports produce one stream of [`TransportEvent`]s: an SSDP
//! advertiser/listener for Wi-Fi peers, and a driver over the native
//! mobile radio bridge (Bluetooth on Android, Multipeer Connectivity on
//! iOS). Neither transport interprets the events — merging, debounce and
//! timers belong to the registry.

pub mod event;
pub mod native;
pub mod ssdp;
pub mod wifi;

pub use event::{
    ConnectionType, DiscoveryState, NetworkState, Platform, RadioState, RawPeerEvent,
    TransportEvent,
};
pub use native::{NativeBridge, NativeBridgeEvent, NativeTransport};
pub use wifi::WifiTransport;

use thiserror::Error;

/// Errors surfaced by transport start/stop operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying radio is off. Informational — the transport re-arms
    /// itself when a radio-on network change arrives.
    #[error("radio is turned off")]
    RadioTurnedOff,

    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}
