//! thali-services — the coordination layer between transports and HTTP.
//!
//! The registry merges raw transport events into one availability view;
//! the notification client turns availability into beacon fetches and
//! replication actions; the pool bounds and deduplicates those actions;
//! the sender publishes our own beacons and the PSK tables the admission
//! gate enforces.

pub mod client;
pub mod pool;
pub mod registry;
pub mod sender;

pub use client::{BeaconFetcher, FetchFuture, HttpBeaconFetcher, NotificationClient};
pub use pool::{
    ImmediatePolicy, NotificationAction, PeerPool, PoolPolicy, ReplicationDriver,
    ReplicationFuture,
};
pub use registry::{
    NativeConnector, PeerHostInfo, PeerKey, PeerStatus, RegistryConfig, RegistryError,
    RegistryHandle,
};
pub use sender::{BeaconStreamCell, NotificationSender, SenderError};

use thiserror::Error;

/// Start/stop ordering violations, shared by every lifecycle-bearing
/// component.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Call Start!")]
    NotStarted,

    #[error("Call Stop!")]
    AlreadyStarted,
}

/// Implemented here so the registry can open on-demand MPCF connections
/// through the native transport without depending on it.
impl NativeConnector for thali_discovery::NativeTransport {
    fn connect(&self, peer_identifier: &str) -> Result<u16, thali_discovery::TransportError> {
        thali_discovery::NativeTransport::connect(self, peer_identifier)
    }
}
