//! Peer registry — merges both transport streams into one availability view.
//!
//! The registry owns all cross-transport peer state. It runs as a single
//! task consuming transport events, timer expiries and host-info queries
//! from its input channels, so every mutation is serialized — an emitted
//! event always reflects all observations folded in before it.
//!
//! Per entry it tracks generation, addressing, and an unavailability
//! timer that is re-armed on every observation. Entries leave in exactly
//! one of four ways: an explicit unavailable event, timer expiry, the
//! relevant radio turning off, or a silent drain on stop.
//!
//! Outbound discipline: unavailability transitions are never dropped
//! (awaited send); availability transitions may be shed when the
//! consumer lags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use thali_discovery::native::NATIVE_LOOPBACK_HOST;
use thali_discovery::{
    ConnectionType, DiscoveryState, NetworkState, RawPeerEvent, TransportError, TransportEvent,
};

/// Identity of a registry entry. The same device seen over two links is
/// two entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub connection_type: ConnectionType,
    pub peer_id: String,
}

impl PeerKey {
    pub fn new(connection_type: ConnectionType, peer_id: impl Into<String>) -> Self {
        Self {
            connection_type,
            peer_id: peer_id.into(),
        }
    }
}

/// A deduplicated availability transition, as consumers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: String,
    pub connection_type: ConnectionType,
    pub generation: u32,
    pub available: bool,
    /// `None` when becoming unavailable; `Some(false)` on first
    /// discovery or unchanged addressing; `Some(true)` when the host or
    /// port changed and downstream must open a fresh connection.
    pub new_address_port: Option<bool>,
}

impl PeerStatus {
    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.connection_type, self.peer_id.clone())
    }
}

/// Where and how to reach an available peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHostInfo {
    pub host_address: String,
    pub port_number: u16,
    /// Connect-timeout policy for this link type, not a measurement.
    pub suggested_tcp_timeout: Duration,
}

/// Opens on-demand connections to native peers that carry no port until
/// asked (iOS MPCF). Implemented by the native transport.
pub trait NativeConnector: Send + Sync {
    fn connect(&self, peer_identifier: &str) -> Result<u16, TransportError>;
}

/// Tunables the registry needs, lifted out of the full config record.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub tcp_peer_unavailability_threshold: Duration,
    pub non_tcp_peer_unavailability_threshold: Duration,
    pub update_windows_foreground: Duration,
    pub suggested_tcp_timeout_wifi: Duration,
    pub suggested_tcp_timeout_native: Duration,
}

impl RegistryConfig {
    pub fn from_peer_config(peers: &thali_core::config::PeerConfig) -> Self {
        Self {
            tcp_peer_unavailability_threshold: peers.tcp_peer_unavailability_threshold(),
            non_tcp_peer_unavailability_threshold: peers.non_tcp_peer_unavailability_threshold(),
            update_windows_foreground: peers.update_windows_foreground(),
            suggested_tcp_timeout_wifi: peers.suggested_tcp_timeout_wifi(),
            suggested_tcp_timeout_native: peers.suggested_tcp_timeout_native(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("peer is not available")]
    PeerNotAvailable,

    #[error("registry is stopped")]
    Stopped,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap clonable front to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    transport_tx: mpsc::Sender<TransportEvent>,
    internal_tx: mpsc::Sender<Input>,
    connector: Option<Arc<dyn NativeConnector>>,
}

impl RegistryHandle {
    /// Sender the transports feed their raw events into.
    pub fn transport_sender(&self) -> mpsc::Sender<TransportEvent> {
        self.transport_tx.clone()
    }

    /// Look up how to reach an available peer.
    ///
    /// For iOS MPCF peers no port exists until a connection is opened;
    /// the lookup opens one through the native connector and returns the
    /// forwarder's port.
    pub async fn get_peer_host_info(
        &self,
        connection_type: ConnectionType,
        peer_id: &str,
    ) -> Result<PeerHostInfo, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.internal_tx
            .send(Input::HostInfo {
                key: PeerKey::new(connection_type, peer_id),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::Stopped)?;
        let answer = reply_rx.await.map_err(|_| RegistryError::Stopped)??;

        let port_number = match answer.port_number {
            Some(port) => port,
            None => {
                let connector = self
                    .connector
                    .as_ref()
                    .ok_or(RegistryError::PeerNotAvailable)?;
                connector
                    .connect(peer_id)
                    .map_err(|_| RegistryError::PeerNotAvailable)?
            }
        };

        Ok(PeerHostInfo {
            host_address: answer
                .host_address
                .unwrap_or_else(|| NATIVE_LOOPBACK_HOST.to_string()),
            port_number,
            suggested_tcp_timeout: answer.suggested_tcp_timeout,
        })
    }

    /// Silent shutdown: timers cleared, entries drained, zero events.
    /// The task stays alive so a later [`resume`](Self::resume) works.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .internal_tx
            .send(Input::Stop { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Accept observations again after a stop.
    pub async fn resume(&self) {
        let _ = self.internal_tx.send(Input::Resume).await;
    }
}

// ── Task internals ────────────────────────────────────────────────────────────

enum Input {
    TimerExpired {
        key: PeerKey,
        epoch: u64,
    },
    HostInfo {
        key: PeerKey,
        reply: oneshot::Sender<Result<HostInfoAnswer, RegistryError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Resume,
}

struct HostInfoAnswer {
    host_address: Option<String>,
    port_number: Option<u16>,
    suggested_tcp_timeout: Duration,
}

struct Entry {
    generation: u32,
    host_address: Option<String>,
    port_number: Option<u16>,
    /// Bumped on every timer re-arm; a firing timer with a stale epoch
    /// is ignored.
    epoch: u64,
    last_accepted: Instant,
}

/// Start the registry task. Transports feed
/// [`RegistryHandle::transport_sender`]; availability transitions come
/// out of `peer_events`, deduplicated discovery/advertising updates out
/// of `state_events`.
pub fn spawn(
    config: RegistryConfig,
    connector: Option<Arc<dyn NativeConnector>>,
    peer_events: mpsc::Sender<PeerStatus>,
    state_events: mpsc::Sender<DiscoveryState>,
) -> RegistryHandle {
    let (transport_tx, transport_rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::channel(64);

    let task = RegistryTask {
        config,
        entries: HashMap::new(),
        last_state: None,
        running: true,
        peer_events,
        state_events,
        internal_tx: internal_tx.clone(),
    };
    tokio::spawn(task.run(transport_rx, internal_rx));

    RegistryHandle {
        transport_tx,
        internal_tx,
        connector,
    }
}

struct RegistryTask {
    config: RegistryConfig,
    entries: HashMap<PeerKey, Entry>,
    last_state: Option<DiscoveryState>,
    /// Cleared on stop: a stopped registry folds in nothing and emits
    /// nothing until resumed.
    running: bool,
    peer_events: mpsc::Sender<PeerStatus>,
    state_events: mpsc::Sender<DiscoveryState>,
    internal_tx: mpsc::Sender<Input>,
}

impl RegistryTask {
    async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut internal_rx: mpsc::Receiver<Input>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => self.handle_transport(event).await,
                Some(input) = internal_rx.recv() => self.handle_internal(input).await,
                else => return,
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        if !self.running {
            return;
        }
        match event {
            TransportEvent::PeerAvailability(raw) => self.observe(raw).await,
            TransportEvent::NetworkChanged(state) => self.network_changed(&state).await,
            TransportEvent::DiscoveryAdvertisingState(state) => self.state_update(state),
            TransportEvent::ListenerRecreatedAfterFailure {
                peer_identifier,
                port_number,
            } => self.listener_recreated(&peer_identifier, port_number),
        }
    }

    async fn handle_internal(&mut self, input: Input) {
        match input {
            Input::TimerExpired { key, epoch } => {
                let fired = self
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.epoch == epoch);
                if fired {
                    if let Some(entry) = self.entries.remove(&key) {
                        tracing::debug!(
                            peer = %key.peer_id,
                            link = %key.connection_type,
                            "peer silent past threshold"
                        );
                        self.emit_unavailable(&key, entry.generation).await;
                    }
                }
            }
            Input::HostInfo { key, reply } => {
                let _ = reply.send(self.host_info(&key));
            }
            Input::Stop { reply } => {
                // Silent drain: no unavailability events, timers die with
                // their epochs.
                self.running = false;
                self.entries.clear();
                self.last_state = None;
                let _ = reply.send(());
            }
            Input::Resume => {
                self.running = true;
            }
        }
    }

    // ── Observations ──────────────────────────────────────────────────────────

    async fn observe(&mut self, raw: RawPeerEvent) {
        let key = PeerKey::new(raw.connection_type, raw.peer_id.clone());

        if !raw.available {
            // Explicit removal — but never a spurious one
            if let Some(entry) = self.entries.remove(&key) {
                self.emit_unavailable(&key, entry.generation).await;
            }
            return;
        }

        let cached = self.entries.get(&key).map(|entry| {
            (
                entry.generation,
                entry.host_address.clone(),
                entry.port_number,
                entry.last_accepted,
            )
        });

        let Some((cached_generation, cached_host, cached_port, last_accepted)) = cached else {
            // First discovery of this availability episode
            self.entries.insert(
                key.clone(),
                Entry {
                    generation: raw.generation,
                    host_address: raw.host_address.clone(),
                    port_number: raw.port_number,
                    epoch: 0,
                    last_accepted: Instant::now(),
                },
            );
            self.rearm(&key);
            self.emit_available(&key, raw.generation, Some(false));
            return;
        };

        let same_tuple = cached_generation == raw.generation
            && cached_host == raw.host_address
            && cached_port == raw.port_number;

        // A same-generation Bluetooth repeat after the foreground window
        // is a fresh advertisement cycle, not a duplicate
        let bluetooth_recycle = key.connection_type == ConnectionType::Bluetooth
            && last_accepted.elapsed() >= self.config.update_windows_foreground;

        if same_tuple && !bluetooth_recycle {
            // Debounce: the peer is simply still there
            self.rearm(&key);
            return;
        }

        let accepted = match key.connection_type {
            // Wi-Fi generations are carried but not gated; any tuple
            // change drives acceptance
            ConnectionType::TcpNative => true,
            // Wrapping 8-bit counter: any change counts, and a
            // same-value repeat survived the window check to get here
            ConnectionType::Bluetooth => true,
            // Strictly monotonic
            ConnectionType::MultiPeerConnectivity => raw.generation > cached_generation,
        };

        if !accepted {
            tracing::trace!(
                peer = %key.peer_id,
                cached = cached_generation,
                received = raw.generation,
                "generation gate rejected observation"
            );
            return;
        }

        let address_changed =
            cached_host != raw.host_address || cached_port != raw.port_number;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.generation = raw.generation;
            entry.host_address = raw.host_address;
            entry.port_number = raw.port_number;
            entry.last_accepted = Instant::now();
        }
        self.rearm(&key);
        self.emit_available(&key, raw.generation, Some(address_changed));
    }

    fn listener_recreated(&mut self, peer_identifier: &str, port_number: u16) {
        // Recreation only makes sense for native links; a Wi-Fi peer has
        // no local listener bound to it.
        let key = self
            .entries
            .keys()
            .find(|k| {
                k.connection_type != ConnectionType::TcpNative && k.peer_id == peer_identifier
            })
            .cloned();

        let Some(key) = key else {
            tracing::debug!(peer = %peer_identifier, "listener recreated for unknown peer, ignored");
            return;
        };

        let generation = {
            let entry = match self.entries.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            entry.port_number = Some(port_number);
            entry.last_accepted = Instant::now();
            entry.generation
        };
        self.rearm(&key);

        // Even a numerically identical port means the old connection is
        // dead — downstream must reconnect.
        self.emit_available(&key, generation, Some(true));
    }

    // ── Radio transitions ─────────────────────────────────────────────────────

    async fn network_changed(&mut self, state: &NetworkState) {
        let wifi_off = !state.wifi.is_on();
        let bluetooth_off = !state.bluetooth.is_on();

        let mut dropped = Vec::new();
        self.entries.retain(|key, entry| {
            let goes = match key.connection_type {
                ConnectionType::TcpNative => wifi_off,
                ConnectionType::Bluetooth => bluetooth_off,
                // MPCF rides whichever radio is up, so it survives until
                // both are gone
                ConnectionType::MultiPeerConnectivity => wifi_off && bluetooth_off,
            };
            if goes {
                dropped.push((key.clone(), entry.generation));
            }
            !goes
        });

        for (key, generation) in dropped {
            tracing::info!(
                peer = %key.peer_id,
                link = %key.connection_type,
                "radio off, peer dropped"
            );
            self.emit_unavailable(&key, generation).await;
        }
    }

    fn state_update(&mut self, state: DiscoveryState) {
        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);
        if let Err(e) = self.state_events.try_send(state) {
            tracing::warn!(error = %e, "discovery state update dropped");
        }
    }

    // ── Host info ─────────────────────────────────────────────────────────────

    fn host_info(&self, key: &PeerKey) -> Result<HostInfoAnswer, RegistryError> {
        let entry = self
            .entries
            .get(key)
            .ok_or(RegistryError::PeerNotAvailable)?;
        let suggested_tcp_timeout = match key.connection_type {
            ConnectionType::TcpNative => self.config.suggested_tcp_timeout_wifi,
            _ => self.config.suggested_tcp_timeout_native,
        };
        Ok(HostInfoAnswer {
            host_address: entry.host_address.clone(),
            port_number: entry.port_number,
            suggested_tcp_timeout,
        })
    }

    // ── Timers & emission ─────────────────────────────────────────────────────

    /// Re-arm the entry's unavailability timer. Every armed timer carries
    /// the epoch it was armed under; only the latest epoch may fire.
    fn rearm(&mut self, key: &PeerKey) {
        let threshold = match key.connection_type {
            ConnectionType::TcpNative => self.config.tcp_peer_unavailability_threshold,
            _ => self.config.non_tcp_peer_unavailability_threshold,
        };
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.epoch += 1;
        let epoch = entry.epoch;
        let key = key.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            let _ = tx.send(Input::TimerExpired { key, epoch }).await;
        });
    }

    fn emit_available(&self, key: &PeerKey, generation: u32, new_address_port: Option<bool>) {
        let status = PeerStatus {
            peer_id: key.peer_id.clone(),
            connection_type: key.connection_type,
            generation,
            available: true,
            new_address_port,
        };
        // Availability is debounce-eligible: shed it if the consumer lags
        if let Err(e) = self.peer_events.try_send(status) {
            tracing::warn!(peer = %key.peer_id, error = %e, "availability event dropped");
        }
    }

    async fn emit_unavailable(&self, key: &PeerKey, generation: u32) {
        let status = PeerStatus {
            peer_id: key.peer_id.clone(),
            connection_type: key.connection_type,
            generation,
            available: false,
            new_address_port: None,
        };
        // Unavailability is never shed
        let _ = self.peer_events.send(status).await;
    }
}
