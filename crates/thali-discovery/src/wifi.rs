//! Wi-Fi transport — SSDP advertiser and listener.
//!
//! The advertiser sends NOTIFY alive datagrams to the SSDP group on a
//! fixed interval, carrying `peerIdentifier:generation` and the HTTP
//! endpoint to fetch beacons from. The listener joins the group and
//! forwards every Thali NOTIFY as a raw peer event. Both loops run as
//! detached tasks owned by this struct.
//!
//! Start/stop are idempotent. When the radio is off, start calls record
//! intent and return [`TransportError::RadioTurnedOff`]; a later radio-on
//! network change re-arms whatever was wanted.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use thali_core::config::SsdpConfig;

use crate::event::TransportEvent;
use crate::ssdp;
use crate::TransportError;

/// SSDP advertiser + listener for Wi-Fi peers.
pub struct WifiTransport {
    peer_id: String,
    config: SsdpConfig,
    events: mpsc::Sender<TransportEvent>,
    generation: AtomicU32,
    wifi_on: AtomicBool,
    state: Mutex<WifiState>,
}

#[derive(Default)]
struct WifiState {
    listener: Option<JoinHandle<()>>,
    advertiser: Option<Advertiser>,
    /// Re-arm flags for radio-off/on transitions.
    listening_wanted: bool,
    advertising_wanted: Option<u16>,
}

struct Advertiser {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WifiTransport {
    /// Create a transport. No sockets are opened until a start call.
    /// The radio is assumed on until a network change says otherwise.
    pub fn new(peer_id: String, config: SsdpConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            peer_id,
            config,
            events,
            generation: AtomicU32::new(0),
            wifi_on: AtomicBool::new(true),
            state: Mutex::new(WifiState::default()),
        }
    }

    /// Join the SSDP group and start forwarding peer announcements.
    /// Calling this N times yields the same state as one call.
    pub async fn start_listening_for_advertisements(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.listening_wanted = true;

        if !self.wifi_on.load(Ordering::SeqCst) {
            return Err(TransportError::RadioTurnedOff);
        }
        if state.listener.is_some() {
            return Ok(());
        }

        state.listener = Some(self.spawn_listener()?);
        Ok(())
    }

    /// Stop forwarding announcements. No-op when not listening.
    pub async fn stop_listening_for_advertisements(&self) {
        let mut state = self.state.lock().await;
        state.listening_wanted = false;
        if let Some(task) = state.listener.take() {
            task.abort();
            tracing::debug!("ssdp listener stopped");
        }
    }

    /// Advertise this peer's beacon endpoint on the SSDP group.
    ///
    /// Every call bumps the generation and replaces the running
    /// advertiser — peers treat the new generation as "my data changed,
    /// fetch again".
    pub async fn start_update_advertising_and_listening(
        &self,
        app_port: u16,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.advertising_wanted = Some(app_port);

        if !self.wifi_on.load(Ordering::SeqCst) {
            return Err(TransportError::RadioTurnedOff);
        }

        if let Some(previous) = state.advertiser.take() {
            let _ = previous.shutdown.send(());
            let _ = previous.task.await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        state.advertiser = Some(self.spawn_advertiser(generation, app_port)?);
        Ok(())
    }

    /// Stop advertising, announcing departure with a byebye. No-op when
    /// not advertising.
    pub async fn stop_advertising_and_listening(&self) {
        let mut state = self.state.lock().await;
        state.advertising_wanted = None;
        if let Some(advertiser) = state.advertiser.take() {
            let _ = advertiser.shutdown.send(());
            let _ = advertiser.task.await;
        }
    }

    /// Fold in a radio-state change. Off tears the loops down; on
    /// restores whatever was wanted before.
    pub async fn network_changed(&self, wifi_on: bool) {
        let was_on = self.wifi_on.swap(wifi_on, Ordering::SeqCst);
        if wifi_on == was_on {
            return;
        }

        let mut state = self.state.lock().await;
        if !wifi_on {
            // Radio is gone — no byebye can be sent
            if let Some(task) = state.listener.take() {
                task.abort();
            }
            if let Some(advertiser) = state.advertiser.take() {
                advertiser.task.abort();
            }
            tracing::info!("wifi off, ssdp loops torn down");
            return;
        }

        tracing::info!("wifi on, re-arming ssdp");
        if state.listening_wanted && state.listener.is_none() {
            match self.spawn_listener() {
                Ok(task) => state.listener = Some(task),
                Err(e) => tracing::warn!(error = %e, "ssdp listener re-arm failed"),
            }
        }
        if let Some(port) = state.advertising_wanted {
            if state.advertiser.is_none() {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                match self.spawn_advertiser(generation, port) {
                    Ok(advertiser) => state.advertiser = Some(advertiser),
                    Err(e) => tracing::warn!(error = %e, "ssdp advertiser re-arm failed"),
                }
            }
        }
    }

    /// The generation the next advertising cycle will use.
    pub fn current_generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    // ── Task spawning ─────────────────────────────────────────────────────────

    fn spawn_listener(&self) -> Result<JoinHandle<()>, TransportError> {
        let group = self.multicast_group()?;
        let socket = make_listener_socket(self.config.port, group)?;
        let socket = UdpSocket::from_std(socket)?;
        let events = self.events.clone();
        let own_peer_id = self.peer_id.clone();

        tracing::info!(port = self.config.port, "ssdp listener starting");

        Ok(tokio::spawn(async move {
            listener_loop(socket, events, own_peer_id).await;
        }))
    }

    fn spawn_advertiser(
        &self,
        generation: u32,
        app_port: u16,
    ) -> Result<Advertiser, TransportError> {
        let group = self.multicast_group()?;
        let socket = make_sender_socket()?;
        let socket = UdpSocket::from_std(socket)?;
        let dest = SocketAddr::V4(SocketAddrV4::new(group, self.config.port));
        let interval = self.config.advertisement_interval();
        let host = local_ipv4(group, self.config.port)?;

        let alive = ssdp::build_alive(&self.peer_id, generation, &host.to_string(), app_port);
        let byebye = ssdp::build_byebye(&self.peer_id, generation);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tracing::info!(
            generation,
            app_port,
            interval_ms = interval.as_millis() as u64,
            "ssdp advertiser starting"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match socket.send_to(alive.as_bytes(), dest).await {
                            Ok(n) => tracing::trace!(bytes = n, "ssdp alive sent"),
                            Err(e) => tracing::warn!(error = %e, "ssdp alive send failed"),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        if let Err(e) = socket.send_to(byebye.as_bytes(), dest).await {
                            tracing::warn!(error = %e, "ssdp byebye send failed");
                        }
                        break;
                    }
                }
            }
        });

        Ok(Advertiser {
            shutdown: shutdown_tx,
            task,
        })
    }

    fn multicast_group(&self) -> Result<Ipv4Addr, TransportError> {
        self.config.multicast_address.parse().map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid multicast address {}", self.config.multicast_address),
            ))
        })
    }
}

/// Receive NOTIFY datagrams and forward Thali announcements as events.
async fn listener_loop(
    socket: UdpSocket,
    events: mpsc::Sender<TransportEvent>,
    own_peer_id: String,
) {
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "ssdp recv_from failed");
                continue;
            }
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            tracing::trace!(%source, "non-utf8 datagram ignored");
            continue;
        };

        let Some(event) = ssdp::parse_notify(text) else {
            continue;
        };

        // Our own announcements loop back through the group
        if event.peer_id == own_peer_id {
            continue;
        }

        tracing::debug!(
            peer = %event.peer_id,
            generation = event.generation,
            available = event.available,
            %source,
            "wifi peer announcement"
        );

        if events
            .send(TransportEvent::PeerAvailability(event))
            .await
            .is_err()
        {
            // Registry is gone — nothing left to do
            return;
        }
    }
}

// ── Sockets ───────────────────────────────────────────────────────────────────

/// UDP socket joined to the SSDP multicast group.
fn make_listener_socket(port: u16, group: Ipv4Addr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}

/// UDP socket suitable for sending to the SSDP group.
fn make_sender_socket() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    // TTL 1 — stay on this link
    socket.set_multicast_ttl_v4(1)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    Ok(socket.into())
}

/// The local IPv4 address datagrams to the group would leave from.
/// Advertised in LOCATION so peers know where to fetch beacons.
fn local_ipv4(group: Ipv4Addr, port: u16) -> std::io::Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect(SocketAddrV4::new(group, port))?;
    match probe.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "expected an IPv4 local address",
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SsdpConfig {
        SsdpConfig {
            // Ephemeral port keeps parallel test runs from colliding
            port: 0,
            ..SsdpConfig::default()
        }
    }

    /// Joining the multicast group needs a routable interface; skip
    /// gracefully in environments without one.
    fn multicast_available() -> bool {
        let group = Ipv4Addr::new(239, 255, 255, 250);
        make_listener_socket(0, group).is_ok() && local_ipv4(group, 1900).is_ok()
    }

    #[tokio::test]
    async fn listening_start_is_idempotent() {
        if !multicast_available() {
            eprintln!("SKIP: multicast not available");
            return;
        }

        let (tx, _rx) = mpsc::channel(8);
        let wifi = WifiTransport::new("peer-a".to_string(), test_config(), tx);

        wifi.start_listening_for_advertisements().await.unwrap();
        wifi.start_listening_for_advertisements().await.unwrap();

        wifi.stop_listening_for_advertisements().await;
        wifi.stop_listening_for_advertisements().await;
    }

    #[tokio::test]
    async fn advertising_bumps_generation_each_cycle() {
        if !multicast_available() {
            eprintln!("SKIP: multicast not available");
            return;
        }

        let (tx, _rx) = mpsc::channel(8);
        let wifi = WifiTransport::new("peer-a".to_string(), test_config(), tx);

        assert_eq!(wifi.current_generation(), 0);
        wifi.start_update_advertising_and_listening(4711).await.unwrap();
        assert_eq!(wifi.current_generation(), 1);
        wifi.start_update_advertising_and_listening(4711).await.unwrap();
        assert_eq!(wifi.current_generation(), 2);

        wifi.stop_advertising_and_listening().await;
    }

    #[tokio::test]
    async fn start_with_radio_off_reports_and_rearms() {
        let (tx, _rx) = mpsc::channel(8);
        let wifi = WifiTransport::new("peer-a".to_string(), test_config(), tx);

        wifi.network_changed(false).await;
        let err = wifi.start_listening_for_advertisements().await.unwrap_err();
        assert!(matches!(err, TransportError::RadioTurnedOff));

        if !multicast_available() {
            eprintln!("SKIP: multicast not available");
            return;
        }

        // Radio back on — the wanted listener comes up by itself
        wifi.network_changed(true).await;
        let state = wifi.state.lock().await;
        assert!(state.listener.is_some());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (tx, _rx) = mpsc::channel(8);
        let wifi = WifiTransport::new("peer-a".to_string(), test_config(), tx);
        wifi.stop_advertising_and_listening().await;
        wifi.stop_listening_for_advertisements().await;
    }
}
