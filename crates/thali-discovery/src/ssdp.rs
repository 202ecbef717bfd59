//! SSDP datagram format for Wi-Fi peer announcements.
//!
//! Announcements are plain NOTIFY datagrams on the SSDP multicast group.
//! The USN carries `peerIdentifier:generation` (generation in decimal);
//! LOCATION carries the HTTP endpoint peers fetch beacons from. Only
//! datagrams whose NT matches [`SSDP_NT`] are ours — everything else on
//! the group (printers, TVs, routers) is ignored.

use crate::event::{ConnectionType, RawPeerEvent};

/// The SSDP multicast group every implementation listens on.
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

/// Default SSDP port.
pub const SSDP_PORT: u16 = 1900;

/// Notification type identifying Thali peers on the group.
pub const SSDP_NT: &str = "urn:thali:peer";

/// Build an `ssdp:alive` NOTIFY datagram.
pub fn build_alive(peer_id: &str, generation: u32, host: &str, port: u16) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         NT: {SSDP_NT}\r\n\
         NTS: ssdp:alive\r\n\
         USN: {peer_id}:{generation}\r\n\
         LOCATION: http://{host}:{port}/\r\n\
         CACHE-CONTROL: max-age=180\r\n\r\n"
    )
}

/// Build an `ssdp:byebye` NOTIFY datagram.
pub fn build_byebye(peer_id: &str, generation: u32) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         NT: {SSDP_NT}\r\n\
         NTS: ssdp:byebye\r\n\
         USN: {peer_id}:{generation}\r\n\r\n"
    )
}

/// Parse a datagram into a raw Wi-Fi peer event.
///
/// Returns `None` for anything that is not a Thali NOTIFY: foreign NT,
/// M-SEARCH traffic, malformed USN, or an alive announcement without a
/// usable LOCATION.
pub fn parse_notify(datagram: &str) -> Option<RawPeerEvent> {
    let mut lines = datagram.split("\r\n");
    if !lines.next()?.trim().eq_ignore_ascii_case("NOTIFY * HTTP/1.1") {
        return None;
    }

    let mut nt = None;
    let mut nts = None;
    let mut usn = None;
    let mut location = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_uppercase().as_str() {
            "NT" => nt = Some(value),
            "NTS" => nts = Some(value),
            "USN" => usn = Some(value),
            "LOCATION" => location = Some(value),
            _ => {}
        }
    }

    if nt? != SSDP_NT {
        return None;
    }

    let available = match nts? {
        "ssdp:alive" => true,
        "ssdp:byebye" => false,
        _ => return None,
    };

    let (peer_id, generation) = parse_usn(usn?)?;

    let (host_address, port_number) = if available {
        let (host, port) = parse_location(location?)?;
        (Some(host), Some(port))
    } else {
        (None, None)
    };

    Some(RawPeerEvent {
        peer_id,
        generation,
        available,
        connection_type: ConnectionType::TcpNative,
        host_address,
        port_number,
    })
}

/// Split `peerIdentifier:generation`. The identifier itself may contain
/// colons, so the generation is everything after the last one.
pub fn parse_usn(usn: &str) -> Option<(String, u32)> {
    let (peer_id, generation) = usn.rsplit_once(':')?;
    if peer_id.is_empty() {
        return None;
    }
    Some((peer_id.to_string(), generation.parse().ok()?))
}

/// Extract host and port from `http://host:port/…`.
fn parse_location(location: &str) -> Option<(String, u16)> {
    let rest = location.strip_prefix("http://")?;
    let authority = rest.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
