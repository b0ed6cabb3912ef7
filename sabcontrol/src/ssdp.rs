//! SSDP M-SEARCH client.
//!
//! The bridge is a pure control point: it only sends M-SEARCH and collects
//! the unicast 200 replies, so it binds an ephemeral port and never touches
//! UDP 1900. (Binding 1900 alongside a real UPnP device would make the
//! kernel load-balance replies between sockets and lose them randomly.)

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
pub const SSDP_PORT: u16 = 1900;

/// Search target matching every Sonos ZonePlayer.
pub const ZONEPLAYER_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";

/// Sends one M-SEARCH and collects distinct `LOCATION` headers until
/// `timeout` elapses.
pub fn search(search_target: &str, timeout: Duration) -> std::io::Result<Vec<String>> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(true)?;

    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    socket2.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket2.into();
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mx = timeout.as_secs().clamp(1, 5);
    let msg = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: SABridge SSDP Client\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, mx, search_target
    );

    let multicast: SocketAddr = format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
        .parse()
        .unwrap();
    socket.send_to(msg.as_bytes(), multicast)?;
    debug!("M-SEARCH sent (ST={}, MX={})", search_target, mx);

    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();
    let mut locations = Vec::new();
    let mut buf = [0u8; 8192];

    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let data = String::from_utf8_lossy(&buf[..n]);
                if let Some(location) = parse_search_response(&data, search_target) {
                    if seen.insert(location.clone()) {
                        debug!("SSDP response from {}: {}", from, location);
                        locations.push(location);
                    }
                } else {
                    trace!("Ignoring SSDP message from {}", from);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("SSDP read error: {}", e);
                return Err(e);
            }
        }
    }

    Ok(locations)
}

/// Extracts the `LOCATION` of an M-SEARCH 200 reply whose `ST` matches the
/// requested target.
pub fn parse_search_response(data: &str, search_target: &str) -> Option<String> {
    let mut lines = data.lines();
    let first_line = lines.next()?.trim().to_ascii_uppercase();
    if !first_line.starts_with("HTTP/") || !first_line.contains(" 200 ") {
        return None;
    }

    let headers = parse_headers(lines);

    let st = headers.get("ST")?;
    if st != search_target {
        trace!("ST mismatch: {}", st);
        return None;
    }

    headers.get("LOCATION").cloned()
}

fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        // Split on the first ':' only; values may contain ':'
        if let Some(colon_pos) = line.find(':') {
            let (name, value_with_colon) = line.split_at(colon_pos);
            let value = &value_with_colon[1..];

            let name = name.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age = 1800\r\n\
        EXT:\r\n\
        LOCATION: http://192.168.1.50:1400/xml/device_description.xml\r\n\
        SERVER: Linux UPnP/1.0 Sonos/83.1-61240 (ZPS13)\r\n\
        ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
        USN: uuid:RINCON_abc::urn:schemas-upnp-org:device:ZonePlayer:1\r\n\r\n";

    #[test]
    fn parses_matching_response() {
        let location = parse_search_response(RESPONSE, ZONEPLAYER_SEARCH_TARGET).unwrap();
        assert_eq!(
            location,
            "http://192.168.1.50:1400/xml/device_description.xml"
        );
    }

    #[test]
    fn rejects_st_mismatch() {
        assert!(parse_search_response(RESPONSE, "urn:schemas-upnp-org:device:Other:1").is_none());
    }

    #[test]
    fn rejects_notify_and_garbage() {
        let notify = "NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\n\r\n";
        assert!(parse_search_response(notify, ZONEPLAYER_SEARCH_TARGET).is_none());
        assert!(parse_search_response("", ZONEPLAYER_SEARCH_TARGET).is_none());
    }

    #[test]
    fn header_values_keep_embedded_colons() {
        let headers = parse_headers("LOCATION: http://h:1400/desc.xml\r\n\r\n".lines());
        assert_eq!(headers["LOCATION"], "http://h:1400/desc.xml");
    }
}
