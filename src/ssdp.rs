//! SSDP discovery: the M-SEARCH responder and the periodic NOTIFY
//! alive/byebye emitter. Both are driven by the main loop in
//! [`crate::server`]; this module only owns the wire format and the
//! process-wide receive socket.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::iface::{Binding, InterfaceManager};

pub const SSDP_PORT: u16 = 1900;
pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MAX_SEARCH_DELAY_MS: u64 = 2000;

struct AdvertisedType {
    prefix: String,
    has_version_suffix: bool,
}

fn advertised_types(uuid: &Uuid) -> [AdvertisedType; 6] {
    [
        AdvertisedType { prefix: format!("uuid:{uuid}"), has_version_suffix: false },
        AdvertisedType { prefix: "upnp:rootdevice".to_string(), has_version_suffix: false },
        AdvertisedType {
            prefix: "urn:schemas-upnp-org:device:MediaServer:".to_string(),
            has_version_suffix: true,
        },
        AdvertisedType {
            prefix: "urn:schemas-upnp-org:service:ContentDirectory:".to_string(),
            has_version_suffix: true,
        },
        AdvertisedType {
            prefix: "urn:schemas-upnp-org:service:ConnectionManager:".to_string(),
            has_version_suffix: true,
        },
        AdvertisedType {
            prefix: "urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:".to_string(),
            has_version_suffix: true,
        },
    ]
}

fn matches_entry(entry: &AdvertisedType, st: &str) -> bool {
    let Some(rest) = st.strip_prefix(entry.prefix.as_str()) else {
        return false;
    };
    if !entry.has_version_suffix || rest.is_empty() {
        return true;
    }
    let mut chars = rest.chars();
    if chars.next() != Some('1') {
        return false;
    }
    chars.all(|c| c.is_whitespace())
}

fn full_st(entry: &AdvertisedType) -> String {
    if entry.has_version_suffix {
        format!("{}1", entry.prefix)
    } else {
        entry.prefix.clone()
    }
}

fn usn_for(uuid: &Uuid, entry_index: usize, entry: &AdvertisedType) -> String {
    if entry_index == 0 {
        format!("uuid:{uuid}")
    } else {
        format!("uuid:{uuid}::{}", full_st(entry))
    }
}

/// Binds the single process-wide SSDP receive socket on port 1900,
/// joining the multicast group on every retained interface.
pub fn bind_receive_socket(bindings: &[Binding]) -> std::io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    let bind_addr = SocketAddrV4::new(SSDP_MULTICAST_ADDR, SSDP_PORT);
    #[cfg(not(target_os = "linux"))]
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    sock.bind(&SockAddr::from(bind_addr))?;
    sock.set_nonblocking(true)?;
    let std_sock: std::net::UdpSocket = sock.into();
    let tokio_sock = UdpSocket::from_std(std_sock)?;
    for b in bindings {
        if let Err(e) = tokio_sock.join_multicast_v4(SSDP_MULTICAST_ADDR, b.addr) {
            warn!("failed to join multicast group on {}: {e}", b.name);
        }
    }
    Ok(tokio_sock)
}

fn scan_headers(lines: &str) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    for line in lines.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            out.insert(name.trim().to_ascii_uppercase(), value.trim().to_string());
        }
    }
    out
}

fn rfc1123_now() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

/// Handles one received SSDP datagram; replies on `recv_sock` to `from`
/// for every advertised type the request's `ST` matches.
pub async fn handle_datagram(
    recv_sock: &UdpSocket,
    data: &[u8],
    from: std::net::SocketAddr,
    device_uuid: &Uuid,
    port: u16,
    notify_interval: u64,
    server_string: &str,
) {
    let text = String::from_utf8_lossy(data);
    let mut parts = text.splitn(2, "\r\n");
    let Some(request_line) = parts.next() else { return };
    if request_line.trim() != "M-SEARCH * HTTP/1.1" {
        trace!("ignoring non M-SEARCH datagram from {from}");
        return;
    }
    let headers = scan_headers(parts.next().unwrap_or(""));

    let Some(man) = headers.get("MAN") else { return };
    if man.trim_matches('"') != "ssdp:discover" {
        return;
    }
    let Some(mx) = headers.get("MX") else { return };
    if mx.parse::<u32>().is_err() {
        return;
    }
    let Some(st) = headers.get("ST") else { return };

    let types = advertised_types(device_uuid);
    let max_age = notify_interval * 2 + 10;

    for (i, entry) in types.iter().enumerate() {
        let matched = st == "ssdp:all" || matches_entry(entry, st);
        if !matched {
            continue;
        }
        let delay = rand::rng().random_range(0..MAX_SEARCH_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let response_st = full_st(entry);
        let usn = usn_for(device_uuid, i, entry);
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age={max_age}\r\n\
             DATE: {date}\r\n\
             EXT:\r\n\
             LOCATION: http://{host}:{port}/rootDesc.xml\r\n\
             SERVER: {server_string}\r\n\
             ST: {response_st}\r\n\
             USN: {usn}\r\n\r\n",
            date = rfc1123_now(),
            host = match from.ip() {
                std::net::IpAddr::V4(v4) => v4.to_string(),
                other => other.to_string(),
            },
        );
        if let Err(e) = recv_sock.send_to(response.as_bytes(), from).await {
            debug!("failed to send SSDP response to {from}: {e}");
        }
    }
}

fn notify_message(nts: &str, device_uuid: &Uuid, entry_index: usize, entry: &AdvertisedType, port: u16, server_string: &str, notify_interval: u64) -> String {
    let max_age = notify_interval * 2 + 10;
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: {mcast}:{mport}\r\n\
         CACHE-CONTROL: max-age={max_age}\r\n\
         LOCATION: http://{{host}}:{port}/rootDesc.xml\r\n\
         SERVER: {server_string}\r\n\
         NT: {nt}\r\n\
         NTS: {nts}\r\n\
         USN: {usn}\r\n\r\n",
        mcast = SSDP_MULTICAST_ADDR,
        mport = SSDP_PORT,
        nt = full_st(entry),
        usn = usn_for(device_uuid, entry_index, entry),
    )
}

async fn send_burst(bindings: &[Binding], device_uuid: &Uuid, port: u16, server_string: &str, notify_interval: u64, nts: &str) {
    let types = advertised_types(device_uuid);
    let dest = SocketAddrV4::new(SSDP_MULTICAST_ADDR, SSDP_PORT);
    for binding in bindings {
        for _pass in 0..2 {
            for (i, entry) in types.iter().enumerate() {
                let msg = notify_message(nts, device_uuid, i, entry, port, server_string, notify_interval)
                    .replace("{host}", &binding.addr.to_string());
                if let Err(e) = binding.notify_socket.send_to(msg.as_bytes(), dest).await {
                    debug!("notify send failed on {}: {e}", binding.name);
                }
            }
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
    }
}

pub async fn send_all_notifies(bindings: &[Binding], device_uuid: &Uuid, port: u16, server_string: &str, notify_interval: u64) {
    send_burst(bindings, device_uuid, port, server_string, notify_interval, "ssdp:alive").await;
}

pub async fn send_all_goodbyes(bindings: &[Binding], device_uuid: &Uuid, port: u16, server_string: &str, notify_interval: u64) {
    send_burst(bindings, device_uuid, port, server_string, notify_interval, "ssdp:byebye").await;
}

pub async fn reload_interfaces(mgr: &mut InterfaceManager, port: u16, server_string: &str, notify_interval: u64) {
    if !mgr.bindings.is_empty() {
        send_all_goodbyes(&mgr.bindings, &mgr.device_uuid, port, server_string, notify_interval).await;
    }
    mgr.reload(true).await;
    if !mgr.bindings.is_empty() {
        send_all_notifies(&mgr.bindings, &mgr.device_uuid, port, server_string, notify_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssdp_all_matches_everything() {
        let uuid = Uuid::nil();
        let types = advertised_types(&uuid);
        for t in &types {
            assert!("ssdp:all" == "ssdp:all" || matches_entry(t, "ssdp:all"));
        }
    }

    #[test]
    fn root_device_matches_prefix_only() {
        let uuid = Uuid::nil();
        let types = advertised_types(&uuid);
        assert!(matches_entry(&types[1], "upnp:rootdevice"));
    }

    #[test]
    fn versioned_entry_requires_digit_one() {
        let uuid = Uuid::nil();
        let types = advertised_types(&uuid);
        assert!(matches_entry(&types[3], "urn:schemas-upnp-org:service:ContentDirectory:1"));
        assert!(matches_entry(&types[3], "urn:schemas-upnp-org:service:ContentDirectory:"));
        assert!(!matches_entry(&types[3], "urn:schemas-upnp-org:service:ContentDirectory:2"));
    }

    #[test]
    fn usn_for_bare_uuid_has_no_suffix() {
        let uuid = Uuid::nil();
        let types = advertised_types(&uuid);
        assert_eq!(usn_for(&uuid, 0, &types[0]), format!("uuid:{uuid}"));
    }

    #[test]
    fn usn_for_versioned_type_has_double_colon_and_suffix() {
        let uuid = Uuid::nil();
        let types = advertised_types(&uuid);
        let usn = usn_for(&uuid, 3, &types[3]);
        assert!(usn.starts_with(&format!("uuid:{uuid}::")));
        assert!(usn.ends_with(":1"));
    }
}
