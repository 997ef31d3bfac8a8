//! Interface manager: enumerates IPv4 interfaces, derives the
//! process-wide device UUID, and owns one send-side multicast socket per
//! retained interface.

use std::net::Ipv4Addr;
use std::time::Duration;

use network_interface::{Addr, NetworkInterface as SysInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};
use uuid::Uuid;

/// Fallback used when no MAC address can be read from any interface.
const FALLBACK_MAC: [u8; 6] = [0x00, 0x15, 0x5d, 0x00, 0x00, 0x01];

#[derive(Debug)]
pub struct Binding {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub index: u32,
    pub notify_socket: UdpSocket,
}

pub struct InterfaceManager {
    pub bindings: Vec<Binding>,
    pub device_uuid: Uuid,
    configured_names: Option<Vec<String>>,
}

fn derive_uuid() -> Uuid {
    let mac = mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|m| m.bytes())
        .unwrap_or(FALLBACK_MAC);
    // Build a stable, deterministic UUID from the MAC bytes so restarts
    // advertise the same device identity.
    let mut bytes = [0u8; 16];
    bytes[10..16].copy_from_slice(&mac);
    bytes[0..10].copy_from_slice(&[0x4d, 0x44, 0x4c, 0x4e, 0x41, 0x00, 0x00, 0x00, 0x00, 0x00]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

fn open_notify_socket(addr: Ipv4Addr) -> std::io::Result<Socket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_multicast_loop_v4(false)?;
    sock.set_multicast_ttl_v4(4)?;
    sock.set_multicast_if_v4(&addr)?;
    sock.set_broadcast(true)?;
    sock.set_reuse_address(true)?;
    sock.bind(&SockAddr::from(std::net::SocketAddrV4::new(addr, 0)))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

impl InterfaceManager {
    pub fn new(configured_names: Option<Vec<String>>) -> Self {
        Self {
            bindings: Vec::new(),
            device_uuid: derive_uuid(),
            configured_names,
        }
    }

    fn enumerate(&self) -> Vec<(String, Ipv4Addr, Ipv4Addr, u32)> {
        let interfaces = match SysInterface::show() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to enumerate network interfaces: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for nic in interfaces {
            if let Some(names) = &self.configured_names {
                if !names.iter().any(|n| n == &nic.name) {
                    continue;
                }
            }
            for addr in &nic.addr {
                if let Addr::V4(v4) = addr {
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    let netmask = v4.netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
                    out.push((nic.name.clone(), v4.ip, netmask, nic.index));
                    break;
                }
            }
            if out.len() >= 4 {
                break;
            }
        }
        out
    }

    /// Rebuilds the interface table. When `reloading`, callers are
    /// expected to have already sent byebye on the old bindings before
    /// this is invoked, and to send fresh alive notifies after it
    /// returns once `self.bindings` is non-empty.
    pub async fn reload(&mut self, reloading: bool) {
        let mut backoff = Duration::from_millis(500);
        loop {
            let found = self.enumerate();
            if !found.is_empty() {
                let mut bindings = Vec::with_capacity(found.len());
                for (name, addr, netmask, index) in found {
                    match open_notify_socket(addr) {
                        Ok(sock) => match UdpSocket::from_std(sock.into()) {
                            Ok(tokio_sock) => {
                                info!("bound notify socket on {name} ({addr})");
                                bindings.push(Binding {
                                    name,
                                    addr,
                                    netmask,
                                    index,
                                    notify_socket: tokio_sock,
                                });
                            }
                            Err(e) => warn!("failed to adopt socket for {name}: {e}"),
                        },
                        Err(e) => warn!("failed to open notify socket for {name}: {e}"),
                    }
                }
                self.bindings = bindings;
                return;
            }

            if reloading {
                // Reload with nothing found: keep whatever we had and give up
                // the retry loop to the caller, which already sent byebye.
                self.bindings.clear();
                return;
            }

            warn!("no usable network interfaces found; retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(60));
        }
    }

    /// Finds the interface whose subnet contains `addr`; `None` means
    /// "loopback/unknown" (caller decides whether to treat the request
    /// as local-only).
    pub fn interface_for_client(&self, addr: Ipv4Addr) -> Option<usize> {
        let addr_bits = u32::from(addr);
        self.bindings.iter().position(|b| {
            let mask = u32::from(b.netmask);
            (addr_bits & mask) == (u32::from(b.addr) & mask)
        })
    }

    pub fn primary_addr(&self) -> Option<Ipv4Addr> {
        self.bindings.first().map(|b| b.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_derivation_is_deterministic() {
        assert_eq!(derive_uuid(), derive_uuid());
    }

    #[test]
    fn uuid_matches_canonical_shape() {
        let s = derive_uuid().to_string();
        let parts: Vec<&str> = s.split('-').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(s.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    }

    #[test]
    fn interface_for_client_matches_subnet() {
        let mgr = InterfaceManager {
            bindings: vec![],
            device_uuid: Uuid::nil(),
            configured_names: None,
        };
        assert_eq!(mgr.interface_for_client(Ipv4Addr::new(10, 0, 0, 5)), None);
    }
}
