//! Address resolution: which IP to put in a token.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::stun::{query_mapped_address, StunError};

/// Destination used to learn the OS-preferred source address. Nothing is sent.
const ROUTE_PROBE: &str = "8.8.8.8:80";

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("interface enumeration failed: {0}")]
    Enumerate(String),
    #[error("route probe failed: {0}")]
    Probe(#[from] std::io::Error),
    #[error("no usable local address found")]
    NoUsableAddress,
    #[error(transparent)]
    Stun(#[from] StunError),
}

/// First non-loopback IPv4 address in 192.168.0.0/16.
pub fn pick_private(interfaces: &[(String, IpAddr)]) -> Option<IpAddr> {
    interfaces.iter().find_map(|(name, ip)| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && v4.octets()[..2] == [192, 168] => {
            tracing::debug!(interface = %name, ip = %v4, "private address selected");
            Some(*ip)
        }
        _ => None,
    })
}

/// A LAN address for this host.
///
/// Prefers a 192.168/16 interface address; otherwise asks the OS which
/// source address it would use to reach a public host.
pub fn local_address() -> Result<IpAddr, AddressError> {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            if let Some(ip) = pick_private(&interfaces) {
                return Ok(ip);
            }
        }
        Err(e) => tracing::debug!(error = %e, "interface listing failed, probing route"),
    }

    let probe = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    probe.connect(ROUTE_PROBE)?;
    let ip = probe.local_addr()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return Err(AddressError::NoUsableAddress);
    }
    tracing::debug!(%ip, "route-probe address selected");
    Ok(ip)
}

/// The public address a NAT maps us to, via one STUN query.
pub async fn external_address(stun_server: &str, timeout: Duration) -> Result<SocketAddr, AddressError> {
    Ok(query_mapped_address(stun_server, timeout).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4]) -> (String, IpAddr) {
        (name.to_string(), IpAddr::from(ip))
    }

    #[test]
    fn private_range_wins() {
        let list = [
            iface("lo", [127, 0, 0, 1]),
            iface("eth0", [10, 0, 0, 5]),
            iface("wlan0", [192, 168, 1, 42]),
        ];
        assert_eq!(pick_private(&list), Some(IpAddr::from([192, 168, 1, 42])));
    }

    #[test]
    fn nothing_private_falls_through() {
        let list = [iface("lo", [127, 0, 0, 1]), iface("eth0", [172, 16, 0, 2])];
        assert_eq!(pick_private(&list), None);
    }

    #[test]
    fn ipv6_is_skipped() {
        let list = [("eth0".to_string(), "fe80::1".parse().unwrap())];
        assert_eq!(pick_private(&list), None);
    }
}
