//! Narrow multiaddress support for the QUIC-v1 transport.
//!
//! The full multiaddress/multicodec parser is an external collaborator
//! (spec §1); this module only recognizes the subset the listener needs to
//! parse its own bind address and to format the public address it reports
//! back through `addresses()`.

use std::fmt;
use std::net::IpAddr;

/// A parsed `/ip4|ip6/<addr>/udp/<port>/quic-v1` multiaddress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicMultiaddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl QuicMultiaddr {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self { ip: self.ip, port }
    }
}

impl fmt::Display for QuicMultiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(addr) => write!(f, "/ip4/{addr}/udp/{}/quic-v1", self.port),
            IpAddr::V6(addr) => write!(f, "/ip6/{addr}/udp/{}/quic-v1", self.port),
        }
    }
}

/// Parses a `/ip4|ip6/<addr>/udp/<port>/quic-v1` multiaddress string.
///
/// Returns `None` for anything else, including well-formed multiaddresses
/// using other transports or codecs — this crate does not attempt to be a
/// general multiaddress parser.
pub fn parse(s: &str) -> Option<QuicMultiaddr> {
    let mut parts = s.split('/').filter(|p| !p.is_empty());
    let proto = parts.next()?;
    let addr = parts.next()?;
    let udp_tag = parts.next()?;
    let port = parts.next()?;
    let quic_tag = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if udp_tag != "udp" || quic_tag != "quic-v1" {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    let ip: IpAddr = match proto {
        "ip4" => addr.parse::<std::net::Ipv4Addr>().ok()?.into(),
        "ip6" => addr.parse::<std::net::Ipv6Addr>().ok()?.into(),
        _ => return None,
    };
    Some(QuicMultiaddr { ip, port })
}

impl From<std::net::SocketAddr> for QuicMultiaddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip4() {
        let addr = parse("/ip4/127.0.0.1/udp/4001/quic-v1").unwrap();
        assert_eq!(addr.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 4001);
    }

    #[test]
    fn parses_ip6() {
        let addr = parse("/ip6/::1/udp/4001/quic-v1").unwrap();
        assert_eq!(addr.ip, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 4001);
    }

    #[test]
    fn rejects_non_quic_transport() {
        assert!(parse("/ip4/127.0.0.1/tcp/4001").is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("not a multiaddr").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn roundtrips_through_display() {
        let addr = parse("/ip4/0.0.0.0/udp/0/quic-v1").unwrap();
        let resolved = addr.with_port(4001);
        assert_eq!(resolved.to_string(), "/ip4/0.0.0.0/udp/4001/quic-v1");
    }

    #[test]
    fn from_socket_addr() {
        let sock: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let addr: QuicMultiaddr = sock.into();
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/udp/9000/quic-v1");
    }
}
