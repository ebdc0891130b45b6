use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;


pub const TCP: &str = "tcp";
pub const UDP: &str = "udp";

/// Identifies a remote socket. The string form `protocol://address:port` is what session
///  libraries and the master post office use as a key.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Endpoint {
    pub protocol: String,
    pub address: String,
    pub port: String,
}
impl Endpoint {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>, port: impl Into<String>) -> Endpoint {
        Endpoint {
            protocol: protocol.into(),
            address: address.into(),
            port: port.into(),
        }
    }

    pub fn tcp(addr: SocketAddr) -> Endpoint {
        Self::from_socket_addr(TCP, addr)
    }

    pub fn udp(addr: SocketAddr) -> Endpoint {
        Self::from_socket_addr(UDP, addr)
    }

    fn from_socket_addr(protocol: &str, addr: SocketAddr) -> Endpoint {
        Endpoint::new(protocol, addr.ip().to_string(), addr.port().to_string())
    }

    /// `host:port` in a form that `tokio::net::lookup_host` accepts, bracketing IPv6 literals
    pub fn host_and_port(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        }
        else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// A fully reassembled inbound payload with its origin, or an outbound payload with its
///  destination
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointMessage {
    pub endpoint: Endpoint,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::v4("1.2.3.4:5678", "udp://1.2.3.4:5678", "1.2.3.4:5678")]
    #[case::v6("[::1]:80", "udp://::1:80", "[::1]:80")]
    fn test_from_socket_addr(#[case] addr: &str, #[case] display: &str, #[case] host_and_port: &str) {
        let endpoint = Endpoint::udp(SocketAddr::from_str(addr).unwrap());
        assert_eq!(endpoint.to_string(), display);
        assert_eq!(endpoint.host_and_port(), host_and_port);
    }

    #[test]
    fn test_tcp() {
        let endpoint = Endpoint::tcp(SocketAddr::from(([127, 0, 0, 1], 6060)));
        assert_eq!(endpoint, Endpoint::new("tcp", "127.0.0.1", "6060"));
    }
}
