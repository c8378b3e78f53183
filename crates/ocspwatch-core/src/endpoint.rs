//! Target endpoints and the discovery seam.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// One monitored TLS endpoint, produced by the host's resolver.
/// Immutable per discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname, also used for SNI.
    pub name: String,
    /// Resolved address, preferred for dialing when present.
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Labels propagated onto this target's metric events.
    pub labels: Vec<(String, String)>,
}

impl Endpoint {
    /// New endpoint on the default TLS port.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: None,
            port: 443,
            labels: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Stable identity used for worker bookkeeping and cache keys.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }

    /// Address to dial: the resolved IP when known, else the name.
    pub fn dial_addr(&self) -> String {
        match self.ip {
            Some(ip) => SocketAddr::new(ip, self.port).to_string(),
            None => format!("{}:{}", self.name, self.port),
        }
    }
}

/// Supplies the current endpoint set. Implemented by the host
/// scheduler; no ordering is guaranteed across calls.
pub trait TargetResolver: Send + Sync {
    fn list_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_name_and_port() {
        let ep = Endpoint::new("example.com").with_port(8443);
        assert_eq!(ep.key(), "example.com:8443");
    }

    #[test]
    fn default_port_is_443() {
        let ep = Endpoint::new("example.com");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.dial_addr(), "example.com:443");
    }

    #[test]
    fn dial_addr_prefers_resolved_ip() {
        let ep = Endpoint::new("example.com").with_ip("192.0.2.7".parse().unwrap());
        assert_eq!(ep.dial_addr(), "192.0.2.7:443");
    }

    #[test]
    fn dial_addr_brackets_ipv6() {
        let ep = Endpoint::new("example.com")
            .with_ip("2001:db8::1".parse().unwrap())
            .with_port(8443);
        assert_eq!(ep.dial_addr(), "[2001:db8::1]:8443");
    }
}
