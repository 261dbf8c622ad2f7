use std::fmt;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{DiscoveryError, DiscoveryResult};

static DIAL_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:\[([0-9a-f:.]+)\]|([a-z0-9.-]+)):(\d{1,5})$")
        .expect("dial target pattern is valid")
});

/// One reachable backend.
///
/// The dial target is always a validated `host:port`, with IPv6 hosts
/// enclosed in square brackets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    dial: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Joins a host and a port into an endpoint.
    pub fn new(host: &str, port: u16) -> DiscoveryResult<Self> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DiscoveryError::InvalidEndpoint(format!(":{port}")));
        }

        let dial = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self::parse(&dial)
    }

    /// Parses a `host:port` string.
    pub fn parse(addr: &str) -> DiscoveryResult<Self> {
        let caps = DIAL_TARGET
            .captures(addr)
            .ok_or_else(|| DiscoveryError::InvalidEndpoint(addr.to_string()))?;

        let invalid = || DiscoveryError::InvalidEndpoint(addr.to_string());

        let host = match (caps.get(1), caps.get(2)) {
            (Some(v6), _) => {
                v6.as_str().parse::<IpAddr>().map_err(|_| invalid())?;
                v6.as_str()
            }
            (None, Some(name)) => name.as_str(),
            (None, None) => return Err(invalid()),
        };

        let port = caps
            .get(3)
            .and_then(|p| p.as_str().parse::<u16>().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            dial: addr.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn dial(&self) -> &str {
        &self.dial
    }

    /// Host part without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an address, when it is an IP literal rather than a name.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dial)
    }
}
