//! Allowed-network matching for the HTTP surface.
//!
//! Matches client addresses against a comma-separated CIDR list
//! (`192.168.0.0/16, 10.0.0.0/8`). Bare addresses are treated as
//! host-length prefixes. An empty matcher allows everything.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkParseError {
    #[error("invalid network spec: {0}")]
    InvalidSpec(String),
}

/// Parsed allowed-networks list.
#[derive(Debug, Clone, Default)]
pub struct NetworkMatcher {
    networks: Vec<IpNet>,
}

impl NetworkMatcher {
    /// Parses a comma-separated list of CIDR specs. An empty input yields a
    /// matcher that allows every address.
    pub fn parse(spec: &str) -> Result<Self, NetworkParseError> {
        let mut networks = Vec::new();

        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let net = if let Ok(net) = part.parse::<IpNet>() {
                net
            } else {
                // Bare address without a prefix length
                let addr: IpAddr = part
                    .parse()
                    .map_err(|_| NetworkParseError::InvalidSpec(part.to_string()))?;
                IpNet::from(addr)
            };

            networks.push(net);
        }

        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// True when `ip` is inside one of the configured networks, or when no
    /// networks are configured at all.
    pub fn allows(&self, ip: &IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        // Loopback is always a bridge operator
        if ip.is_loopback() {
            return true;
        }
        self.networks.iter().any(|n| n.contains(ip))
    }
}
