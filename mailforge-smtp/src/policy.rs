//! Relay admission policy: which recipient domains are local, and who may
//! use the server as a relay for everything else.

use std::net::IpAddr;

use serde::Deserialize;

/// A CIDR network, parsed from `a.b.c.d/len` or `addr/len` for IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Parse `127.0.0.0/8` style notation. A bare address is an exact-match
    /// network.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let (addr, prefix) = match input.split_once('/') {
            Some((addr, prefix)) => (addr.parse().ok()?, prefix.parse().ok()?),
            None => {
                let addr: IpAddr = input.parse().ok()?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            }
        };

        let max = if matches!(addr, IpAddr::V4(_)) { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let shift = 32 - u32::from(self.prefix);
                if shift >= 32 {
                    return true;
                }
                (u32::from(net) >> shift) == (u32::from(ip) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let shift = 128 - u32::from(self.prefix);
                if shift >= 128 {
                    return true;
                }
                (u128::from(net) >> shift) == (u128::from(ip) >> shift)
            }
            _ => false,
        }
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid network: {s}")))
    }
}

/// Domains this server is final destination for, plus who may relay through
/// it to anywhere else.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    pub local_domains: Vec<String>,
    pub relay_domains: Vec<String>,
    pub relay_networks: Vec<IpNetwork>,
}

impl RelayPolicy {
    #[must_use]
    pub fn is_local(&self, domain: &str) -> bool {
        self.local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Whether a RCPT TO for a non-local domain is admissible: the client
    /// authenticated, comes from a trusted network, or the domain is one we
    /// relay for unconditionally.
    #[must_use]
    pub fn may_relay(&self, authenticated: bool, peer: IpAddr, domain: &str) -> bool {
        if authenticated {
            return true;
        }

        if self
            .relay_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
        {
            return true;
        }

        self.relay_networks.iter().any(|net| net.contains(peer))
    }
}
