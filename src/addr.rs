//! Address classification
//!
//! Maps IP addresses to a role (local, local-net, reserved, multicast,
//! broadcast, other) given the configured interface address sets, and
//! derives the canonical lower-map / other-type pair that decides which
//! endpoint of a flow is reported as the local side.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use tracing::warn;

use crate::config::AgentConfig;

/// Classified address role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    /// Not yet classified
    None,
    /// Exact match of a locally assigned interface address
    Local,
    /// Within a configured local subnet
    LocalNet,
    /// IETF reserved ranges (RFC 1918, RFC 6890)
    Reserved,
    Multicast,
    Broadcast,
    /// Everything else (public/remote)
    Other,
    /// Classification failed
    Error,
}

/// Which endpoint of the canonical ordering is the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerMap {
    Unknown,
    Local,
    Other,
}

/// What the non-local endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtherType {
    Unknown,
    Unsupported,
    Local,
    Multicast,
    Broadcast,
    Remote,
    Error,
}

/// Derive `(lower_map, other_type)` from the classified endpoint pair.
///
/// Branch order is significant: multicast/broadcast win over reserved,
/// and the reserved/reserved fold applies to IPv4 only (IPv6 pairs with
/// both sides reserved stay unknown pending a verdict on corrupted-header
/// over-matching).
pub fn derive_lower_map(ip_version: u8, lower: AddrType, upper: AddrType) -> (LowerMap, OtherType) {
    use AddrType::*;

    if lower == Error || upper == Error {
        (LowerMap::Unknown, OtherType::Error)
    } else if lower == Local && upper == Local {
        (LowerMap::Local, OtherType::Local)
    } else if lower == Local && upper == LocalNet {
        (LowerMap::Local, OtherType::Local)
    } else if lower == LocalNet && upper == Local {
        (LowerMap::Local, OtherType::Local)
    } else if lower == Multicast {
        (LowerMap::Other, OtherType::Multicast)
    } else if upper == Multicast {
        (LowerMap::Local, OtherType::Multicast)
    } else if lower == Broadcast {
        (LowerMap::Other, OtherType::Broadcast)
    } else if upper == Broadcast {
        (LowerMap::Local, OtherType::Broadcast)
    } else if lower == Reserved && upper == LocalNet {
        (LowerMap::Other, OtherType::Local)
    } else if lower == LocalNet && upper == Reserved {
        (LowerMap::Local, OtherType::Local)
    } else if ip_version != 6 && lower == Reserved && upper == Reserved {
        (LowerMap::Local, OtherType::Local)
    } else if lower == Reserved && upper == Local {
        (LowerMap::Other, OtherType::Remote)
    } else if lower == Local && upper == Reserved {
        (LowerMap::Local, OtherType::Remote)
    } else if lower == LocalNet && upper == LocalNet {
        (LowerMap::Local, OtherType::Local)
    } else if lower == Other {
        (LowerMap::Other, OtherType::Remote)
    } else if upper == Other {
        (LowerMap::Local, OtherType::Remote)
    } else {
        (LowerMap::Unknown, OtherType::Unknown)
    }
}

/// Address classifier built from the configured interface address sets
#[derive(Debug, Default)]
pub struct AddressClassifier {
    /// Locally assigned interface addresses
    local: HashSet<IpAddr>,
    /// Configured local subnets
    local_nets: Vec<IpNetwork>,
}

impl AddressClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from all interface entries in the configuration
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut classifier = Self::new();

        for (ifname, iface) in &config.interfaces {
            for addr in &iface.addresses {
                match addr.parse::<IpAddr>() {
                    Ok(ip) => classifier.add_local(ip),
                    Err(_) => warn!("{}: invalid interface address: {}", ifname, addr),
                }
            }
            for net in &iface.local_networks {
                match net.parse::<IpNetwork>() {
                    Ok(n) => classifier.add_local_net(n),
                    Err(_) => warn!("{}: invalid local network: {}", ifname, net),
                }
            }
        }

        classifier
    }

    pub fn add_local(&mut self, addr: IpAddr) {
        self.local.insert(addr);
    }

    pub fn add_local_net(&mut self, net: IpNetwork) {
        self.local_nets.push(net);
    }

    /// Classify a single address
    pub fn classify(&self, addr: &IpAddr) -> AddrType {
        if is_broadcast(addr) {
            return AddrType::Broadcast;
        }
        if is_multicast(addr) {
            return AddrType::Multicast;
        }
        if self.local.contains(addr) {
            return AddrType::Local;
        }
        if self.local_nets.iter().any(|n| n.contains(*addr)) {
            return AddrType::LocalNet;
        }
        if is_reserved(addr) {
            return AddrType::Reserved;
        }
        AddrType::Other
    }
}

/// Privacy redaction filter. Matching endpoints get privacy mask bits on
/// their flows; digests are still computed on the original tuple.
#[derive(Debug, Default)]
pub struct PrivacyFilter {
    macs: HashSet<crate::core::packet::MacAddr>,
    hosts: HashSet<IpAddr>,
}

impl PrivacyFilter {
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut filter = Self::default();

        for mac in &config.privacy.mac {
            match crate::core::packet::parse_mac(mac) {
                Some(m) => {
                    filter.macs.insert(m);
                }
                None => warn!("Invalid privacy filter MAC: {}", mac),
            }
        }
        for host in &config.privacy.host {
            match host.parse::<IpAddr>() {
                Ok(ip) => {
                    filter.hosts.insert(ip);
                }
                Err(_) => warn!("Invalid privacy filter host: {}", host),
            }
        }

        filter
    }

    pub fn is_empty(&self) -> bool {
        self.macs.is_empty() && self.hosts.is_empty()
    }

    pub fn matches(&self, mac: &crate::core::packet::MacAddr, addr: &IpAddr) -> bool {
        self.macs.contains(mac) || self.hosts.contains(addr)
    }
}

fn is_broadcast(addr: &IpAddr) -> bool {
    matches!(addr, IpAddr::V4(v4) if *v4 == Ipv4Addr::BROADCAST)
}

fn is_multicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// IETF reserved ranges (RFC 1918 plus the RFC 6890 special registry,
/// less the multicast/broadcast ranges handled separately).
fn is_reserved(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

fn is_reserved_v4(addr: &Ipv4Addr) -> bool {
    let o = addr.octets();
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || o[0] == 0                                      // 0.0.0.0/8
        || (o[0] == 100 && (o[1] & 0xc0) == 64)           // 100.64.0.0/10
        || (o[0] == 192 && o[1] == 0 && o[2] == 0)        // 192.0.0.0/24
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)        // 192.0.2.0/24
        || (o[0] == 198 && (o[1] & 0xfe) == 18)           // 198.18.0.0/15
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)     // 198.51.100.0/24
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)      // 203.0.113.0/24
        || o[0] >= 240                                    // 240.0.0.0/4
}

fn is_reserved_v6(addr: &Ipv6Addr) -> bool {
    let s = addr.segments();
    addr.is_loopback()
        || addr.is_unspecified()
        || (s[0] & 0xffc0) == 0xfe80                      // fe80::/10 link-local
        || (s[0] & 0xfe00) == 0xfc00                      // fc00::/7 ULA
        || (s[0] == 0x2001 && s[1] == 0xdb8)              // 2001:db8::/32 documentation
}
