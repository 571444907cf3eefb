//! Packet parsing
//!
//! Decodes a raw L2 frame into the metadata the flow pipeline needs.
//! Parse failures never reach flow processing; the capture worker counts
//! them per interface and drops the frame.

use std::net::IpAddr;

use etherparse::{InternetSlice, LinkSlice, SlicedPacket, TransportSlice, VlanSlice};
use thiserror::Error;

pub type MacAddr = [u8; 6];

/// GTP-U user-plane port used for tunnel detection
const GTPU_PORT: u16 = 2152;

#[derive(Debug, Error)]
pub enum PacketError {
    /// Header/length inconsistency; counts toward the malformed counter
    #[error("malformed packet: {0}")]
    Malformed(String),
    /// Valid frame that carries no IP payload (ARP etc); silently skipped
    #[error("non-IP frame")]
    NoIp,
}

/// Tunnel encapsulation observed on the outer flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelType {
    #[default]
    None,
    Gtp,
}

/// TCP header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

/// Parsed packet metadata handed from capture to flow tracking
#[derive(Debug, Clone)]
pub struct PacketMeta {
    /// Packet timestamp in milliseconds
    pub ts_ms: u64,
    /// Raw frame length on the wire
    pub length: u32,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    /// 0 when untagged
    pub vlan_id: u16,
    pub ip_version: u8,
    pub ip_protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// 0 for protocols without ports
    pub src_port: u16,
    pub dst_port: u16,
    /// Present for TCP segments
    pub tcp: Option<TcpSegment>,
    pub tunnel: TunnelType,
    /// Transport payload
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub flags: TcpFlags,
    pub seq: u32,
}

impl PacketMeta {
    /// Parse an Ethernet frame
    pub fn parse(data: &[u8], ts_ms: u64) -> Result<Self, PacketError> {
        let sliced = SlicedPacket::from_ethernet(data)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;

        let (src_mac, dst_mac) = match &sliced.link {
            Some(LinkSlice::Ethernet2(eth)) => (eth.source(), eth.destination()),
            None => return Err(PacketError::Malformed("missing link layer".into())),
        };

        let vlan_id = match &sliced.vlan {
            Some(VlanSlice::SingleVlan(v)) => v.vlan_identifier(),
            Some(VlanSlice::DoubleVlan(v)) => v.inner().vlan_identifier(),
            None => 0,
        };

        let (ip_version, src_ip, dst_ip, header_protocol) = match &sliced.ip {
            Some(InternetSlice::Ipv4(h, _)) => (
                4u8,
                IpAddr::V4(h.source_addr()),
                IpAddr::V4(h.destination_addr()),
                h.protocol(),
            ),
            Some(InternetSlice::Ipv6(h, _)) => (
                6u8,
                IpAddr::V6(h.source_addr()),
                IpAddr::V6(h.destination_addr()),
                h.next_header(),
            ),
            None => return Err(PacketError::NoIp),
        };

        let mut src_port = 0u16;
        let mut dst_port = 0u16;
        let mut tcp = None;

        let ip_protocol = match &sliced.transport {
            Some(TransportSlice::Tcp(t)) => {
                src_port = t.source_port();
                dst_port = t.destination_port();
                tcp = Some(TcpSegment {
                    flags: TcpFlags {
                        syn: t.syn(),
                        ack: t.ack(),
                        fin: t.fin(),
                        rst: t.rst(),
                        psh: t.psh(),
                        urg: t.urg(),
                    },
                    seq: t.sequence_number(),
                });
                6
            }
            Some(TransportSlice::Udp(u)) => {
                src_port = u.source_port();
                dst_port = u.destination_port();
                17
            }
            Some(TransportSlice::Icmpv4(_)) => 1,
            Some(TransportSlice::Icmpv6(_)) => 58,
            Some(TransportSlice::Unknown(p)) => *p,
            None => header_protocol,
        };

        let tunnel = if ip_protocol == 17
            && (dst_port == GTPU_PORT || src_port == GTPU_PORT)
            && sliced.payload.first().is_some_and(|b| b >> 5 == 1)
        {
            TunnelType::Gtp
        } else {
            TunnelType::None
        };

        Ok(Self {
            ts_ms,
            length: data.len() as u32,
            src_mac,
            dst_mac,
            vlan_id,
            ip_version,
            ip_protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            tcp,
            tunnel,
            payload: sliced.payload.to_vec(),
        })
    }

    pub fn is_tcp(&self) -> bool {
        self.ip_protocol == 6
    }

    pub fn is_udp(&self) -> bool {
        self.ip_protocol == 17
    }

    /// Either port matches
    pub fn has_port(&self, port: u16) -> bool {
        self.src_port == port || self.dst_port == port
    }

    /// Approximate in-memory size used for queue byte accounting
    pub fn queued_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.payload.len()
    }
}

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a MAC address from `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for octet in mac.iter_mut() {
        *octet = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frames;

    #[test]
    fn test_parse_tcp_syn() {
        let frame = frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            54321,
            "10.0.0.1",
            80,
            frames::TcpKind::Syn,
            1000,
            &[],
        );
        let pkt = PacketMeta::parse(&frame, 1).unwrap();

        assert_eq!(pkt.ip_version, 4);
        assert_eq!(pkt.ip_protocol, 6);
        assert_eq!(pkt.src_port, 54321);
        assert_eq!(pkt.dst_port, 80);
        assert_eq!(pkt.src_mac, frames::MAC_A);
        let tcp = pkt.tcp.unwrap();
        assert!(tcp.flags.syn && !tcp.flags.ack);
        assert_eq!(tcp.seq, 1000);
    }

    #[test]
    fn test_parse_udp_payload() {
        let frame = frames::udp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            5000,
            "8.8.8.8",
            53,
            b"hello",
        );
        let pkt = PacketMeta::parse(&frame, 1).unwrap();

        assert_eq!(pkt.ip_protocol, 17);
        assert_eq!(pkt.payload, b"hello");
        assert!(pkt.tcp.is_none());
        assert_eq!(pkt.tunnel, TunnelType::None);
    }

    #[test]
    fn test_parse_vlan() {
        let frame = frames::udp_vlan(
            frames::MAC_A,
            frames::MAC_B,
            42,
            "192.168.1.100",
            5000,
            "192.168.1.200",
            5001,
            b"x",
        );
        let pkt = PacketMeta::parse(&frame, 1).unwrap();
        assert_eq!(pkt.vlan_id, 42);
    }

    #[test]
    fn test_parse_truncated() {
        let frame = frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            1,
            "10.0.0.1",
            2,
            frames::TcpKind::Syn,
            0,
            &[],
        );
        assert!(matches!(
            PacketMeta::parse(&frame[..20], 1),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn test_mac_roundtrip() {
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(format_mac(&mac), "aa:bb:cc:dd:ee:ff");
        assert!(parse_mac("aa:bb:cc").is_none());
    }
}
