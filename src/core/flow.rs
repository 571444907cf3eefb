//! Flow records
//!
//! A flow is a canonically ordered endpoint pair observed on a capture
//! interface. Records are shared between the capture worker that created
//! them, at most one (sticky) detection worker, and transient readers:
//! the update tick and plugins. The flow map holds the canonical strong
//! reference; a record is purged only once expired and unreferenced.
//!
//! Counters and flags are atomic and may be touched by the capture worker
//! at any time. Classification fields live behind an RwLock and are
//! written only by the sticky detection worker; readers look at them
//! after observing `detection_complete`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};

use crate::addr::{AddrType, LowerMap, OtherType};
use crate::capture::InterfaceInfo;
use crate::category::CatId;
use crate::core::packet::{MacAddr, PacketMeta, TunnelType};
use crate::dpi::{FlowMetadata, Protocol};
use crate::FlowDigest;

/// Privacy mask bit: lower endpoint subject to redaction
pub const PRIVATE_LOWER: u8 = 0x01;
/// Privacy mask bit: upper endpoint subject to redaction
pub const PRIVATE_UPPER: u8 = 0x02;

/// Which side the first packet of the flow came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Unknown,
    Lower,
    Upper,
}

/// Atomic flow state flags.
///
/// Lifecycle flags are monotonic: once set they never return to false for
/// the lifetime of the record.
#[derive(Debug, Default)]
pub struct FlowFlags {
    pub detection_init: AtomicBool,
    pub detection_complete: AtomicBool,
    pub detection_updated: AtomicBool,
    pub detection_guessed: AtomicBool,
    pub expiring: AtomicBool,
    pub expired: AtomicBool,
    pub dhc_hit: AtomicBool,
    pub fhc_hit: AtomicBool,
    pub risks_checked: AtomicBool,
    pub soft_dissector: AtomicBool,
    pub tcp_fin: AtomicBool,
    pub tcp_fin_ack: AtomicBool,
    pub ip_nat: AtomicBool,
}

impl FlowFlags {
    #[inline]
    pub fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::Release);
    }
}

/// Atomic per-flow counters. `tick_*` fields are deltas since the last
/// update tick and are cleared by `FlowRecord::reset`.
#[derive(Debug, Default)]
pub struct FlowCounters {
    pub lower_packets: AtomicU64,
    pub lower_bytes: AtomicU64,
    pub upper_packets: AtomicU64,
    pub upper_bytes: AtomicU64,
    pub tick_packets: AtomicU64,
    pub tick_bytes: AtomicU64,
    /// Packets fed to the DPI engine
    pub detection_packets: AtomicU32,
}

impl FlowCounters {
    pub fn total_packets(&self) -> u64 {
        self.lower_packets.load(Ordering::Relaxed) + self.upper_packets.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.lower_bytes.load(Ordering::Relaxed) + self.upper_bytes.load(Ordering::Relaxed)
    }
}

/// Sliding-window rate accounting: one slot per second over the update
/// interval, reported rate is the mean of non-zero slots.
#[derive(Debug)]
pub struct RateWindow {
    slots: Vec<u64>,
    rate: f64,
}

impl RateWindow {
    fn new(interval: usize) -> Self {
        Self {
            slots: vec![0; interval.max(1)],
            rate: 0.0,
        }
    }

    fn update(&mut self, ts_ms: u64, bytes: u64) {
        let index = ((ts_ms / 1000) as usize) % self.slots.len();
        self.slots[index] += bytes;

        let (total, nonzero) = self
            .slots
            .iter()
            .filter(|&&s| s != 0)
            .fold((0u64, 0u32), |(t, n), &s| (t + s, n + 1));
        self.rate = if nonzero > 0 { total as f64 / nonzero as f64 } else { 0.0 };
    }

    fn clear(&mut self) {
        self.slots.fill(0);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Per-direction rate windows
#[derive(Debug)]
pub struct RateSamples {
    pub lower: RateWindow,
    pub upper: RateWindow,
}

/// Category assignment for a classified flow
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowCategories {
    pub application: CatId,
    pub protocol: CatId,
    pub domain: CatId,
    pub network: CatId,
}

/// Classification state owned by the sticky detection worker
#[derive(Debug)]
pub struct FlowDetection {
    pub protocol: Protocol,
    pub application: u32,
    pub protocol_name: String,
    pub application_name: String,
    pub category: FlowCategories,
    /// Server hostname from DPI (SNI, HTTP host, ...)
    pub host_server_name: String,
    /// Hostname hinted by the DNS hint cache
    pub dns_host_name: String,
    pub risks: Vec<u16>,
    pub risk_score: u16,
    pub risk_score_client: u16,
    pub risk_score_server: u16,
    pub metadata: FlowMetadata,
}

impl Default for FlowDetection {
    fn default() -> Self {
        Self {
            protocol: Protocol::Unknown,
            application: 0,
            protocol_name: "Unknown".to_string(),
            application_name: String::new(),
            category: FlowCategories::default(),
            host_server_name: String::new(),
            dns_host_name: String::new(),
            risks: Vec::new(),
            risk_score: 0,
            risk_score_client: 0,
            risk_score_server: 0,
            metadata: FlowMetadata::default(),
        }
    }
}

/// Canonically ordered endpoints of a packet
struct CanonicalTuple {
    lower_mac: MacAddr,
    upper_mac: MacAddr,
    lower_addr: IpAddr,
    upper_addr: IpAddr,
    lower_port: u16,
    upper_port: u16,
    origin: Origin,
}

/// Order endpoints so `lower < upper` by (IP bytes, port)
fn canonicalize(pkt: &PacketMeta) -> CanonicalTuple {
    if (pkt.src_ip, pkt.src_port) <= (pkt.dst_ip, pkt.dst_port) {
        CanonicalTuple {
            lower_mac: pkt.src_mac,
            upper_mac: pkt.dst_mac,
            lower_addr: pkt.src_ip,
            upper_addr: pkt.dst_ip,
            lower_port: pkt.src_port,
            upper_port: pkt.dst_port,
            origin: Origin::Lower,
        }
    } else {
        CanonicalTuple {
            lower_mac: pkt.dst_mac,
            upper_mac: pkt.src_mac,
            lower_addr: pkt.dst_ip,
            upper_addr: pkt.src_ip,
            lower_port: pkt.dst_port,
            upper_port: pkt.src_port,
            origin: Origin::Upper,
        }
    }
}

fn hash_addr(ctx: &mut Sha1, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => ctx.update(v4.octets()),
        IpAddr::V6(v6) => ctx.update(v6.octets()),
    }
}

/// True for the IPv4 all-zeroes to all-ones pair (DHCP DISCOVER et al);
/// such flows fold the client MAC into the digest so requests from
/// different clients stay distinct.
fn is_zero_broadcast(lower: &IpAddr, upper: &IpAddr) -> bool {
    matches!(
        (lower, upper),
        (IpAddr::V4(l), IpAddr::V4(u))
            if l.octets() == [0, 0, 0, 0] && u.octets() == [255, 255, 255, 255]
    )
}

fn digest_tuple(
    iface_name: &str,
    ip_version: u8,
    ip_protocol: u8,
    vlan_id: u16,
    tuple: &CanonicalTuple,
) -> Sha1 {
    let mut ctx = Sha1::new();

    ctx.update(iface_name.as_bytes());
    ctx.update([ip_version, ip_protocol]);
    ctx.update(vlan_id.to_be_bytes());

    hash_addr(&mut ctx, &tuple.lower_addr);
    hash_addr(&mut ctx, &tuple.upper_addr);

    if is_zero_broadcast(&tuple.lower_addr, &tuple.upper_addr) {
        ctx.update(tuple.lower_mac);
    }

    ctx.update(tuple.lower_port.to_be_bytes());
    ctx.update(tuple.upper_port.to_be_bytes());

    ctx
}

/// Primary digest of a packet's canonical tuple; identical regardless of
/// observation direction.
pub fn primary_digest(iface_name: &str, pkt: &PacketMeta) -> FlowDigest {
    let tuple = canonicalize(pkt);
    digest_tuple(iface_name, pkt.ip_version, pkt.ip_protocol, pkt.vlan_id, &tuple)
        .finalize()
        .into()
}

/// Shared flow record
pub struct FlowRecord {
    pub iface: Arc<InterfaceInfo>,

    pub ip_version: u8,
    pub ip_protocol: u8,
    pub vlan_id: u16,
    pub tunnel: TunnelType,

    pub lower_mac: MacAddr,
    pub upper_mac: MacAddr,
    pub lower_addr: IpAddr,
    pub upper_addr: IpAddr,
    pub lower_port: u16,
    pub upper_port: u16,

    pub lower_type: AddrType,
    pub upper_type: AddrType,
    pub lower_map: LowerMap,
    pub other_type: OtherType,
    pub origin: Origin,
    pub privacy_mask: u8,

    /// Packet time of the first packet, milliseconds
    pub ts_first_seen: u64,
    /// Packet time of the most recent packet, milliseconds
    pub ts_last_seen: AtomicU64,
    pub tcp_last_seq: AtomicU32,
    /// Bitmask of sides that sent FIN: bit 0 lower, bit 1 upper
    fin_sides: AtomicU8,

    /// Sticky detection worker (-1 until assigned)
    pub dpi_thread_id: AtomicI16,

    pub digest: FlowDigest,
    pub mdata_digest: Mutex<Option<FlowDigest>>,

    pub flags: FlowFlags,
    pub stats: FlowCounters,
    pub rates: Mutex<RateSamples>,
    pub detection: RwLock<FlowDetection>,
}

impl FlowRecord {
    /// Create a flow from its first packet. The caller has already
    /// computed the primary digest for the map lookup; it is passed in
    /// to avoid hashing twice.
    pub fn new(
        iface: Arc<InterfaceInfo>,
        pkt: &PacketMeta,
        digest: FlowDigest,
        rate_interval: usize,
    ) -> Self {
        let tuple = canonicalize(pkt);

        let flow = Self {
            iface,
            ip_version: pkt.ip_version,
            ip_protocol: pkt.ip_protocol,
            vlan_id: pkt.vlan_id,
            tunnel: pkt.tunnel,
            lower_mac: tuple.lower_mac,
            upper_mac: tuple.upper_mac,
            lower_addr: tuple.lower_addr,
            upper_addr: tuple.upper_addr,
            lower_port: tuple.lower_port,
            upper_port: tuple.upper_port,
            lower_type: AddrType::None,
            upper_type: AddrType::None,
            lower_map: LowerMap::Unknown,
            other_type: OtherType::Unknown,
            origin: tuple.origin,
            privacy_mask: 0,
            ts_first_seen: pkt.ts_ms,
            ts_last_seen: AtomicU64::new(pkt.ts_ms),
            tcp_last_seq: AtomicU32::new(0),
            fin_sides: AtomicU8::new(0),
            dpi_thread_id: AtomicI16::new(-1),
            digest,
            mdata_digest: Mutex::new(None),
            flags: FlowFlags::default(),
            stats: FlowCounters::default(),
            rates: Mutex::new(RateSamples {
                lower: RateWindow::new(rate_interval),
                upper: RateWindow::new(rate_interval),
            }),
            detection: RwLock::new(FlowDetection::default()),
        };

        flow.update_from_packet(pkt);
        flow
    }

    /// Endpoint address of the non-local side per the lower map
    pub fn other_addr(&self) -> &IpAddr {
        match self.lower_map {
            LowerMap::Local => &self.upper_addr,
            _ => &self.lower_addr,
        }
    }

    /// True if this packet travels lower -> upper
    fn is_from_lower(&self, pkt: &PacketMeta) -> bool {
        pkt.src_ip == self.lower_addr && pkt.src_port == self.lower_port
    }

    /// Account a packet: timestamps, direction-aware counters, rate
    /// samples, TCP close tracking. Called by the capture worker with the
    /// bucket lock held only for the map access, not for this.
    pub fn update_from_packet(&self, pkt: &PacketMeta) {
        let from_lower = self.is_from_lower(pkt);
        let bytes = pkt.length as u64;

        self.ts_last_seen.store(pkt.ts_ms, Ordering::Release);
        self.stats.tick_packets.fetch_add(1, Ordering::Relaxed);
        self.stats.tick_bytes.fetch_add(bytes, Ordering::Relaxed);

        if from_lower {
            self.stats.lower_packets.fetch_add(1, Ordering::Relaxed);
            self.stats.lower_bytes.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.stats.upper_packets.fetch_add(1, Ordering::Relaxed);
            self.stats.upper_bytes.fetch_add(bytes, Ordering::Relaxed);
        }

        {
            let mut rates = self.rates.lock();
            let window = if from_lower { &mut rates.lower } else { &mut rates.upper };
            window.update(pkt.ts_ms, bytes);
        }

        if let Some(tcp) = &pkt.tcp {
            self.tcp_last_seq.store(tcp.seq, Ordering::Relaxed);

            if tcp.flags.fin {
                FlowFlags::set(&self.flags.tcp_fin);
                let side = if from_lower { 0x01 } else { 0x02 };
                let prev = self.fin_sides.fetch_or(side, Ordering::AcqRel);
                if prev | side == 0x03 {
                    FlowFlags::set(&self.flags.tcp_fin_ack);
                }
            }
        }
    }

    /// Compute the metadata digest once classification has stabilized:
    /// the primary inputs plus the detected (protocol, application) pair,
    /// the server hostname and the BitTorrent info hash when present.
    pub fn compute_mdata_digest(&self, detection: &FlowDetection) -> FlowDigest {
        let tuple = CanonicalTuple {
            lower_mac: self.lower_mac,
            upper_mac: self.upper_mac,
            lower_addr: self.lower_addr,
            upper_addr: self.upper_addr,
            lower_port: self.lower_port,
            upper_port: self.upper_port,
            origin: self.origin,
        };

        let mut ctx = digest_tuple(
            &self.iface.name,
            self.ip_version,
            self.ip_protocol,
            self.vlan_id,
            &tuple,
        );

        ctx.update(detection.protocol.id().to_be_bytes());
        ctx.update(detection.application.to_be_bytes());

        if !detection.host_server_name.is_empty() {
            ctx.update(detection.host_server_name.as_bytes());
        }
        if let Some(bt) = &detection.metadata.bittorrent {
            ctx.update(bt.info_hash);
        }

        ctx.finalize().into()
    }

    /// Clear per-tick delta bookkeeping; called by the update tick for
    /// flows that were active in the last interval.
    pub fn reset(&self) {
        self.stats.tick_packets.store(0, Ordering::Relaxed);
        self.stats.tick_bytes.store(0, Ordering::Relaxed);

        let mut rates = self.rates.lock();
        rates.lower.clear();
        rates.upper.clear();
    }

    pub fn is_expired(&self) -> bool {
        FlowFlags::get(&self.flags.expired)
    }

    pub fn is_expiring(&self) -> bool {
        FlowFlags::get(&self.flags.expiring)
    }

    pub fn is_detection_complete(&self) -> bool {
        FlowFlags::get(&self.flags.detection_complete)
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.ts_last_seen.load(Ordering::Acquire)
    }

    /// Compact flag string for debug dumps, one letter per set flag
    pub fn flag_string(&self) -> String {
        let f = &self.flags;
        let mut s = String::with_capacity(13);
        let pairs = [
            ('p', &f.detection_init),
            ('c', &f.detection_complete),
            ('u', &f.detection_updated),
            ('g', &f.detection_guessed),
            ('x', &f.expiring),
            ('X', &f.expired),
            ('d', &f.dhc_hit),
            ('f', &f.fhc_hit),
            ('n', &f.ip_nat),
            ('r', &f.risks_checked),
            ('s', &f.soft_dissector),
            ('F', &f.tcp_fin_ack),
        ];
        for (c, flag) in pairs {
            s.push(if FlowFlags::get(flag) { c } else { '-' });
        }
        s
    }
}

impl std::fmt::Debug for FlowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} {}:{} <-> {}:{} proto={} [{}]",
            self.iface.name,
            self.flag_string(),
            self.lower_addr,
            self.lower_port,
            self.upper_addr,
            self.upper_port,
            self.ip_protocol,
            hex_prefix(&self.digest),
        )
    }
}

/// First five digest bytes as hex, enough to identify a flow in logs
pub fn hex_prefix(digest: &FlowDigest) -> String {
    digest[..5].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceRole;
    use crate::testing::frames;

    fn iface() -> Arc<InterfaceInfo> {
        Arc::new(InterfaceInfo::new("test0", InterfaceRole::Lan))
    }

    fn tcp_pkt(src: &str, sport: u16, dst: &str, dport: u16) -> PacketMeta {
        let frame = frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            src,
            sport,
            dst,
            dport,
            frames::TcpKind::Syn,
            1,
            &[],
        );
        PacketMeta::parse(&frame, 1000).unwrap()
    }

    #[test]
    fn test_digest_direction_invariant() {
        let fwd = tcp_pkt("192.168.1.100", 54321, "10.0.0.1", 80);
        let rev = tcp_pkt("10.0.0.1", 80, "192.168.1.100", 54321);

        assert_eq!(primary_digest("eth0", &fwd), primary_digest("eth0", &rev));
        // Different interface, different digest.
        assert_ne!(primary_digest("eth0", &fwd), primary_digest("eth1", &fwd));
    }

    #[test]
    fn test_digest_broadcast_folds_mac() {
        let frame_a = frames::udp(
            frames::MAC_A,
            frames::MAC_BCAST,
            "0.0.0.0",
            68,
            "255.255.255.255",
            67,
            b"discover",
        );
        let frame_b = frames::udp(
            frames::MAC_B,
            frames::MAC_BCAST,
            "0.0.0.0",
            68,
            "255.255.255.255",
            67,
            b"discover",
        );
        let a = PacketMeta::parse(&frame_a, 1).unwrap();
        let b = PacketMeta::parse(&frame_b, 1).unwrap();

        assert_ne!(primary_digest("eth0", &a), primary_digest("eth0", &b));
    }

    #[test]
    fn test_canonical_ordering() {
        let pkt = tcp_pkt("10.0.0.1", 80, "192.168.1.100", 54321);
        let digest = primary_digest("test0", &pkt);
        let flow = FlowRecord::new(iface(), &pkt, digest, 15);

        // 10.0.0.1 sorts below 192.168.1.100, and it sent the packet.
        assert_eq!(flow.lower_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.lower_port, 80);
        assert_eq!(flow.origin, Origin::Lower);
        assert_eq!(flow.stats.lower_packets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_direction_counters() {
        let syn = tcp_pkt("192.168.1.100", 54321, "10.0.0.1", 80);
        let digest = primary_digest("test0", &syn);
        let flow = FlowRecord::new(iface(), &syn, digest, 15);

        let reply = tcp_pkt("10.0.0.1", 80, "192.168.1.100", 54321);
        flow.update_from_packet(&reply);

        // 10.0.0.1 is the lower endpoint; the reply came from it.
        assert_eq!(flow.stats.lower_packets.load(Ordering::Relaxed), 1);
        assert_eq!(flow.stats.upper_packets.load(Ordering::Relaxed), 1);
        assert_eq!(flow.stats.total_packets(), 2);
    }

    #[test]
    fn test_fin_handshake() {
        let syn = tcp_pkt("192.168.1.100", 54321, "10.0.0.1", 80);
        let digest = primary_digest("test0", &syn);
        let flow = FlowRecord::new(iface(), &syn, digest, 15);

        let fin_a = frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            54321,
            "10.0.0.1",
            80,
            frames::TcpKind::FinAck,
            10,
            &[],
        );
        flow.update_from_packet(&PacketMeta::parse(&fin_a, 2000).unwrap());
        assert!(FlowFlags::get(&flow.flags.tcp_fin));
        assert!(!FlowFlags::get(&flow.flags.tcp_fin_ack));

        let fin_b = frames::tcp(
            frames::MAC_B,
            frames::MAC_A,
            "10.0.0.1",
            80,
            "192.168.1.100",
            54321,
            frames::TcpKind::FinAck,
            20,
            &[],
        );
        flow.update_from_packet(&PacketMeta::parse(&fin_b, 2001).unwrap());
        assert!(FlowFlags::get(&flow.flags.tcp_fin_ack));
        assert_eq!(flow.last_seen_ms(), 2001);
    }

    #[test]
    fn test_rate_window() {
        let mut window = RateWindow::new(15);
        window.update(1_000, 100);
        window.update(2_000, 300);
        // Mean of non-zero slots only.
        assert_eq!(window.rate(), 200.0);
        window.clear();
        assert_eq!(window.rate(), 200.0); // rate survives the clear
        window.update(3_000, 50);
        assert_eq!(window.rate(), 50.0);
    }

    #[test]
    fn test_reset_clears_tick_deltas() {
        let pkt = tcp_pkt("192.168.1.100", 54321, "10.0.0.1", 80);
        let digest = primary_digest("test0", &pkt);
        let flow = FlowRecord::new(iface(), &pkt, digest, 15);

        assert_eq!(flow.stats.tick_packets.load(Ordering::Relaxed), 1);
        flow.reset();
        assert_eq!(flow.stats.tick_packets.load(Ordering::Relaxed), 0);
        // Totals are unaffected.
        assert_eq!(flow.stats.total_packets(), 1);
    }

    #[test]
    fn test_mdata_digest_depends_on_classification() {
        let pkt = tcp_pkt("192.168.1.100", 54321, "10.0.0.1", 80);
        let digest = primary_digest("test0", &pkt);
        let flow = FlowRecord::new(iface(), &pkt, digest, 15);

        let mut detection = FlowDetection::default();
        detection.protocol = Protocol::Http;
        let a = flow.compute_mdata_digest(&detection);

        detection.host_server_name = "example.test".to_string();
        let b = flow.compute_mdata_digest(&detection);

        assert_ne!(a, b);
        assert_ne!(a, flow.digest);
    }
}
