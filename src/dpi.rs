//! Deep packet inspection
//!
//! `DpiEngine` is the seam to the dissection machinery: it creates one
//! `FlowDissector` per flow, which consumes packets until it reaches a
//! verdict or the detection budget forces a guess. The in-tree
//! `HeuristicEngine` classifies by lightweight payload matchers with a
//! port-table fallback; heavier engines plug in behind the same trait.

use std::net::IpAddr;

/// Detected protocols. Ids are stable; names are the human-readable
/// strings reported in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Unknown,
    Http,
    Https,
    Tls,
    Quic,
    Dns,
    Mdns,
    Llmnr,
    Ssh,
    Dhcp,
    Ntp,
    BitTorrent,
    Ssdp,
    Smtp,
    Imap,
    Pop3,
    Ftp,
    Telnet,
    Snmp,
    Syslog,
    Stun,
    Ntlm,
}

impl Protocol {
    pub fn id(&self) -> u16 {
        match self {
            Protocol::Unknown => 0,
            Protocol::Http => 1,
            Protocol::Https => 2,
            Protocol::Tls => 3,
            Protocol::Quic => 4,
            Protocol::Dns => 5,
            Protocol::Mdns => 6,
            Protocol::Llmnr => 7,
            Protocol::Ssh => 8,
            Protocol::Dhcp => 9,
            Protocol::Ntp => 10,
            Protocol::BitTorrent => 11,
            Protocol::Ssdp => 12,
            Protocol::Smtp => 13,
            Protocol::Imap => 14,
            Protocol::Pop3 => 15,
            Protocol::Ftp => 16,
            Protocol::Telnet => 17,
            Protocol::Snmp => 18,
            Protocol::Syslog => 19,
            Protocol::Stun => 20,
            Protocol::Ntlm => 21,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Unknown => "Unknown",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Tls => "TLS",
            Protocol::Quic => "QUIC",
            Protocol::Dns => "DNS",
            Protocol::Mdns => "MDNS",
            Protocol::Llmnr => "LLMNR",
            Protocol::Ssh => "SSH",
            Protocol::Dhcp => "DHCP",
            Protocol::Ntp => "NTP",
            Protocol::BitTorrent => "BitTorrent",
            Protocol::Ssdp => "SSDP",
            Protocol::Smtp => "SMTP",
            Protocol::Imap => "IMAP",
            Protocol::Pop3 => "POP3",
            Protocol::Ftp => "FTP",
            Protocol::Telnet => "Telnet",
            Protocol::Snmp => "SNMP",
            Protocol::Syslog => "Syslog",
            Protocol::Stun => "STUN",
            Protocol::Ntlm => "NTLM",
        }
    }

    /// Fold variants that share a carrier protocol, for metadata checks
    pub fn master(&self) -> Protocol {
        match self {
            Protocol::Https => Protocol::Tls,
            Protocol::Mdns | Protocol::Llmnr => Protocol::Dns,
            other => *other,
        }
    }
}

/// Risk ids reported by the dissectors
pub mod risk {
    pub const OBSOLETE_TLS_VERSION: u16 = 1;
    pub const KNOWN_PROTO_ON_NON_STD_PORT: u16 = 2;
    pub const CLEARTEXT_CREDENTIALS: u16 = 3;
}

#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub version: u16,
    pub cipher_suite: u16,
    pub sni: Option<String>,
    pub server_cn: Option<String>,
    pub issuer_dn: Option<String>,
    pub subject_dn: Option<String>,
    pub client_ja3: Option<String>,
    pub server_ja3: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpInfo {
    pub url: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DhcpInfo {
    /// Comma-joined parameter request list (option 55)
    pub fingerprint: Option<String>,
    /// Vendor class identifier (option 60)
    pub class_ident: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SshInfo {
    pub client_agent: Option<String>,
    pub server_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BtInfo {
    pub info_hash: [u8; 20],
}

#[derive(Debug, Clone, Default)]
pub struct MdnsInfo {
    pub domain_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SsdpInfo {
    pub user_agent: Option<String>,
}

/// Protocol-specific metadata extracted during dissection
#[derive(Debug, Clone, Default)]
pub struct FlowMetadata {
    pub tls: Option<TlsInfo>,
    pub http: Option<HttpInfo>,
    pub dhcp: Option<DhcpInfo>,
    pub ssh: Option<SshInfo>,
    pub bittorrent: Option<BtInfo>,
    pub mdns: Option<MdnsInfo>,
    pub ssdp: Option<SsdpInfo>,
    /// Server hostname (SNI, HTTP host, ...)
    pub host_server_name: Option<String>,
    /// Address-to-name pairs observed in DNS answers; fed to the DHC
    pub dns_hints: Vec<(IpAddr, String)>,
    pub risks: Vec<u16>,
}

/// Dissection outcome for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpiVerdict {
    InProgress,
    Done { proto: Protocol, app: u32, guessed: bool },
}

/// Per-flow dissection state. Dropped when the flow expires.
pub trait FlowDissector: Send {
    /// Feed one packet; payload is the transport payload.
    fn dissect(&mut self, pkt: &crate::core::packet::PacketMeta, payload: &[u8]) -> DpiVerdict;

    /// Best-effort classification when the budget is exhausted or the
    /// flow is expiring without a conclusive verdict.
    fn guess(&self) -> DpiVerdict;

    /// Extracted metadata; callers take a snapshot at finalization and
    /// again on later update passes.
    fn metadata(&self) -> FlowMetadata;
}

/// Factory for per-flow dissection state
pub trait DpiEngine: Send + Sync {
    fn new_state(&self) -> Box<dyn FlowDissector>;
}

/// Built-in byte-matcher engine
pub struct HeuristicEngine {
    /// Allow the port-table fallback
    pub soft_dissectors: bool,
}

impl HeuristicEngine {
    pub fn new(soft_dissectors: bool) -> Self {
        Self { soft_dissectors }
    }
}

impl DpiEngine for HeuristicEngine {
    fn new_state(&self) -> Box<dyn FlowDissector> {
        Box::new(HeuristicState {
            soft_dissectors: self.soft_dissectors,
            first_src: None,
            metadata: FlowMetadata::default(),
            verdict: None,
            fallback_port: 0,
        })
    }
}

struct HeuristicState {
    soft_dissectors: bool,
    /// Endpoint that sent the first dissected packet; assumed client
    first_src: Option<(IpAddr, u16)>,
    metadata: FlowMetadata,
    verdict: Option<Protocol>,
    fallback_port: u16,
}

impl HeuristicState {
    fn from_client(&self, pkt: &crate::core::packet::PacketMeta) -> bool {
        match self.first_src {
            Some((ip, port)) => pkt.src_ip == ip && pkt.src_port == port,
            None => true,
        }
    }

    fn add_risk(&mut self, id: u16) {
        if !self.metadata.risks.contains(&id) {
            self.metadata.risks.push(id);
        }
    }

    fn conclude(&mut self, proto: Protocol) -> DpiVerdict {
        self.verdict = Some(proto);
        DpiVerdict::Done { proto, app: 0, guessed: false }
    }
}

impl FlowDissector for HeuristicState {
    fn dissect(&mut self, pkt: &crate::core::packet::PacketMeta, payload: &[u8]) -> DpiVerdict {
        if self.first_src.is_none() {
            self.first_src = Some((pkt.src_ip, pkt.src_port));
        }
        // Remember the server-side port for the fallback guess.
        if self.fallback_port == 0 {
            self.fallback_port = pkt.src_port.min(pkt.dst_port);
        }

        if payload.is_empty() {
            return DpiVerdict::InProgress;
        }

        // TLS record layer.
        if pkt.is_tcp() && payload.len() >= 5 && payload[0] == 0x16 && payload[1] == 0x03 {
            let from_client = self.from_client(pkt);
            if let Some(hello) = tls::parse_handshake(payload) {
                let version = {
                    let tls = self.metadata.tls.get_or_insert_with(TlsInfo::default);
                    if tls.version == 0 || hello.version > tls.version {
                        tls.version = hello.version;
                    }
                    if let Some(cipher) = hello.cipher_suite {
                        tls.cipher_suite = cipher;
                    }
                    if from_client {
                        if let Some(sni) = &hello.sni {
                            tls.sni = Some(sni.clone());
                        }
                    }
                    tls.version
                };
                if from_client {
                    if let Some(sni) = hello.sni {
                        self.metadata.host_server_name = Some(sni);
                    }
                }
                if version != 0 && version < 0x0303 {
                    self.add_risk(risk::OBSOLETE_TLS_VERSION);
                }

                let proto = if pkt.has_port(443) { Protocol::Https } else { Protocol::Tls };
                if !(pkt.has_port(443) || pkt.has_port(993) || pkt.has_port(995)) {
                    self.add_risk(risk::KNOWN_PROTO_ON_NON_STD_PORT);
                }
                // Hold out for the ClientHello before concluding so the
                // SNI makes it into the metadata digest.
                if from_client || self.metadata.host_server_name.is_some() {
                    return self.conclude(proto);
                }
                return DpiVerdict::InProgress;
            }
        }

        // HTTP request line.
        if pkt.is_tcp() {
            if let Some(req) = http::parse_request(payload) {
                {
                    let info = self.metadata.http.get_or_insert_with(HttpInfo::default);
                    if let Some(host) = &req.host {
                        info.host = Some(host.clone());
                        info.url = Some(format!("{}{}", host, req.path));
                    } else {
                        info.url = Some(req.path.clone());
                    }
                    if req.user_agent.is_some() {
                        info.user_agent = req.user_agent.clone();
                    }
                }
                if let Some(host) = req.host {
                    self.metadata.host_server_name = Some(host);
                }
                if req.has_basic_auth {
                    self.add_risk(risk::CLEARTEXT_CREDENTIALS);
                }
                if !(pkt.has_port(80) || pkt.has_port(8080)) {
                    self.add_risk(risk::KNOWN_PROTO_ON_NON_STD_PORT);
                }
                return self.conclude(Protocol::Http);
            }
        }

        // SSH identification string.
        if pkt.is_tcp() && payload.starts_with(b"SSH-") {
            let agent = text_line(payload);
            let from_client = self.from_client(pkt);
            let ssh = self.metadata.ssh.get_or_insert_with(SshInfo::default);
            if from_client {
                ssh.client_agent = Some(agent);
            } else {
                ssh.server_agent = Some(agent);
            }
            if !pkt.has_port(22) {
                self.add_risk(risk::KNOWN_PROTO_ON_NON_STD_PORT);
            }
            return self.conclude(Protocol::Ssh);
        }

        if pkt.is_udp() {
            // DHCP: fixed header plus magic cookie.
            if (pkt.has_port(67) || pkt.has_port(68)) && payload.len() > 240 {
                if payload[236..240] == [0x63, 0x82, 0x53, 0x63] {
                    let info = dhcp::parse_options(&payload[240..]);
                    self.metadata.dhcp = Some(info);
                    return self.conclude(Protocol::Dhcp);
                }
            }

            // DNS and its multicast cousins.
            if pkt.has_port(53) || pkt.has_port(5353) || pkt.has_port(5355) {
                if let Some(msg) = dns::parse(payload) {
                    let proto = if pkt.has_port(5353) {
                        Protocol::Mdns
                    } else if pkt.has_port(5355) {
                        Protocol::Llmnr
                    } else {
                        Protocol::Dns
                    };

                    if proto == Protocol::Mdns {
                        let mdns = self.metadata.mdns.get_or_insert_with(MdnsInfo::default);
                        if mdns.domain_name.is_none() {
                            mdns.domain_name = msg.queries.first().cloned();
                        }
                    }
                    for (name, addr) in &msg.answers {
                        self.metadata.dns_hints.push((*addr, name.clone()));
                    }

                    // Responses finish the exchange; queries may still be
                    // answered within the budget.
                    if msg.response || proto != Protocol::Dns {
                        return self.conclude(proto);
                    }
                    self.verdict = Some(proto);
                    return DpiVerdict::InProgress;
                }
            }

            // SSDP over its well-known multicast port.
            if pkt.has_port(1900)
                && (payload.starts_with(b"M-SEARCH") || payload.starts_with(b"NOTIFY")
                    || payload.starts_with(b"HTTP/1.1"))
            {
                let mut info = SsdpInfo::default();
                info.user_agent = http::header_value(payload, b"user-agent")
                    .or_else(|| http::header_value(payload, b"server"));
                self.metadata.ssdp = Some(info);
                return self.conclude(Protocol::Ssdp);
            }

            // QUIC long header.
            if pkt.has_port(443) && payload[0] & 0x80 != 0 && payload.len() >= 5 {
                return self.conclude(Protocol::Quic);
            }

            if pkt.has_port(123) && payload.len() >= 48 {
                return self.conclude(Protocol::Ntp);
            }
        }

        // BitTorrent handshake.
        if payload.len() >= 48 && payload[0] == 19 && payload[1..20] == *b"BitTorrent protocol" {
            let mut info_hash = [0u8; 20];
            info_hash.copy_from_slice(&payload[28..48]);
            self.metadata.bittorrent = Some(BtInfo { info_hash });
            return self.conclude(Protocol::BitTorrent);
        }

        DpiVerdict::InProgress
    }

    fn guess(&self) -> DpiVerdict {
        if let Some(proto) = self.verdict {
            return DpiVerdict::Done { proto, app: 0, guessed: false };
        }
        if !self.soft_dissectors {
            return DpiVerdict::Done { proto: Protocol::Unknown, app: 0, guessed: true };
        }

        let proto = match self.fallback_port {
            21 => Protocol::Ftp,
            22 => Protocol::Ssh,
            23 => Protocol::Telnet,
            25 | 587 => Protocol::Smtp,
            53 => Protocol::Dns,
            67 | 68 => Protocol::Dhcp,
            80 | 8080 => Protocol::Http,
            110 => Protocol::Pop3,
            123 => Protocol::Ntp,
            143 => Protocol::Imap,
            161 | 162 => Protocol::Snmp,
            443 | 993 | 995 => Protocol::Tls,
            514 => Protocol::Syslog,
            1900 => Protocol::Ssdp,
            3478 => Protocol::Stun,
            5353 => Protocol::Mdns,
            5355 => Protocol::Llmnr,
            _ => Protocol::Unknown,
        };

        DpiVerdict::Done { proto, app: 0, guessed: true }
    }

    fn metadata(&self) -> FlowMetadata {
        self.metadata.clone()
    }
}

/// First line of a text protocol banner, trimmed
fn text_line(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(payload.len().min(128));
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

mod tls {
    pub struct Handshake {
        pub version: u16,
        pub cipher_suite: Option<u16>,
        pub sni: Option<String>,
    }

    /// Parse a ClientHello or ServerHello out of the first TLS record.
    pub fn parse_handshake(payload: &[u8]) -> Option<Handshake> {
        // 5-byte record header, then handshake header.
        let hs = payload.get(5..)?;
        let hs_type = *hs.first()?;
        if hs_type != 1 && hs_type != 2 {
            return None;
        }

        let version = u16::from_be_bytes([*hs.get(4)?, *hs.get(5)?]);
        let mut off = 6 + 32; // version + random

        let session_len = *hs.get(off)? as usize;
        off += 1 + session_len;

        if hs_type == 2 {
            // ServerHello: selected cipher follows the session id.
            let cipher = u16::from_be_bytes([*hs.get(off)?, *hs.get(off + 1)?]);
            return Some(Handshake { version, cipher_suite: Some(cipher), sni: None });
        }

        // ClientHello: skip cipher suite and compression lists.
        let ciphers_len = u16::from_be_bytes([*hs.get(off)?, *hs.get(off + 1)?]) as usize;
        off += 2 + ciphers_len;
        let comp_len = *hs.get(off)? as usize;
        off += 1 + comp_len;

        let ext_total = u16::from_be_bytes([*hs.get(off)?, *hs.get(off + 1)?]) as usize;
        off += 2;
        let mut sni = None;

        let ext_end = off + ext_total;
        while off + 4 <= ext_end {
            let ext_type = u16::from_be_bytes([*hs.get(off)?, *hs.get(off + 1)?]);
            let ext_len = u16::from_be_bytes([*hs.get(off + 2)?, *hs.get(off + 3)?]) as usize;
            off += 4;

            if ext_type == 0 && ext_len >= 5 {
                // server_name list: u16 list len, u8 type, u16 name len.
                let name_len =
                    u16::from_be_bytes([*hs.get(off + 3)?, *hs.get(off + 4)?]) as usize;
                let name = hs.get(off + 5..off + 5 + name_len)?;
                sni = std::str::from_utf8(name).ok().map(str::to_owned);
                break;
            }
            off += ext_len;
        }

        Some(Handshake { version, cipher_suite: None, sni })
    }
}

mod http {
    pub struct Request {
        pub path: String,
        pub host: Option<String>,
        pub user_agent: Option<String>,
        pub has_basic_auth: bool,
    }

    const METHODS: [&[u8]; 7] = [
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"CONNECT ",
    ];

    pub fn parse_request(payload: &[u8]) -> Option<Request> {
        METHODS.iter().find(|m| payload.starts_with(m))?;

        let line_end = payload.iter().position(|&b| b == b'\r' || b == b'\n')?;
        let line = std::str::from_utf8(&payload[..line_end]).ok()?;
        let mut parts = line.split(' ');
        let _method = parts.next()?;
        let path = parts.next()?.to_string();
        if !parts.next().is_some_and(|v| v.starts_with("HTTP/")) {
            return None;
        }

        Some(Request {
            path,
            host: header_value(payload, b"host"),
            user_agent: header_value(payload, b"user-agent"),
            has_basic_auth: header_value(payload, b"authorization")
                .is_some_and(|v| v.to_ascii_lowercase().starts_with("basic ")),
        })
    }

    /// Case-insensitive header lookup over a text payload
    pub fn header_value(payload: &[u8], name: &[u8]) -> Option<String> {
        for line in payload.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break; // end of headers
            }
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            if line[..colon].eq_ignore_ascii_case(name) {
                let value = &line[colon + 1..];
                return Some(String::from_utf8_lossy(value).trim().to_string());
            }
        }
        None
    }
}

mod dhcp {
    use super::DhcpInfo;

    /// Walk DHCP options after the magic cookie
    pub fn parse_options(mut options: &[u8]) -> DhcpInfo {
        let mut info = DhcpInfo::default();

        while options.len() >= 2 {
            let code = options[0];
            if code == 255 {
                break; // end option
            }
            if code == 0 {
                options = &options[1..]; // pad
                continue;
            }
            let len = options[1] as usize;
            let Some(value) = options.get(2..2 + len) else {
                break;
            };

            match code {
                55 => {
                    info.fingerprint = Some(
                        value
                            .iter()
                            .map(|b| b.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                }
                60 => {
                    info.class_ident =
                        Some(String::from_utf8_lossy(value).trim_end_matches('\0').to_string());
                }
                _ => {}
            }
            options = &options[2 + len..];
        }

        info
    }
}

mod dns {
    use std::net::IpAddr;

    pub struct Message {
        pub response: bool,
        pub queries: Vec<String>,
        /// (name, address) pairs from A/AAAA answers
        pub answers: Vec<(String, IpAddr)>,
    }

    /// Minimal DNS wire parser: enough for query names and A/AAAA answers.
    pub fn parse(payload: &[u8]) -> Option<Message> {
        if payload.len() < 12 {
            return None;
        }
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
        if qdcount > 32 || ancount > 64 {
            return None;
        }

        let mut msg = Message {
            response: flags & 0x8000 != 0,
            queries: Vec::new(),
            answers: Vec::new(),
        };

        let mut off = 12;
        for _ in 0..qdcount {
            let (name, next) = read_name(payload, off)?;
            msg.queries.push(name);
            off = next + 4; // qtype + qclass
        }

        for _ in 0..ancount {
            let (name, next) = read_name(payload, off)?;
            off = next;
            let rtype = u16::from_be_bytes([*payload.get(off)?, *payload.get(off + 1)?]);
            let rdlen =
                u16::from_be_bytes([*payload.get(off + 8)?, *payload.get(off + 9)?]) as usize;
            off += 10;
            let rdata = payload.get(off..off + rdlen)?;

            match (rtype, rdlen) {
                (1, 4) => {
                    let octets: [u8; 4] = rdata.try_into().ok()?;
                    msg.answers.push((name, IpAddr::from(octets)));
                }
                (28, 16) => {
                    let octets: [u8; 16] = rdata.try_into().ok()?;
                    msg.answers.push((name, IpAddr::from(octets)));
                }
                _ => {}
            }
            off += rdlen;
        }

        Some(msg)
    }

    /// Read a possibly-compressed name; returns (name, offset past it)
    fn read_name(payload: &[u8], mut off: usize) -> Option<(String, usize)> {
        let mut labels = Vec::new();
        let mut jumped = false;
        let mut end = off;
        let mut hops = 0;

        loop {
            let len = *payload.get(off)? as usize;
            if len == 0 {
                if !jumped {
                    end = off + 1;
                }
                break;
            }
            if len & 0xc0 == 0xc0 {
                // Compression pointer; bounded to avoid loops.
                hops += 1;
                if hops > 16 {
                    return None;
                }
                let ptr =
                    (u16::from_be_bytes([(len & 0x3f) as u8, *payload.get(off + 1)?])) as usize;
                if !jumped {
                    end = off + 2;
                    jumped = true;
                }
                off = ptr;
                continue;
            }
            let label = payload.get(off + 1..off + 1 + len)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            off += 1 + len;
            if !jumped {
                end = off + 1;
            }
        }

        Some((labels.join("."), end))
    }
}
