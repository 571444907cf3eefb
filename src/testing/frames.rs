//! Wire-format frame builders

use std::net::{IpAddr, Ipv4Addr};

use etherparse::PacketBuilder;

use crate::core::packet::MacAddr;

pub const MAC_A: MacAddr = [0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa];
pub const MAC_B: MacAddr = [0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb];
pub const MAC_BCAST: MacAddr = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

/// TCP segment shapes used by the builders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpKind {
    Syn,
    SynAck,
    Ack,
    FinAck,
    Rst,
}

fn v4(addr: &str) -> [u8; 4] {
    addr.parse::<Ipv4Addr>().expect("valid IPv4 address").octets()
}

/// Build an Ethernet/IPv4/TCP frame
pub fn tcp(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    kind: TcpKind,
    seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let base = PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(v4(src_ip), v4(dst_ip), 64)
        .tcp(src_port, dst_port, seq, 65535);

    let base = match kind {
        TcpKind::Syn => base.syn(),
        TcpKind::SynAck => base.syn().ack(1),
        TcpKind::Ack => base.ack(1),
        TcpKind::FinAck => base.fin().ack(1),
        TcpKind::Rst => base.rst(),
    };

    let mut frame = Vec::with_capacity(base.size(payload.len()));
    base.write(&mut frame, payload).expect("frame build");
    frame
}

/// Build an Ethernet/IPv4/UDP frame
pub fn udp(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let base = PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(v4(src_ip), v4(dst_ip), 64)
        .udp(src_port, dst_port);

    let mut frame = Vec::with_capacity(base.size(payload.len()));
    base.write(&mut frame, payload).expect("frame build");
    frame
}

/// Build a VLAN-tagged Ethernet/IPv4/UDP frame
pub fn udp_vlan(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    vlan_id: u16,
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let base = PacketBuilder::ethernet2(src_mac, dst_mac)
        .single_vlan(vlan_id)
        .ipv4(v4(src_ip), v4(dst_ip), 64)
        .udp(src_port, dst_port);

    let mut frame = Vec::with_capacity(base.size(payload.len()));
    base.write(&mut frame, payload).expect("frame build");
    frame
}

/// TLS ClientHello record with an SNI extension
pub fn tls_client_hello(sni: &str, version: u16) -> Vec<u8> {
    let sni = sni.as_bytes();

    // server_name extension body: list length, entry type, name length.
    let mut ext_body = Vec::new();
    ext_body.extend_from_slice(&((sni.len() + 3) as u16).to_be_bytes());
    ext_body.push(0); // host_name
    ext_body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(sni);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // type server_name
    extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_body);

    let mut body = Vec::new();
    body.extend_from_slice(&version.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id length
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
    body.extend_from_slice(&0x1301u16.to_be_bytes());
    body.push(1); // compression methods length
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01]; // client hello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// DNS query for an A record
pub fn dns_query(name: &str) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x1234u16.to_be_bytes()); // id
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // rd
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&[0u8; 6]); // an/ns/ar
    write_name(&mut msg, name);
    msg.extend_from_slice(&1u16.to_be_bytes()); // type A
    msg.extend_from_slice(&1u16.to_be_bytes()); // class IN
    msg
}

/// DNS response with a single A or AAAA answer
pub fn dns_response(name: &str, addr: IpAddr) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x1234u16.to_be_bytes());
    msg.extend_from_slice(&0x8180u16.to_be_bytes()); // qr, rd, ra
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&1u16.to_be_bytes()); // ancount
    msg.extend_from_slice(&[0u8; 4]); // ns/ar

    write_name(&mut msg, name);
    let rtype: u16 = match addr {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 28,
    };
    msg.extend_from_slice(&rtype.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());

    msg.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
    msg.extend_from_slice(&rtype.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&300u32.to_be_bytes()); // ttl
    match addr {
        IpAddr::V4(v4) => {
            msg.extend_from_slice(&4u16.to_be_bytes());
            msg.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            msg.extend_from_slice(&16u16.to_be_bytes());
            msg.extend_from_slice(&v6.octets());
        }
    }
    msg
}

fn write_name(msg: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
}

/// DHCP DISCOVER payload (BOOTP header, magic cookie, options)
pub fn dhcp_discover(param_request: &[u8], class_ident: &str) -> Vec<u8> {
    let mut msg = vec![0u8; 236];
    msg[0] = 1; // BOOTREQUEST
    msg[1] = 1; // ethernet
    msg[2] = 6; // hlen
    msg[4..8].copy_from_slice(&0x3903f326u32.to_be_bytes()); // xid

    msg.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]); // magic cookie

    msg.extend_from_slice(&[53, 1, 1]); // message type: DISCOVER
    msg.push(55);
    msg.push(param_request.len() as u8);
    msg.extend_from_slice(param_request);
    msg.push(60);
    msg.push(class_ident.len() as u8);
    msg.extend_from_slice(class_ident.as_bytes());
    msg.push(255);
    msg
}
