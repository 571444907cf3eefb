//! End-to-end pipeline scenarios: capture through detection to events

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use flowmon::capture::synthetic::SyntheticSource;
use flowmon::capture::RawFrame;
use flowmon::config::InterfaceRole;
use flowmon::core::flow::FlowFlags;
use flowmon::dpi::Protocol;
use flowmon::plugin::EventKind;
use flowmon::testing::{frames, EventCollector};
use flowmon::Instance;

use common::{now_ms, settle, test_config, wait_for};

const CLIENT: &str = "192.168.1.100";
const SERVER: &str = "10.0.0.1";

fn frame(data: Vec<u8>, ts_ms: u64) -> RawFrame {
    RawFrame { ts_ms, data }
}

/// Three-way handshake, one HTTP request/response, FIN close
fn http_session(ts: u64) -> Vec<RawFrame> {
    let c2s = |kind, seq, payload: &[u8]| {
        frames::tcp(frames::MAC_A, frames::MAC_B, CLIENT, 50000, SERVER, 80, kind, seq, payload)
    };
    let s2c = |kind, seq, payload: &[u8]| {
        frames::tcp(frames::MAC_B, frames::MAC_A, SERVER, 80, CLIENT, 50000, kind, seq, payload)
    };

    let request = b"GET /index.html HTTP/1.1\r\nHost: example.test\r\nUser-Agent: flowmon-test\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    vec![
        frame(c2s(frames::TcpKind::Syn, 100, &[]), ts),
        frame(s2c(frames::TcpKind::SynAck, 700, &[]), ts + 1),
        frame(c2s(frames::TcpKind::Ack, 101, &[]), ts + 2),
        frame(c2s(frames::TcpKind::Ack, 101, request), ts + 3),
        frame(s2c(frames::TcpKind::Ack, 701, response), ts + 4),
        frame(c2s(frames::TcpKind::Ack, 180, &[]), ts + 5),
        frame(c2s(frames::TcpKind::FinAck, 180, &[]), ts + 6),
        frame(s2c(frames::TcpKind::FinAck, 760, &[]), ts + 7),
        frame(c2s(frames::TcpKind::Ack, 181, &[]), ts + 8),
    ]
}

// S1: one TCP flow end to end, with byte accounting and event order.
#[test]
fn test_single_tcp_flow_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);
    let collector = EventCollector::new();
    instance.plugins.register_processor(collector.clone());

    let ts = now_ms();
    let session = http_session(ts);
    let expected_packets = session.len() as u64;
    let client_bytes: u64 = session
        .iter()
        .enumerate()
        .filter(|(i, _)| ![1usize, 4, 7].contains(i))
        .map(|(_, f)| f.data.len() as u64)
        .sum();
    let server_bytes: u64 = session
        .iter()
        .enumerate()
        .filter(|(i, _)| [1usize, 4, 7].contains(i))
        .map(|(_, f)| f.data.len() as u64)
        .sum();

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);
    assert!(wait_for(
        || {
            instance
                .flow_map
                .lookup_any()
                .map(|f| f.stats.total_packets() == expected_packets)
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    let flow = instance.flow_map.lookup_any().expect("one flow");
    let digest = flow.digest;

    assert!(flow.is_detection_complete());
    assert_eq!(flow.detection.read().protocol, Protocol::Http);
    assert!(FlowFlags::get(&flow.flags.tcp_fin_ack));

    // Direction split: 10.0.0.1 sorts lower than 192.168.1.100.
    assert_eq!(flow.stats.lower_bytes.load(Ordering::Relaxed), server_bytes);
    assert_eq!(flow.stats.upper_bytes.load(Ordering::Relaxed), client_bytes);
    assert_eq!(flow.stats.total_packets(), expected_packets);

    // FIN handshake completed, so the short idle timer applies.
    drop(flow);
    instance.sweep_flows_at(ts + 8 + 31_000);
    assert!(instance.detection_quiesce(Duration::from_secs(5)));
    instance.sweep_flows_at(ts + 8 + 31_000);

    assert_eq!(instance.flow_map.len(), 0);
    assert_eq!(
        collector.kinds_for(&digest),
        vec![
            EventKind::FlowNew,
            EventKind::FlowDpiComplete,
            EventKind::FlowExpiring,
            EventKind::FlowExpire,
        ]
    );
}

// S2: DHCP broadcasts from two clients produce two distinct flows.
#[test]
fn test_dhcp_broadcast_two_clients() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);

    let ts = now_ms();
    let discover = frames::dhcp_discover(&[1, 3, 6], "client");
    let session = vec![
        frame(
            frames::udp(frames::MAC_A, frames::MAC_BCAST, "0.0.0.0", 68, "255.255.255.255", 67, &discover),
            ts,
        ),
        frame(
            frames::udp(frames::MAC_B, frames::MAC_BCAST, "0.0.0.0", 68, "255.255.255.255", 67, &discover),
            ts + 1,
        ),
    ];

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 2);

    assert_eq!(instance.flow_map.len(), 2);
}

// S4: replaying the same traffic after expiry short-circuits DPI.
#[test]
fn test_fhc_short_circuit_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);
    let collector = EventCollector::new();
    instance.plugins.register_processor(collector.clone());

    let ts = now_ms();
    let hello = frames::tls_client_hello("secure.example.test", 0x0303);
    let session: Vec<RawFrame> = vec![frame(
        frames::tcp(frames::MAC_A, frames::MAC_B, CLIENT, 50001, SERVER, 443, frames::TcpKind::Ack, 5, &hello),
        ts,
    )];
    let replay: Vec<RawFrame> = vec![frame(
        frames::tcp(frames::MAC_A, frames::MAC_B, CLIENT, 50001, SERVER, 443, frames::TcpKind::Ack, 5, &hello),
        ts + 1000,
    )];

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);

    let first = instance.flow_map.lookup_any().unwrap();
    assert!(first.is_detection_complete());
    assert!(!FlowFlags::get(&first.flags.fhc_hit));
    assert!(first.stats.detection_packets.load(Ordering::Relaxed) > 0);
    let digest = first.digest;
    drop(first);

    // Expire and purge; TCP without a close falls under the long timer.
    instance.sweep_flows_at(ts + 301_000);
    assert!(instance.detection_quiesce(Duration::from_secs(5)));
    instance.sweep_flows_at(ts + 301_000);
    assert_eq!(instance.flow_map.len(), 0);
    collector.clear();

    // Same tuple on the same interface name, so the digests match.
    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(replay)),
    );
    assert!(wait_for(|| instance.flow_map.len() >= 1, Duration::from_secs(5)));
    assert!(instance.detection_quiesce(Duration::from_secs(5)));

    let replayed = instance.flow_map.lookup_any().unwrap();
    assert_eq!(replayed.digest, digest);
    assert!(FlowFlags::get(&replayed.flags.fhc_hit));
    assert!(replayed.is_detection_complete());
    assert_eq!(replayed.stats.detection_packets.load(Ordering::Relaxed), 0);
    assert_eq!(
        collector.kinds_for(&replayed.digest),
        vec![EventKind::FlowNew, EventKind::FlowDpiComplete]
    );
}

// S5: a DNS hint inserted beforehand lands on the next flow to that address.
#[test]
fn test_dhc_hint_sets_hostname() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);
    let collector = EventCollector::new();
    instance.plugins.register_processor(collector.clone());

    instance
        .dhc
        .as_ref()
        .expect("dhc enabled")
        .insert_addr(&"203.0.113.9".parse().unwrap(), "example.test");

    let ts = now_ms();
    let session = vec![frame(
        frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            CLIENT,
            50002,
            "203.0.113.9",
            443,
            frames::TcpKind::Syn,
            1,
            &[],
        ),
        ts,
    )];

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);

    let flow = instance.flow_map.lookup_any().unwrap();
    assert!(FlowFlags::get(&flow.flags.dhc_hit));
    assert_eq!(flow.detection.read().dns_host_name, "example.test");

    // The hint was already present on the flow_new event.
    let events = collector.events();
    let flow_new = events
        .iter()
        .find(|e| e.kind == EventKind::FlowNew)
        .expect("flow_new emitted");
    assert_eq!(flow_new.dns_host_name, "example.test");
}

// Detection budget: an unclassifiable flow completes as guessed within
// the packet budget.
#[test]
fn test_detection_budget_forces_guess() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.detection.max_detection_pkts = 8;
    let instance = Instance::new(config, None);

    let ts = now_ms();
    let noise = [0x5au8; 64];
    let session: Vec<RawFrame> = (0..20u32)
        .map(|i| {
            frame(
                frames::tcp(
                    frames::MAC_A,
                    frames::MAC_B,
                    CLIENT,
                    50003,
                    SERVER,
                    12000,
                    frames::TcpKind::Ack,
                    100 + i,
                    &noise,
                ),
                ts + i as u64,
            )
        })
        .collect();

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);
    assert!(wait_for(
        || {
            instance
                .flow_map
                .lookup_any()
                .map(|f| f.is_detection_complete())
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    let flow = instance.flow_map.lookup_any().unwrap();
    assert!(FlowFlags::get(&flow.flags.detection_guessed));
    assert!(flow.stats.detection_packets.load(Ordering::Relaxed) <= 8);
    assert_eq!(flow.detection.read().protocol, Protocol::Unknown);
}

// DNS answers observed on one flow hint later flows via the DHC.
#[test]
fn test_dns_answers_feed_dhc() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);

    let ts = now_ms();
    let response = frames::dns_response("cdn.example.test", "198.51.100.20".parse().unwrap());
    let session = vec![frame(
        frames::udp(frames::MAC_B, frames::MAC_A, SERVER, 53, CLIENT, 40000, &response),
        ts,
    )];

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);
    assert!(wait_for(
        || {
            instance
                .flow_map
                .lookup_any()
                .map(|f| f.is_detection_complete())
                .unwrap_or(false)
        },
        Duration::from_secs(5)
    ));

    let dhc = instance.dhc.as_ref().unwrap();
    assert_eq!(
        dhc.lookup_addr(&"198.51.100.20".parse().unwrap()),
        Some("cdn.example.test".to_string())
    );
}
