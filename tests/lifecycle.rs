//! Flow lifecycle, expiry and supervisor scenarios

mod common;

use std::time::Duration;

use flowmon::capture::synthetic::SyntheticSource;
use flowmon::capture::RawFrame;
use flowmon::config::{CaptureMethod, InterfaceConfig, InterfaceRole};
use flowmon::core::flow::FlowFlags;
use flowmon::plugin::EventKind;
use flowmon::testing::{frames, EventCollector};
use flowmon::Instance;

use common::{now_ms, settle, test_config, wait_for};

fn frame(data: Vec<u8>, ts_ms: u64) -> RawFrame {
    RawFrame { ts_ms, data }
}

// S3: one idle UDP packet; expiring at the first late tick, purged by the
// following one.
#[test]
fn test_idle_udp_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);
    let collector = EventCollector::new();
    instance.plugins.register_processor(collector.clone());

    let ts = now_ms();
    let session = vec![frame(
        frames::udp(frames::MAC_A, frames::MAC_B, "192.168.1.100", 40000, "10.0.0.1", 9999, b"ping"),
        ts,
    )];

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 1);

    // First tick past ttl_idle: marked expiring, final pass queued.
    instance.sweep_flows_at(ts + 30_001);
    if let Some(flow) = instance.flow_map.lookup_any() {
        assert!(flow.is_expiring());
    }
    assert!(instance.detection_quiesce(Duration::from_secs(5)));
    assert!(wait_for(
        || {
            instance
                .flow_map
                .lookup_any()
                .map(|f| f.is_expired())
                .unwrap_or(true)
        },
        Duration::from_secs(5)
    ));

    // Following tick: purged.
    instance.sweep_flows_at(ts + 30_001);
    assert_eq!(instance.flow_map.len(), 0);
    assert_eq!(collector.count(EventKind::FlowExpiring), 1);
    assert_eq!(collector.count(EventKind::FlowExpire), 1);
}

// Lifecycle flags are monotonic: init <= complete <= expiring <= expired.
#[test]
fn test_lifecycle_flag_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);

    let ts = now_ms();
    let hello = frames::tls_client_hello("mono.example.test", 0x0303);
    let session = vec![frame(
        frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            50010,
            "10.0.0.1",
            443,
            frames::TcpKind::Ack,
            1,
            &hello,
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
    let ordered = |f: &flowmon::core::flow::FlowRecord| {
        let init = FlowFlags::get(&f.flags.detection_init) as u8;
        let complete = FlowFlags::get(&f.flags.detection_complete) as u8;
        let expiring = FlowFlags::get(&f.flags.expiring) as u8;
        let expired = FlowFlags::get(&f.flags.expired) as u8;
        init >= complete && complete >= expiring && expiring >= expired
    };

    assert!(wait_for(|| flow.is_detection_complete(), Duration::from_secs(5)));
    assert!(ordered(&flow));

    instance.expire_flow(&flow);
    assert!(instance.detection_quiesce(Duration::from_secs(5)));
    assert!(flow.is_expiring() && flow.is_expired());
    assert!(FlowFlags::get(&flow.flags.detection_init));
    assert!(flow.is_detection_complete());
}

// Terminate with auto flow expiry: every completed flow gets exactly one
// flow_expire event.
#[test]
fn test_terminate_expires_all_flows() {
    let dir = tempfile::tempdir().unwrap();
    let instance = Instance::new(test_config(dir.path()), None);
    let collector = EventCollector::new();
    instance.plugins.register_processor(collector.clone());

    let ts = now_ms();
    let mut session = Vec::new();
    for i in 0..5u16 {
        let hello = frames::tls_client_hello(&format!("host{}.example.test", i), 0x0303);
        session.push(frame(
            frames::tcp(
                frames::MAC_A,
                frames::MAC_B,
                "192.168.1.100",
                51000 + i,
                "10.0.0.1",
                443,
                frames::TcpKind::Ack,
                1,
                &hello,
            ),
            ts + i as u64,
        ));
    }

    instance.add_capture_with_source(
        "test0",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(session)),
    );
    settle(&instance, 5);
    assert!(wait_for(
        || {
            (0..instance.flow_map.num_buckets()).all(|b| {
                instance
                    .flow_map
                    .bucket(b)
                    .values()
                    .all(|f| f.is_detection_complete())
            })
        },
        Duration::from_secs(5)
    ));

    let digests: Vec<_> = (0..instance.flow_map.num_buckets())
        .flat_map(|b| instance.flow_map.bucket(b).keys().copied().collect::<Vec<_>>())
        .collect();
    assert_eq!(digests.len(), 5);

    instance.shutdown();

    assert_eq!(instance.flow_map.len(), 0);
    assert_eq!(collector.count(EventKind::FlowExpire), 5);
    for digest in digests {
        let kinds = collector.kinds_for(&digest);
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::FlowExpire).count(),
            1,
            "exactly one flow_expire per flow"
        );
    }
}

// S6: reload with an interface removed stops only that interface.
#[test]
fn test_reload_removes_interface() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let instance = Instance::new(config.clone(), None);

    let ts = now_ms();
    let flow_a = frames::udp(frames::MAC_A, frames::MAC_B, "192.168.1.100", 40001, "10.0.0.1", 9999, b"a");
    let flow_b = frames::udp(frames::MAC_A, frames::MAC_B, "192.168.1.101", 40002, "10.0.0.2", 9999, b"b");

    instance.add_capture_with_source(
        "ifA",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(vec![frame(flow_a, ts)]).keep_open()),
    );
    instance.add_capture_with_source(
        "ifB",
        InterfaceRole::Lan,
        Box::new(SyntheticSource::new(vec![frame(flow_b, ts)]).keep_open()),
    );
    settle(&instance, 2);
    assert_eq!(instance.capture_names(), vec!["ifA", "ifB"]);

    // New configuration keeps only ifA, with an identical entry.
    let mut new_config = config;
    new_config.interfaces.insert(
        "ifA".to_string(),
        InterfaceConfig {
            role: InterfaceRole::Lan,
            method: CaptureMethod::Pcap,
            pcap_file: None,
            tpv3: None,
            nfqueue: None,
            filter: None,
            addresses: Vec::new(),
            local_networks: Vec::new(),
        },
    );
    instance.apply_config(new_config);

    assert_eq!(instance.capture_names(), vec!["ifA"]);
    // ifA's in-flight flow is untouched.
    assert_eq!(instance.flow_map.len(), 2);
    let still_there = instance.flow_map.lookup_any().unwrap();
    assert!(!still_there.is_expired());
}
