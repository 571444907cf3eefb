//! Shared helpers for the integration suites

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flowmon::config::CacheSave;
use flowmon::AgentConfig;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Agent configuration rooted in a temporary directory
pub fn test_config(dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.general.path_state_persistent = dir.join("persistent");
    config.general.path_state_volatile = dir.join("volatile");
    config.general.run_without_sources = true;
    config.fhc.save = CacheSave::Volatile;
    config.dhc.save = CacheSave::Volatile;
    config.detection.cores = 2;

    std::fs::create_dir_all(&config.general.path_state_persistent).unwrap();
    std::fs::create_dir_all(&config.general.path_state_volatile).unwrap();
    config
}

/// Poll until `cond` holds or the timeout elapses
pub fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Wait until the flow map holds `n` flows and detection queues drained
pub fn settle(instance: &Arc<flowmon::Instance>, flows: usize) {
    assert!(
        wait_for(|| instance.flow_map.len() >= flows, Duration::from_secs(5)),
        "flow map never reached {} flow(s)",
        flows
    );
    assert!(
        instance.detection_quiesce(Duration::from_secs(5)),
        "detection queues never drained"
    );
}
