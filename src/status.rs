//! Agent status snapshot
//!
//! Built on every update tick and persisted as JSON in the volatile
//! state directory. Key names are part of the external interface and
//! stay stable across versions.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::capture::CaptureStatsSnapshot;

/// Process CPU/memory usage from the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub maxrss_kb: i64,
}

impl ResourceUsage {
    pub fn sample() -> Self {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            return Self::default();
        }

        Self {
            cpu_user: usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0,
            cpu_system: usage.ru_stime.tv_sec as f64
                + usage.ru_stime.tv_usec as f64 / 1_000_000.0,
            maxrss_kb: usage.ru_maxrss,
        }
    }
}

/// Per-interface slice of the snapshot
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub role: String,
    pub state: String,
    pub addrs: Vec<String>,
    pub stats: CaptureStatsSnapshot,
}

/// Signature/category database gauges
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SignatureStatus {
    pub application_categories: usize,
    pub application_members: usize,
    pub protocol_categories: usize,
    pub protocol_members: usize,
}

/// Signature-update client gauges. The HTTP client itself is an external
/// collaborator; errors are counted here and retried on the next tick.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ApiStatus {
    pub enabled: bool,
    pub errors: u64,
    pub last_update: u64,
}

/// The status snapshot written each tick
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub agent_version: String,
    pub timestamp: i64,
    /// Seconds since the instance epoch
    pub uptime: u64,
    pub flow_count: usize,
    pub flows_in_use: usize,
    pub flows_purged: usize,
    pub flows_expiring: usize,
    pub flows_expired: usize,
    pub cpu_cores: usize,
    pub cpu_user: f64,
    pub cpu_user_prev: f64,
    pub cpu_system: f64,
    pub cpu_system_prev: f64,
    pub update_interval: u64,
    pub maxrss_kb: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcm_kb: Option<u64>,
    pub dhc_status: bool,
    pub dhc_size: usize,
    pub agent_uuid: String,
    pub interfaces: BTreeMap<String, InterfaceStatus>,
    /// Global packet statistics accumulated over the agent lifetime
    pub stats: CaptureStatsSnapshot,
    pub signatures: SignatureStatus,
    pub netify_api: ApiStatus,
}

impl AgentStatus {
    pub fn new(update_interval: u64) -> Self {
        Self {
            kind: "agent_status",
            agent_version: crate::AGENT_VERSION.to_string(),
            timestamp: 0,
            uptime: 0,
            flow_count: 0,
            flows_in_use: 0,
            flows_purged: 0,
            flows_expiring: 0,
            flows_expired: 0,
            cpu_cores: num_cpus::get(),
            cpu_user: 0.0,
            cpu_user_prev: 0.0,
            cpu_system: 0.0,
            cpu_system_prev: 0.0,
            update_interval,
            maxrss_kb: 0,
            tcm_kb: None,
            dhc_status: false,
            dhc_size: 0,
            agent_uuid: String::new(),
            interfaces: BTreeMap::new(),
            stats: CaptureStatsSnapshot::default(),
            signatures: SignatureStatus::default(),
            netify_api: ApiStatus::default(),
        }
    }

    /// Roll current usage numbers into `_prev` and sample fresh ones
    pub fn update_usage(&mut self) {
        let usage = ResourceUsage::sample();
        self.cpu_user_prev = self.cpu_user;
        self.cpu_user = usage.cpu_user;
        self.cpu_system_prev = self.cpu_system;
        self.cpu_system = usage.cpu_system;
        self.maxrss_kb = usage.maxrss_kb;
        self.timestamp = Utc::now().timestamp();
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write agent status: {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_sample() {
        let usage = ResourceUsage::sample();
        // The process has used some CPU and has a resident set.
        assert!(usage.cpu_user >= 0.0);
        assert!(usage.maxrss_kb > 0);
    }

    #[test]
    fn test_status_json_keys() {
        let mut status = AgentStatus::new(15);
        status.update_usage();
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["type"], "agent_status");
        assert_eq!(json["update_interval"], 15);
        for key in [
            "agent_version",
            "timestamp",
            "uptime",
            "flow_count",
            "flows_in_use",
            "flows_purged",
            "flows_expiring",
            "flows_expired",
            "cpu_cores",
            "cpu_user",
            "cpu_user_prev",
            "cpu_system",
            "cpu_system_prev",
            "maxrss_kb",
            "dhc_status",
            "dhc_size",
            "interfaces",
            "stats",
            "signatures",
            "netify_api",
        ] {
            assert!(json.get(key).is_some(), "missing status key: {}", key);
        }
        // tcm_kb is optional and absent unless the allocator reports it.
        assert!(json.get("tcm_kb").is_none());
    }

    #[test]
    fn test_status_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let status = AgentStatus::new(15);
        status.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"agent_status\""));
    }
}
