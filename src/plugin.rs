//! Plugin event bus
//!
//! Consumer-facing events with stable names. Base plugins receive agent
//! lifecycle events; processor plugins receive the flow and statistics
//! stream. Broadcasts are synchronous and serialized: within one update
//! tick, `update_init` precedes all statistics events, which precede
//! `update_complete`.
//!
//! Plugins receive flows as shared references and must not store them
//! past a flow lifecycle event.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::capture::{CaptureStatsSnapshot, InterfaceInfo};
use crate::core::flow::FlowRecord;
use crate::flow::FlowMap;
use crate::status::AgentStatus;

/// Stable event names as seen by plugin consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StatusUpdate,
    Reload,
    Interfaces,
    UpdateInit,
    UpdateComplete,
    PktCaptureStats,
    PktGlobalStats,
    FlowMap,
    FlowNew,
    FlowDpiUpdate,
    FlowDpiComplete,
    FlowExpiring,
    FlowExpire,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusUpdate => "status_update",
            EventKind::Reload => "reload",
            EventKind::Interfaces => "interfaces",
            EventKind::UpdateInit => "update_init",
            EventKind::UpdateComplete => "update_complete",
            EventKind::PktCaptureStats => "pkt_capture_stats",
            EventKind::PktGlobalStats => "pkt_global_stats",
            EventKind::FlowMap => "flow_map",
            EventKind::FlowNew => "flow_new",
            EventKind::FlowDpiUpdate => "flow_dpi_update",
            EventKind::FlowDpiComplete => "flow_dpi_complete",
            EventKind::FlowExpiring => "flow_expiring",
            EventKind::FlowExpire => "flow_expire",
        }
    }
}

/// Agent lifecycle consumer
pub trait BasePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_status_update(&self, _status: &AgentStatus) {}
    fn on_reload(&self) {}
}

/// Flow and statistics stream consumer
pub trait ProcessorPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_update_init(&self, _status: &AgentStatus) {}
    fn on_interfaces(&self, _ifaces: &[Arc<InterfaceInfo>]) {}
    fn on_capture_stats(&self, _iface: &str, _stats: &CaptureStatsSnapshot) {}
    fn on_global_stats(&self, _stats: &CaptureStatsSnapshot) {}
    fn on_flow_map(&self, _map: &Arc<FlowMap>) {}
    fn on_update_complete(&self) {}

    fn on_flow_new(&self, _flow: &Arc<FlowRecord>) {}
    fn on_flow_dpi_update(&self, _flow: &Arc<FlowRecord>) {}
    fn on_flow_dpi_complete(&self, _flow: &Arc<FlowRecord>) {}
    fn on_flow_expiring(&self, _flow: &Arc<FlowRecord>) {}
    fn on_flow_expire(&self, _flow: &Arc<FlowRecord>) {}
}

/// Registered plugin set
#[derive(Default)]
pub struct PluginRegistry {
    base: RwLock<Vec<Arc<dyn BasePlugin>>>,
    processors: RwLock<Vec<Arc<dyn ProcessorPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_base(&self, plugin: Arc<dyn BasePlugin>) {
        debug!("Registered base plugin: {}", plugin.name());
        self.base.write().push(plugin);
    }

    pub fn register_processor(&self, plugin: Arc<dyn ProcessorPlugin>) {
        debug!("Registered processor plugin: {}", plugin.name());
        self.processors.write().push(plugin);
    }

    pub fn broadcast_status_update(&self, status: &AgentStatus) {
        for p in self.base.read().iter() {
            p.on_status_update(status);
        }
    }

    pub fn broadcast_reload(&self) {
        for p in self.base.read().iter() {
            p.on_reload();
        }
    }

    pub fn broadcast_update_init(&self, status: &AgentStatus) {
        for p in self.processors.read().iter() {
            p.on_update_init(status);
        }
    }

    pub fn broadcast_interfaces(&self, ifaces: &[Arc<InterfaceInfo>]) {
        for p in self.processors.read().iter() {
            p.on_interfaces(ifaces);
        }
    }

    pub fn broadcast_capture_stats(&self, iface: &str, stats: &CaptureStatsSnapshot) {
        for p in self.processors.read().iter() {
            p.on_capture_stats(iface, stats);
        }
    }

    pub fn broadcast_global_stats(&self, stats: &CaptureStatsSnapshot) {
        for p in self.processors.read().iter() {
            p.on_global_stats(stats);
        }
    }

    pub fn broadcast_flow_map(&self, map: &Arc<FlowMap>) {
        for p in self.processors.read().iter() {
            p.on_flow_map(map);
        }
    }

    pub fn broadcast_update_complete(&self) {
        for p in self.processors.read().iter() {
            p.on_update_complete();
        }
    }

    pub fn broadcast_flow_event(&self, kind: EventKind, flow: &Arc<FlowRecord>) {
        for p in self.processors.read().iter() {
            match kind {
                EventKind::FlowNew => p.on_flow_new(flow),
                EventKind::FlowDpiUpdate => p.on_flow_dpi_update(flow),
                EventKind::FlowDpiComplete => p.on_flow_dpi_complete(flow),
                EventKind::FlowExpiring => p.on_flow_expiring(flow),
                EventKind::FlowExpire => p.on_flow_expire(flow),
                _ => {}
            }
        }
    }
}

/// Processor plugin that logs the flow stream at debug level
pub struct LogSink;

impl ProcessorPlugin for LogSink {
    fn name(&self) -> &str {
        "log-sink"
    }

    fn on_flow_new(&self, flow: &Arc<FlowRecord>) {
        debug!("flow_new: {:?}", flow);
    }

    fn on_flow_dpi_complete(&self, flow: &Arc<FlowRecord>) {
        let detection = flow.detection.read();
        debug!(
            "flow_dpi_complete: {:?} -> {}{}",
            flow,
            detection.protocol_name,
            if detection.application_name.is_empty() {
                String::new()
            } else {
                format!(".{}", detection.application_name)
            }
        );
    }

    fn on_flow_expire(&self, flow: &Arc<FlowRecord>) {
        debug!("flow_expire: {:?}", flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(EventKind::StatusUpdate.as_str(), "status_update");
        assert_eq!(EventKind::PktCaptureStats.as_str(), "pkt_capture_stats");
        assert_eq!(EventKind::FlowDpiComplete.as_str(), "flow_dpi_complete");
        assert_eq!(EventKind::FlowExpiring.as_str(), "flow_expiring");
        assert_eq!(EventKind::FlowExpire.as_str(), "flow_expire");
    }
}
