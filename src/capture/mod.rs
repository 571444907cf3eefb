//! Packet capture
//!
//! `PacketSource` is the seam to the capture primitives. Live and offline
//! pcap sources are built in; AF_PACKET v3 and NFQUEUE exist as
//! configuration surface for external implementations. One capture
//! worker thread runs per source instance.

pub mod pcap;
pub mod synthetic;
pub mod worker;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;

use crate::config::InterfaceRole;

pub use worker::{CaptureContext, CaptureWorker};

/// A raw frame as delivered by a capture primitive
pub struct RawFrame {
    /// Packet time in milliseconds
    pub ts_ms: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Offline source exhausted; the worker goes offline normally
    #[error("end of capture")]
    Eof,
    /// Source became unreadable; the worker goes offline and reports
    #[error("fatal capture error: {0}")]
    Fatal(String),
}

/// Statistics reported by the capture primitive itself
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub received: u64,
    /// Dropped by the kernel/ring before we saw them
    pub dropped: u64,
    pub if_dropped: u64,
}

/// Capture primitive interface
pub trait PacketSource: Send {
    /// Next frame; `Ok(None)` on read timeout so callers can observe
    /// termination.
    fn next_packet(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    fn stats(&mut self) -> SourceStats;
}

/// Capture worker lifecycle: `online` once the primitive is ready,
/// `offline` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Init = 0,
    Online = 1,
    Offline = 2,
}

impl CaptureState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::Online,
            2 => CaptureState::Offline,
            _ => CaptureState::Init,
        }
    }
}

/// Shared capture-state cell
#[derive(Debug, Default)]
pub struct CaptureStateCell(AtomicU8);

impl CaptureStateCell {
    pub fn set(&self, state: CaptureState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> CaptureState {
        CaptureState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Per-interface packet statistics, read and reset by the update tick
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub raw: AtomicU64,
    pub bytes: AtomicU64,
    pub dropped_capture: AtomicU64,
    pub dropped_queue: AtomicU64,
    pub malformed: AtomicU64,
    /// New flows created
    pub flows: AtomicU64,
    /// Flows refused because `max_flows` was reached
    pub flows_rejected: AtomicU64,
}

/// Point-in-time copy of `CaptureStats`
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CaptureStatsSnapshot {
    pub raw: u64,
    pub bytes: u64,
    pub dropped_capture: u64,
    pub dropped_queue: u64,
    pub malformed: u64,
    pub flows: u64,
    pub flows_rejected: u64,
}

impl CaptureStats {
    /// Take a snapshot and zero the counters.
    pub fn snapshot_and_reset(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            raw: self.raw.swap(0, Ordering::AcqRel),
            bytes: self.bytes.swap(0, Ordering::AcqRel),
            dropped_capture: self.dropped_capture.swap(0, Ordering::AcqRel),
            dropped_queue: self.dropped_queue.swap(0, Ordering::AcqRel),
            malformed: self.malformed.swap(0, Ordering::AcqRel),
            flows: self.flows.swap(0, Ordering::AcqRel),
            flows_rejected: self.flows_rejected.swap(0, Ordering::AcqRel),
        }
    }
}

impl CaptureStatsSnapshot {
    pub fn merge(&mut self, other: &CaptureStatsSnapshot) {
        self.raw += other.raw;
        self.bytes += other.bytes;
        self.dropped_capture += other.dropped_capture;
        self.dropped_queue += other.dropped_queue;
        self.malformed += other.malformed;
        self.flows += other.flows;
        self.flows_rejected += other.flows_rejected;
    }
}

/// Runtime interface state shared with flows and the status snapshot
#[derive(Debug)]
pub struct InterfaceInfo {
    pub name: String,
    pub role: InterfaceRole,
    /// Current address set, refreshed on each update tick
    addrs: RwLock<Vec<IpAddr>>,
    /// Endpoint snapshot advanced by the tick and broadcast to plugins
    endpoint_snapshot: Mutex<Vec<IpAddr>>,
}

impl InterfaceInfo {
    pub fn new(name: &str, role: InterfaceRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            addrs: RwLock::new(Vec::new()),
            endpoint_snapshot: Mutex::new(Vec::new()),
        }
    }

    pub fn set_addrs(&self, addrs: Vec<IpAddr>) {
        *self.addrs.write() = addrs;
    }

    pub fn addrs(&self) -> Vec<IpAddr> {
        self.addrs.read().clone()
    }

    /// Copy the current address set into the endpoint snapshot
    pub fn next_endpoint_snapshot(&self) {
        *self.endpoint_snapshot.lock() = self.addrs.read().clone();
    }

    pub fn endpoint_snapshot(&self) -> Vec<IpAddr> {
        self.endpoint_snapshot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_state_cell() {
        let cell = CaptureStateCell::default();
        assert_eq!(cell.get(), CaptureState::Init);
        cell.set(CaptureState::Online);
        assert_eq!(cell.get(), CaptureState::Online);
        cell.set(CaptureState::Offline);
        assert_eq!(cell.get(), CaptureState::Offline);
    }

    #[test]
    fn test_stats_snapshot_resets() {
        let stats = CaptureStats::default();
        stats.raw.store(10, Ordering::Relaxed);
        stats.malformed.store(2, Ordering::Relaxed);

        let snap = stats.snapshot_and_reset();
        assert_eq!(snap.raw, 10);
        assert_eq!(snap.malformed, 2);
        assert_eq!(stats.raw.load(Ordering::Relaxed), 0);

        let mut merged = CaptureStatsSnapshot::default();
        merged.merge(&snap);
        merged.merge(&snap);
        assert_eq!(merged.raw, 20);
    }

    #[test]
    fn test_endpoint_snapshot_advances() {
        let iface = InterfaceInfo::new("eth0", InterfaceRole::Lan);
        iface.set_addrs(vec!["192.168.1.1".parse().unwrap()]);
        assert!(iface.endpoint_snapshot().is_empty());
        iface.next_endpoint_snapshot();
        assert_eq!(iface.endpoint_snapshot().len(), 1);
    }
}
