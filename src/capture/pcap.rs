//! libpcap capture sources
//!
//! Live capture with a short read timeout so the worker can observe
//! termination, and offline file replay with optional timestamp pacing.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AgentConfig;

use super::{CaptureError, PacketSource, RawFrame, SourceStats};

fn frame_from(packet: &pcap::Packet) -> RawFrame {
    let ts_ms = packet.header.ts.tv_sec as u64 * 1000 + packet.header.ts.tv_usec as u64 / 1000;
    RawFrame {
        ts_ms,
        data: packet.data.to_vec(),
    }
}

/// Live interface capture
pub struct PcapSource {
    cap: pcap::Capture<pcap::Active>,
    stats: SourceStats,
}

impl PcapSource {
    pub fn open(iface: &str, filter: Option<&str>, config: &AgentConfig) -> Result<Self> {
        let mut cap = pcap::Capture::from_device(iface)
            .with_context(|| format!("Failed to open capture device: {}", iface))?
            .promisc(config.capture.promiscuous)
            .snaplen(config.capture.snaplen as i32)
            .timeout(config.capture.read_timeout_ms as i32)
            .open()
            .with_context(|| format!("Failed to activate capture: {}", iface))?;

        if let Some(filter) = filter {
            cap.filter(filter, true)
                .with_context(|| format!("Failed to apply capture filter: {}", iface))?;
        }

        info!("{}: live capture ready", iface);
        Ok(Self {
            cap,
            stats: SourceStats::default(),
        })
    }
}

impl PacketSource for PcapSource {
    fn next_packet(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                Ok(Some(frame_from(&packet)))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Fatal(e.to_string())),
        }
    }

    fn stats(&mut self) -> SourceStats {
        if let Ok(s) = self.cap.stats() {
            self.stats.dropped = s.dropped as u64;
            self.stats.if_dropped = s.if_dropped as u64;
        }
        self.stats
    }
}

/// Offline pcap replay
pub struct PcapFileSource {
    cap: pcap::Capture<pcap::Offline>,
    replay_delay: bool,
    last_ts_ms: Option<u64>,
    stats: SourceStats,
}

impl PcapFileSource {
    pub fn open<P: AsRef<Path>>(path: P, config: &AgentConfig) -> Result<Self> {
        let cap = pcap::Capture::from_file(&path)
            .with_context(|| format!("Failed to open capture file: {}", path.as_ref().display()))?;

        info!("{}: offline capture ready", path.as_ref().display());
        Ok(Self {
            cap,
            replay_delay: config.capture.replay_delay,
            last_ts_ms: None,
            stats: SourceStats::default(),
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let frame = frame_from(&packet);
                self.stats.received += 1;

                if self.replay_delay {
                    if let Some(last) = self.last_ts_ms {
                        let delta = frame.ts_ms.saturating_sub(last).min(1000);
                        if delta > 0 {
                            std::thread::sleep(Duration::from_millis(delta));
                        }
                    }
                    self.last_ts_ms = Some(frame.ts_ms);
                }

                Ok(Some(frame))
            }
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::Eof),
            Err(e) => Err(CaptureError::Fatal(e.to_string())),
        }
    }

    fn stats(&mut self) -> SourceStats {
        self.stats
    }
}
