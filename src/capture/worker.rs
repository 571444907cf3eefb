//! Capture worker
//!
//! One thread per capture source instance. For each frame: parse L2-L4,
//! apply privacy redaction, compute the flow digest, look up or insert
//! in the flow map, consult the hint caches for new flows, and hand the
//! packet to the flow's sticky detection worker. The worker never blocks
//! on detection beyond the enqueue attempt.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::addr::{derive_lower_map, AddressClassifier, LowerMap, PrivacyFilter};
use crate::config::AgentConfig;
use crate::core::flow::{primary_digest, FlowFlags, FlowRecord, PRIVATE_LOWER, PRIVATE_UPPER};
use crate::core::packet::{PacketError, PacketMeta};
use crate::detection::{DetectionHandle, DetectionTask};
use crate::flow::{DnsHintCache, FlowHashCache, FlowMap};

use super::{
    CaptureError, CaptureState, CaptureStateCell, CaptureStats, InterfaceInfo, PacketSource,
};

/// Everything a capture worker needs, shared with the instance
pub struct CaptureContext {
    pub config: Arc<AgentConfig>,
    pub iface: Arc<InterfaceInfo>,
    pub flow_map: Arc<FlowMap>,
    pub fhc: Option<Arc<FlowHashCache>>,
    pub dhc: Option<Arc<DnsHintCache>>,
    pub classifier: Arc<RwLock<AddressClassifier>>,
    pub privacy: Arc<PrivacyFilter>,
    pub detection: Arc<Vec<DetectionHandle>>,
    pub stats: Arc<CaptureStats>,
    /// Total flows in the map, maintained here and by the purge sweep
    pub flow_count: Arc<AtomicUsize>,
}

/// A running capture worker
pub struct CaptureWorker {
    pub iface_name: String,
    pub state: Arc<CaptureStateCell>,
    pub stats: Arc<CaptureStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Spawn a worker around an opened source.
    pub fn spawn(ctx: Arc<CaptureContext>, source: Box<dyn PacketSource>) -> Self {
        let state = Arc::new(CaptureStateCell::default());
        let stop = Arc::new(AtomicBool::new(false));
        let iface_name = ctx.iface.name.clone();

        let thread_state = state.clone();
        let thread_stop = stop.clone();
        let stats = ctx.stats.clone();
        let thread = std::thread::Builder::new()
            .name(format!("cap-{}", iface_name))
            .spawn(move || run(ctx, source, thread_state, thread_stop))
            .expect("spawn capture worker");

        Self {
            iface_name,
            state,
            stats,
            stop,
            thread: Some(thread),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.get() != CaptureState::Offline
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run(
    ctx: Arc<CaptureContext>,
    mut source: Box<dyn PacketSource>,
    state: Arc<CaptureStateCell>,
    stop: Arc<AtomicBool>,
) {
    state.set(CaptureState::Online);
    info!("{}: capture online", ctx.iface.name);

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        match source.next_packet() {
            Ok(Some(frame)) => process_frame(&ctx, frame.ts_ms, &frame.data),
            Ok(None) => {
                // Read timeout; refresh kernel drop counters while idle.
                let source_stats = source.stats();
                ctx.stats
                    .dropped_capture
                    .store(source_stats.dropped + source_stats.if_dropped, Ordering::Relaxed);
            }
            Err(CaptureError::Eof) => {
                info!("{}: capture source exhausted", ctx.iface.name);
                break;
            }
            Err(CaptureError::Fatal(e)) => {
                warn!("{}: capture failure: {}", ctx.iface.name, e);
                break;
            }
        }
    }

    let source_stats = source.stats();
    ctx.stats
        .dropped_capture
        .store(source_stats.dropped + source_stats.if_dropped, Ordering::Relaxed);

    state.set(CaptureState::Offline);
    info!("{}: capture offline", ctx.iface.name);
}

fn process_frame(ctx: &CaptureContext, ts_ms: u64, data: &[u8]) {
    ctx.stats.raw.fetch_add(1, Ordering::Relaxed);
    ctx.stats.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

    let pkt = match PacketMeta::parse(data, ts_ms) {
        Ok(pkt) => pkt,
        Err(PacketError::NoIp) => return,
        Err(PacketError::Malformed(e)) => {
            trace!("{}: malformed packet: {}", ctx.iface.name, e);
            ctx.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let digest = primary_digest(&ctx.iface.name, &pkt);

    // One bucket lock covers the lookup-or-insert window.
    let mut bucket = ctx.flow_map.bucket_for(&digest);

    if let Some(flow) = bucket.get(&digest).cloned() {
        drop(bucket);

        flow.update_from_packet(&pkt);

        let budget = ctx.config.detection.max_detection_pkts;
        if !flow.is_expired()
            && flow.stats.detection_packets.load(Ordering::Relaxed) < budget
        {
            dispatch(ctx, &flow, Some(pkt));
        }
        return;
    }

    let max_flows = ctx.config.flow.max_flows;
    if max_flows > 0 && ctx.flow_count.load(Ordering::Acquire) >= max_flows {
        drop(bucket);
        ctx.stats.flows_rejected.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let flow = new_flow(ctx, &pkt, digest);
    let flow = Arc::new(flow);
    bucket.insert(digest, flow.clone());
    drop(bucket);

    ctx.flow_count.fetch_add(1, Ordering::AcqRel);
    ctx.stats.flows.fetch_add(1, Ordering::Relaxed);

    // First packet goes to the sticky worker even on an FHC hit, so the
    // lifecycle events still fire from one place.
    dispatch(ctx, &flow, Some(pkt));
}

/// Build and classify a new flow record
fn new_flow(ctx: &CaptureContext, pkt: &PacketMeta, digest: crate::FlowDigest) -> FlowRecord {
    let interval = ctx.config.general.update_interval as usize;
    let mut flow = FlowRecord::new(ctx.iface.clone(), pkt, digest, interval);

    {
        let classifier = ctx.classifier.read();
        flow.lower_type = classifier.classify(&flow.lower_addr);
        flow.upper_type = classifier.classify(&flow.upper_addr);
    }
    let (lower_map, other_type) =
        derive_lower_map(flow.ip_version, flow.lower_type, flow.upper_type);
    flow.lower_map = lower_map;
    flow.other_type = other_type;

    if !ctx.privacy.is_empty() {
        if ctx.privacy.matches(&flow.lower_mac, &flow.lower_addr) {
            flow.privacy_mask |= PRIVATE_LOWER;
        }
        if ctx.privacy.matches(&flow.upper_mac, &flow.upper_addr) {
            flow.privacy_mask |= PRIVATE_UPPER;
        }
    }

    // Hostname hint from past DNS traffic to the remote endpoint.
    if let Some(dhc) = &ctx.dhc {
        let other = match flow.lower_map {
            LowerMap::Local => flow.upper_addr,
            _ => flow.lower_addr,
        };
        if let Some(hostname) = dhc.lookup_addr(&other) {
            flow.detection.get_mut().dns_host_name = hostname;
            FlowFlags::set(&flow.flags.dhc_hit);
        }
    }

    // A flow-hash cache hit short-circuits DPI entirely.
    if let Some(fhc) = &ctx.fhc {
        if let Some(mdata) = fhc.pop(&digest) {
            *flow.mdata_digest.lock() = Some(mdata);
            FlowFlags::set(&flow.flags.fhc_hit);
        }
    }

    let workers = ctx.detection.len();
    let worker = digest[0] as usize % workers;
    flow.dpi_thread_id
        .store(worker as i16, Ordering::Release);

    debug!("{}: new flow {:?}", ctx.iface.name, flow);
    flow
}

fn dispatch(ctx: &CaptureContext, flow: &Arc<FlowRecord>, packet: Option<PacketMeta>) {
    let worker = flow.dpi_thread_id.load(Ordering::Acquire);
    if worker < 0 {
        return;
    }
    let Some(handle) = ctx.detection.get(worker as usize) else {
        return;
    };

    if !handle.dispatch(DetectionTask { flow: flow.clone(), packet }) {
        ctx.stats.dropped_queue.fetch_add(1, Ordering::Relaxed);
    }
}
