//! Detection worker pool
//!
//! A fixed pool of workers, each owning a byte-bounded input queue and a
//! per-flow DPI state cache. All packets of a flow reach the same worker
//! (stickiness by `digest[0] % workers`), so per-flow engine state needs
//! no further synchronization. Queues drop on overflow; they never block
//! capture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace};

use crate::category::{Categories, CatType};
use crate::config::VerbosityConfig;
use crate::core::flow::{FlowDetection, FlowFlags, FlowRecord};
use crate::core::packet::PacketMeta;
use crate::dpi::{DpiEngine, DpiVerdict, FlowDissector, FlowMetadata, Protocol};
use crate::flow::{DnsHintCache, FlowHashCache};
use crate::plugin::{EventKind, PluginRegistry};
use crate::FlowDigest;

/// Fixed overhead charged per queued task on top of the payload
const TASK_COST_BASE: usize = 256;

/// Work item for a detection worker. A task without a packet is the
/// final tick for an expiring flow.
pub struct DetectionTask {
    pub flow: Arc<FlowRecord>,
    pub packet: Option<PacketMeta>,
}

impl DetectionTask {
    fn cost(&self) -> usize {
        TASK_COST_BASE + self.packet.as_ref().map_or(0, |p| p.payload.len())
    }
}

/// Shared state the workers classify against
pub struct DetectionDeps {
    pub engine: Arc<dyn DpiEngine>,
    pub fhc: Option<Arc<FlowHashCache>>,
    pub dhc: Option<Arc<DnsHintCache>>,
    pub categories: Arc<Categories>,
    pub plugins: Arc<PluginRegistry>,
    pub verbosity: VerbosityConfig,
    pub max_detection_pkts: u32,
}

/// Sender side of one worker's queue
#[derive(Clone)]
pub struct DetectionHandle {
    pub id: usize,
    tx: Sender<DetectionTask>,
    queued_bytes: Arc<AtomicUsize>,
    max_queue_bytes: usize,
    queue_dropped: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
}

impl DetectionHandle {
    /// Enqueue a task unless the byte cap would be exceeded. Never
    /// blocks; a refused task counts toward `queue_dropped`.
    pub fn dispatch(&self, task: DetectionTask) -> bool {
        let cost = task.cost();
        if self.queued_bytes.load(Ordering::Acquire) + cost > self.max_queue_bytes {
            self.queue_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.queued_bytes.fetch_add(cost, Ordering::AcqRel);
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(task).is_err() {
            self.queued_bytes.fetch_sub(cost, Ordering::AcqRel);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Tasks enqueued but not yet fully processed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn queue_dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }
}

/// The worker pool: handles for dispatch plus the joinable threads
pub struct DetectionPool {
    pub handles: Vec<DetectionHandle>,
    threads: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
}

impl DetectionPool {
    /// Spawn `workers` detection threads.
    pub fn spawn(workers: usize, max_queue_kb: usize, deps: Arc<DetectionDeps>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let force = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = crossbeam_channel::unbounded();
            let queued_bytes = Arc::new(AtomicUsize::new(0));
            let queue_dropped = Arc::new(AtomicU64::new(0));
            let pending = Arc::new(AtomicUsize::new(0));

            handles.push(DetectionHandle {
                id,
                tx,
                queued_bytes: queued_bytes.clone(),
                max_queue_bytes: max_queue_kb * 1024,
                queue_dropped,
                pending: pending.clone(),
            });

            let worker = DetectionWorker {
                id,
                rx,
                queued_bytes,
                pending,
                stop: stop.clone(),
                force: force.clone(),
                deps: deps.clone(),
                states: HashMap::new(),
            };

            threads.push(
                std::thread::Builder::new()
                    .name(format!("dpi{}", id))
                    .spawn(move || worker.run())
                    .expect("spawn detection worker"),
            );
        }

        info!("Created {} detection worker(s)", workers);
        Self { handles, threads, stop, force }
    }

    /// Sticky worker for a digest
    pub fn handle_for(&self, digest: &FlowDigest) -> &DetectionHandle {
        &self.handles[digest[0] as usize % self.handles.len()]
    }

    /// Stop the pool. Queues drain first unless `force` is set.
    pub fn shutdown(mut self, force: bool) {
        self.force.store(force, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        // Close the channels so drained workers observe disconnect.
        for handle in &mut self.handles {
            let (tx, _) = crossbeam_channel::unbounded();
            handle.tx = tx;
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

    /// Wait until all queues are empty; used by tests and terminate.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.handles.iter().any(|h| h.pending() > 0) {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

struct DetectionWorker {
    id: usize,
    rx: Receiver<DetectionTask>,
    queued_bytes: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
    deps: Arc<DetectionDeps>,
    states: HashMap<FlowDigest, Box<dyn FlowDissector>>,
}

impl DetectionWorker {
    fn run(mut self) {
        debug!("dpi{}: online", self.id);

        loop {
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(task) => {
                    let cost = task.cost();
                    if !self.force.load(Ordering::Acquire) {
                        self.process(task);
                    }
                    self.queued_bytes.fetch_sub(cost, Ordering::AcqRel);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Acquire) && self.rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.force.load(Ordering::Acquire) && self.rx.is_empty() {
                break;
            }
        }

        debug!("dpi{}: offline ({} flow states)", self.id, self.states.len());
    }

    fn process(&mut self, task: DetectionTask) {
        let flow = task.flow;

        if flow.is_expired() {
            self.states.remove(&flow.digest);
            return;
        }

        if flow.is_expiring() {
            self.final_pass(&flow);
            return;
        }

        let Some(pkt) = task.packet else {
            return;
        };

        // Cache hit recorded at insert: classification is skipped entirely.
        if FlowFlags::get(&flow.flags.fhc_hit) && !FlowFlags::get(&flow.flags.detection_init) {
            FlowFlags::set(&flow.flags.detection_init);
            self.deps.plugins.broadcast_flow_event(EventKind::FlowNew, &flow);
            FlowFlags::set(&flow.flags.detection_complete);
            self.deps.plugins.broadcast_flow_event(EventKind::FlowDpiComplete, &flow);
            return;
        }

        if !FlowFlags::get(&flow.flags.detection_init) {
            FlowFlags::set(&flow.flags.detection_init);
            self.states.insert(flow.digest, self.deps.engine.new_state());
            self.deps.plugins.broadcast_flow_event(EventKind::FlowNew, &flow);
        }

        if flow.is_detection_complete() {
            self.update_pass(&flow, &pkt);
            return;
        }

        let Some(state) = self.states.get_mut(&flow.digest) else {
            return;
        };

        flow.stats.detection_packets.fetch_add(1, Ordering::Relaxed);
        let verdict = state.dissect(&pkt, &pkt.payload);

        match verdict {
            DpiVerdict::Done { proto, app, guessed } => {
                self.finalize(&flow, proto, app, guessed);
            }
            DpiVerdict::InProgress => {
                let fed = flow.stats.detection_packets.load(Ordering::Relaxed);
                if fed >= self.deps.max_detection_pkts {
                    trace!("dpi{}: budget exhausted for {:?}", self.id, flow);
                    let guess = self
                        .states
                        .get(&flow.digest)
                        .map(|s| s.guess())
                        .unwrap_or(DpiVerdict::InProgress);
                    if let DpiVerdict::Done { proto, app, guessed } = guess {
                        self.finalize(&flow, proto, app, guessed || proto == Protocol::Unknown);
                    } else {
                        self.finalize(&flow, Protocol::Unknown, 0, true);
                    }
                } else if self.deps.verbosity.event_dpi_update {
                    self.deps.plugins.broadcast_flow_event(EventKind::FlowDpiUpdate, &flow);
                }
            }
        }
    }

    /// Feed packets arriving after completion so late metadata (server
    /// banners, certificates) still lands on the flow.
    fn update_pass(&mut self, flow: &Arc<FlowRecord>, pkt: &PacketMeta) {
        let Some(state) = self.states.get_mut(&flow.digest) else {
            return;
        };

        let _ = state.dissect(pkt, &pkt.payload);
        let meta = state.metadata();

        let mut detection = flow.detection.write();
        if merge_metadata(&mut detection, &meta) {
            drop(detection);
            FlowFlags::set(&flow.flags.detection_updated);
            if self.deps.verbosity.event_dpi_update {
                self.deps.plugins.broadcast_flow_event(EventKind::FlowDpiUpdate, flow);
            }
        }
    }

    /// One last dissection pass for an expiring flow, then expire it.
    fn final_pass(&mut self, flow: &Arc<FlowRecord>) {
        if !flow.is_detection_complete() {
            if !FlowFlags::get(&flow.flags.detection_init) {
                FlowFlags::set(&flow.flags.detection_init);
                self.deps.plugins.broadcast_flow_event(EventKind::FlowNew, flow);
            }
            let guess = self
                .states
                .get(&flow.digest)
                .map(|s| s.guess())
                .unwrap_or(DpiVerdict::Done { proto: Protocol::Unknown, app: 0, guessed: true });
            if let DpiVerdict::Done { proto, app, guessed } = guess {
                self.finalize(flow, proto, app, guessed);
            }
        }

        FlowFlags::set(&flow.flags.expired);
        self.deps.plugins.broadcast_flow_event(EventKind::FlowExpiring, flow);
        self.states.remove(&flow.digest);
    }

    /// Populate classification, assign categories, evaluate risks, push
    /// the metadata digest into the FHC and declare detection complete.
    fn finalize(&mut self, flow: &Arc<FlowRecord>, proto: Protocol, app: u32, guessed: bool) {
        let meta = self
            .states
            .get(&flow.digest)
            .map(|s| s.metadata())
            .unwrap_or_default();

        let mdata_digest;
        {
            let mut detection = flow.detection.write();
            detection.protocol = proto;
            detection.protocol_name = proto.name().to_string();
            detection.application = app;

            if let Some(host) = &meta.host_server_name {
                detection.host_server_name = host.clone();
            }

            detection.risks = meta.risks.clone();
            detection.risk_score = (detection.risks.len() as u16) * 50;
            detection.risk_score_client = (detection.risks.len() as u16) * 25;
            detection.risk_score_server = (detection.risks.len() as u16) * 25;

            let cats = &self.deps.categories;
            detection.category.application = cats.lookup(CatType::Application, app);
            detection.category.protocol = cats.lookup(CatType::Protocol, proto.id() as u32);
            let domain_name = if !detection.dns_host_name.is_empty() {
                detection.dns_host_name.clone()
            } else {
                detection.host_server_name.clone()
            };
            if !domain_name.is_empty() {
                detection.category.domain = cats.lookup_domain(&domain_name);
            }
            detection.category.network = cats.lookup_network(flow.other_addr());

            detection.metadata = meta.clone();

            mdata_digest = flow.compute_mdata_digest(&detection);
        }

        // DNS answers observed on this flow hint future flows.
        if let Some(dhc) = &self.deps.dhc {
            for (addr, name) in &meta.dns_hints {
                dhc.insert_addr(addr, name);
            }
        }

        *flow.mdata_digest.lock() = Some(mdata_digest);
        if let Some(fhc) = &self.deps.fhc {
            fhc.push(flow.digest, mdata_digest);
        }

        if guessed {
            FlowFlags::set(&flow.flags.detection_guessed);
            if proto != Protocol::Unknown {
                FlowFlags::set(&flow.flags.soft_dissector);
            }
        }
        FlowFlags::set(&flow.flags.risks_checked);
        FlowFlags::set(&flow.flags.detection_complete);

        self.deps.plugins.broadcast_flow_event(EventKind::FlowDpiComplete, flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::InterfaceInfo;
    use crate::config::InterfaceRole;
    use crate::core::flow::primary_digest;

    fn task(payload_len: usize) -> DetectionTask {
        let frame = crate::testing::frames::udp(
            crate::testing::frames::MAC_A,
            crate::testing::frames::MAC_B,
            "192.168.1.100",
            4000,
            "10.0.0.1",
            4001,
            &vec![0u8; payload_len],
        );
        let pkt = PacketMeta::parse(&frame, 1).unwrap();
        let digest = primary_digest("test0", &pkt);
        let iface = Arc::new(InterfaceInfo::new("test0", InterfaceRole::Lan));
        let flow = Arc::new(FlowRecord::new(iface, &pkt, digest, 15));
        DetectionTask { flow, packet: Some(pkt) }
    }

    // Offered load beyond the byte cap is dropped, never buffered.
    #[test]
    fn test_queue_drops_on_overflow() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = DetectionHandle {
            id: 0,
            tx,
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            max_queue_bytes: 4 * 1024,
            queue_dropped: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        };

        // Each task costs 256 + 768 bytes; four fit under 4 KiB.
        let mut accepted = 0;
        for _ in 0..10 {
            if handle.dispatch(task(768)) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 4);
        assert_eq!(handle.queue_dropped(), 6);
        assert_eq!(rx.len(), accepted);
        assert!(handle.queued_bytes.load(Ordering::Relaxed) <= 4 * 1024);
    }

    #[test]
    fn test_packetless_task_cost_is_fixed() {
        let t = DetectionTask {
            flow: task(0).flow,
            packet: None,
        };
        assert_eq!(t.cost(), TASK_COST_BASE);
    }
}

/// Merge freshly extracted metadata into the detection record; returns
/// true when anything new landed.
fn merge_metadata(detection: &mut FlowDetection, meta: &FlowMetadata) -> bool {
    let mut updated = false;

    if detection.metadata.tls.as_ref().map(|t| (t.version, t.cipher_suite))
        != meta.tls.as_ref().map(|t| (t.version, t.cipher_suite))
    {
        detection.metadata.tls = meta.tls.clone();
        updated = true;
    }
    if let Some(ssh) = &meta.ssh {
        let known = detection.metadata.ssh.get_or_insert_with(Default::default);
        if known.client_agent != ssh.client_agent || known.server_agent != ssh.server_agent {
            known.client_agent = ssh.client_agent.clone();
            known.server_agent = ssh.server_agent.clone();
            updated = true;
        }
    }
    if meta.host_server_name.is_some()
        && detection.host_server_name.is_empty()
    {
        detection.host_server_name = meta.host_server_name.clone().unwrap_or_default();
        updated = true;
    }

    updated
}
