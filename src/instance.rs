//! Instance supervisor
//!
//! Owns every component: the flow map, the caches, the detection pool,
//! the capture workers and the plugin registry. A single long-running
//! loop waits on internal IPC events with a one second timeout and fires
//! the periodic update tick.
//!
//! Configuration reload is diff-based at the interface granularity:
//! identical entries are preserved, changed entries are torn down and
//! re-created.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::addr::{AddressClassifier, PrivacyFilter};
use crate::capture::pcap::{PcapFileSource, PcapSource};
use crate::capture::{
    CaptureContext, CaptureState, CaptureStats, CaptureStatsSnapshot, CaptureWorker,
    InterfaceInfo, PacketSource,
};
use crate::category::Categories;
use crate::config::{AgentConfig, CaptureMethod, InterfaceConfig, InterfaceRole};
use crate::core::flow::{FlowFlags, FlowRecord};
use crate::detection::{DetectionDeps, DetectionHandle, DetectionPool, DetectionTask};
use crate::dpi::{DpiEngine, HeuristicEngine};
use crate::flow::{DnsHintCache, FlowHashCache, FlowMap};
use crate::plugin::{EventKind, PluginRegistry};
use crate::status::{AgentStatus, SignatureStatus};

/// Internal IPC events driving the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcEvent {
    /// Interface/address change notifications are ready to drain
    NetlinkIo,
    /// Re-read configuration and diff the interface set
    Reload,
    /// Stop accepting new work and wind down
    Terminate,
    /// Fire the update tick now
    Update,
    /// Trigger the signature/API refresh
    UpdateApi,
}

struct CaptureSet {
    entry: InterfaceConfig,
    iface: Arc<InterfaceInfo>,
    stats: Arc<CaptureStats>,
    workers: Vec<CaptureWorker>,
}

/// The agent instance
pub struct Instance {
    config: RwLock<Arc<AgentConfig>>,
    config_path: Option<PathBuf>,

    pub flow_map: Arc<FlowMap>,
    pub fhc: Option<Arc<FlowHashCache>>,
    pub dhc: Option<Arc<DnsHintCache>>,
    pub categories: Arc<Categories>,
    pub plugins: Arc<PluginRegistry>,

    classifier: Arc<RwLock<AddressClassifier>>,
    privacy: RwLock<Arc<PrivacyFilter>>,

    detection_pool: Mutex<Option<DetectionPool>>,
    detection_handles: Arc<Vec<DetectionHandle>>,

    capture: Mutex<BTreeMap<String, CaptureSet>>,

    status: Mutex<AgentStatus>,
    global_stats: Mutex<CaptureStatsSnapshot>,
    flow_count: Arc<AtomicUsize>,

    ipc_tx: Sender<IpcEvent>,
    ipc_rx: Receiver<IpcEvent>,

    should_terminate: AtomicBool,
    terminate_force: AtomicBool,

    agent_uuid: String,
    epoch: Instant,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Instance {
    /// Build an instance from configuration. Detection workers start
    /// immediately; capture workers start in `run` (or explicitly via
    /// `add_capture_with_source`).
    pub fn new(config: AgentConfig, config_path: Option<PathBuf>) -> Arc<Self> {
        let soft_dissectors = config.detection.soft_dissectors;
        Self::with_engine(
            config,
            config_path,
            Arc::new(HeuristicEngine::new(soft_dissectors)),
        )
    }

    pub fn with_engine(
        config: AgentConfig,
        config_path: Option<PathBuf>,
        engine: Arc<dyn DpiEngine>,
    ) -> Arc<Self> {
        let categories = Arc::new(Categories::new());
        load_categories(&categories, &config);

        let fhc = match config.fhc.save {
            crate::config::CacheSave::Disabled => None,
            _ => {
                let fhc = Arc::new(FlowHashCache::new(
                    config.fhc.max_entries,
                    config.fhc.purge_divisor,
                ));
                if let Some(path) = config.fhc_path() {
                    if path.exists() {
                        if let Err(e) = fhc.load(&path) {
                            warn!("Flow hash cache load failed: {:#}", e);
                        }
                    }
                }
                Some(fhc)
            }
        };

        let dhc = match config.dhc.save {
            crate::config::CacheSave::Disabled => None,
            _ => {
                let dhc = Arc::new(DnsHintCache::new(config.dhc.ttl));
                if let Some(path) = config.dhc_path() {
                    if path.exists() {
                        if let Err(e) = dhc.load(&path) {
                            warn!("DNS hint cache load failed: {:#}", e);
                        }
                    }
                }
                Some(dhc)
            }
        };

        let plugins = Arc::new(PluginRegistry::new());
        let flow_map = Arc::new(FlowMap::new(config.flow.map_buckets));
        let classifier = Arc::new(RwLock::new(AddressClassifier::from_config(&config)));
        let privacy = RwLock::new(Arc::new(PrivacyFilter::from_config(&config)));

        let deps = Arc::new(DetectionDeps {
            engine,
            fhc: fhc.clone(),
            dhc: dhc.clone(),
            categories: categories.clone(),
            plugins: plugins.clone(),
            verbosity: config.general.verbosity.clone(),
            max_detection_pkts: config.detection.max_detection_pkts,
        });
        let pool = DetectionPool::spawn(
            config.detection_workers(),
            config.detection.max_packet_queue_kb,
            deps,
        );
        let detection_handles = Arc::new(pool.handles.clone());

        let agent_uuid = load_or_create_uuid(&config);
        let status = AgentStatus::new(config.general.update_interval);

        let (ipc_tx, ipc_rx) = crossbeam_channel::unbounded();

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            flow_map,
            fhc,
            dhc,
            categories,
            plugins,
            classifier,
            privacy,
            detection_pool: Mutex::new(Some(pool)),
            detection_handles,
            capture: Mutex::new(BTreeMap::new()),
            status: Mutex::new(status),
            global_stats: Mutex::new(CaptureStatsSnapshot::default()),
            flow_count: Arc::new(AtomicUsize::new(0)),
            ipc_tx,
            ipc_rx,
            should_terminate: AtomicBool::new(false),
            terminate_force: AtomicBool::new(false),
            agent_uuid,
            epoch: Instant::now(),
        })
    }

    pub fn config(&self) -> Arc<AgentConfig> {
        self.config.read().clone()
    }

    /// Sender for IPC events (signal handlers, tests)
    pub fn ipc_sender(&self) -> Sender<IpcEvent> {
        self.ipc_tx.clone()
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub fn flow_count(&self) -> usize {
        self.flow_count.load(Ordering::Acquire)
    }

    pub fn agent_uuid(&self) -> &str {
        &self.agent_uuid
    }

    /// Run the supervisor loop; returns the process exit code.
    pub fn run(self: &Arc<Self>) -> i32 {
        let config = self.config();
        info!(
            "flowmon v{}: {} detection worker(s), {} flow buckets",
            crate::AGENT_VERSION,
            self.detection_handles.len(),
            self.flow_map.num_buckets()
        );

        // Initial update on start-up.
        self.process_update();

        if config.general.capture_delay > 0 {
            info!(
                "Starting capture source(s) in {}s",
                config.general.capture_delay
            );
            std::thread::sleep(Duration::from_secs(config.general.capture_delay));
        }

        if let Err(e) = self.start_configured_capture(&config) {
            error!("Failed to start capture sources: {:#}", e);
            return 1;
        }
        if self.capture.lock().is_empty() && !config.general.run_without_sources {
            error!("No capture sources configured");
            return 1;
        }

        let interval = Duration::from_secs(config.general.update_interval.max(1));
        let mut last_update = Instant::now();

        loop {
            match self.ipc_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(IpcEvent::NetlinkIo) => {
                    debug!("IPC: interface notifications");
                    self.refresh_interface_addrs();
                }
                Ok(IpcEvent::Reload) => {
                    debug!("IPC: reload configuration");
                    self.reload();
                }
                Ok(IpcEvent::Terminate) => {
                    info!("IPC: terminate");
                    self.should_terminate.store(true, Ordering::Release);
                }
                Ok(IpcEvent::Update) => {
                    self.reap_capture_workers();
                    self.process_update();
                    last_update = Instant::now();
                }
                Ok(IpcEvent::UpdateApi) => {
                    // The signature refresh client is an external
                    // collaborator; the trigger only lands in status.
                    debug!("IPC: signature update requested");
                    self.status.lock().netify_api.last_update =
                        SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_update.elapsed() >= interval {
                self.reap_capture_workers();
                self.process_update();
                last_update = Instant::now();
            }

            if self.terminate_force.load(Ordering::Acquire) {
                break;
            }

            if self.should_terminate() {
                break;
            }

            let config = self.config();
            if !config.general.run_without_sources && self.all_capture_offline() {
                info!("No capture sources remain; terminating");
                self.should_terminate.store(true, Ordering::Release);
                break;
            }
        }

        self.shutdown();
        info!("Normal exit");
        0
    }

    /// Wind down: stop capture, expire remaining flows when configured,
    /// drain detection, emit the final update and persist caches.
    pub fn shutdown(&self) {
        self.should_terminate.store(true, Ordering::Release);
        let config = self.config();

        {
            let mut capture = self.capture.lock();
            for set in capture.values_mut() {
                for worker in &mut set.workers {
                    worker.stop();
                    worker.join();
                }
            }
        }

        let force = self.terminate_force.load(Ordering::Acquire);
        if config.general.auto_flow_expiry && !force {
            self.expire_all_flows();
            self.detection_quiesce(Duration::from_secs(5));
        }

        if let Some(pool) = self.detection_pool.lock().take() {
            pool.shutdown(force);
        }

        // Final update broadcasts the remaining expiries and purges.
        self.process_update();

        if let Some(fhc) = &self.fhc {
            if let Some(path) = config.fhc_path() {
                if let Err(e) = fhc.save(&path) {
                    warn!("Flow hash cache save failed: {:#}", e);
                }
            }
        }
        if let Some(dhc) = &self.dhc {
            if let Some(path) = config.dhc_path() {
                if let Err(e) = dhc.save(&path) {
                    warn!("DNS hint cache save failed: {:#}", e);
                }
            }
        }
    }

    pub fn terminate(&self, force: bool) {
        if force {
            self.terminate_force.store(true, Ordering::Release);
        }
        let _ = self.ipc_tx.send(IpcEvent::Terminate);
    }

    // ---- capture management ----

    fn start_configured_capture(&self, config: &Arc<AgentConfig>) -> Result<()> {
        for (name, entry) in config.interfaces.clone() {
            if let Err(e) = self.start_capture_entry(config, &name, entry) {
                warn!("{}: not starting capture: {:#}", name, e);
            }
        }
        Ok(())
    }

    fn start_capture_entry(
        &self,
        config: &Arc<AgentConfig>,
        name: &str,
        entry: InterfaceConfig,
    ) -> Result<()> {
        let source: Box<dyn PacketSource> = match entry.method {
            CaptureMethod::Pcap => Box::new(PcapSource::open(
                name,
                entry.filter.as_deref(),
                config,
            )?),
            CaptureMethod::PcapOffline => {
                let file = entry
                    .pcap_file
                    .as_ref()
                    .ok_or_else(|| anyhow!("pcap_offline requires pcap_file"))?;
                Box::new(PcapFileSource::open(file, config)?)
            }
            CaptureMethod::Tpv3 | CaptureMethod::Nfqueue => {
                return Err(anyhow!(
                    "capture method requires an external capture module"
                ));
            }
        };

        self.spawn_capture(name, entry, source);
        Ok(())
    }

    /// Attach a capture worker around an arbitrary source. Used for every
    /// built-in method and directly by the test suites.
    pub fn add_capture_with_source(
        &self,
        name: &str,
        role: InterfaceRole,
        source: Box<dyn PacketSource>,
    ) {
        let entry = InterfaceConfig {
            role,
            method: CaptureMethod::Pcap,
            pcap_file: None,
            tpv3: None,
            nfqueue: None,
            filter: None,
            addresses: Vec::new(),
            local_networks: Vec::new(),
        };
        self.spawn_capture(name, entry, source);
    }

    fn spawn_capture(&self, name: &str, entry: InterfaceConfig, source: Box<dyn PacketSource>) {
        let config = self.config();
        let mut capture = self.capture.lock();

        let set = capture.entry(name.to_string()).or_insert_with(|| {
            let iface = Arc::new(InterfaceInfo::new(name, entry.role));
            iface.set_addrs(
                entry
                    .addresses
                    .iter()
                    .filter_map(|a| a.parse().ok())
                    .collect(),
            );
            CaptureSet {
                entry: entry.clone(),
                iface,
                stats: Arc::new(CaptureStats::default()),
                workers: Vec::new(),
            }
        });

        let ctx = Arc::new(CaptureContext {
            config: config.clone(),
            iface: set.iface.clone(),
            flow_map: self.flow_map.clone(),
            fhc: self.fhc.clone(),
            dhc: self.dhc.clone(),
            classifier: self.classifier.clone(),
            privacy: self.privacy.read().clone(),
            detection: self.detection_handles.clone(),
            stats: set.stats.clone(),
            flow_count: self.flow_count.clone(),
        });

        set.workers.push(CaptureWorker::spawn(ctx, source));
    }

    /// Names of interfaces with capture workers attached
    pub fn capture_names(&self) -> Vec<String> {
        self.capture.lock().keys().cloned().collect()
    }

    fn all_capture_offline(&self) -> bool {
        let capture = self.capture.lock();
        !capture.is_empty()
            && capture
                .values()
                .all(|set| set.workers.iter().all(|w| !w.is_alive()))
    }

    /// Join workers whose source went offline; keep their stats visible.
    fn reap_capture_workers(&self) {
        let mut capture = self.capture.lock();
        for set in capture.values_mut() {
            for worker in &mut set.workers {
                if !worker.is_alive() {
                    worker.join();
                }
            }
        }
    }

    fn refresh_interface_addrs(&self) {
        let config = self.config();
        *self.classifier.write() = AddressClassifier::from_config(&config);

        let capture = self.capture.lock();
        for (name, set) in capture.iter() {
            if let Some(entry) = config.interfaces.get(name) {
                set.iface
                    .set_addrs(entry.addresses.iter().filter_map(|a| a.parse().ok()).collect());
            }
        }
    }

    // ---- reload ----

    /// Re-read configuration from disk and apply it. A configuration
    /// error keeps the old configuration running.
    pub fn reload(&self) {
        let Some(path) = &self.config_path else {
            debug!("Reload requested without a configuration file");
            self.apply_config(self.config().as_ref().clone());
            return;
        };

        match AgentConfig::load(path) {
            Ok(new_config) => self.apply_config(new_config),
            Err(e) => {
                error!("Configuration reload failed, keeping previous: {:#}", e);
            }
        }
    }

    /// Apply a new configuration: reload categories, swap derived state
    /// and diff the interface set.
    pub fn apply_config(&self, new_config: AgentConfig) {
        info!("Reloading configuration");

        load_categories(&self.categories, &new_config);
        *self.classifier.write() = AddressClassifier::from_config(&new_config);
        *self.privacy.write() = Arc::new(PrivacyFilter::from_config(&new_config));

        let new_config = Arc::new(new_config);
        *self.config.write() = new_config.clone();

        // Diff interfaces: drop removed/changed entries, start added ones.
        let mut removed = Vec::new();
        {
            let mut capture = self.capture.lock();
            capture.retain(|name, set| {
                match new_config.interfaces.get(name) {
                    Some(entry) if *entry == set.entry => true,
                    _ => {
                        for worker in &mut set.workers {
                            worker.stop();
                        }
                        removed.push(name.clone());
                        false
                    }
                }
            });
        }
        for name in &removed {
            info!("{}: capture stopped by reload", name);
        }

        let existing: Vec<String> = self.capture.lock().keys().cloned().collect();
        for (name, entry) in new_config.interfaces.clone() {
            if existing.contains(&name) {
                continue;
            }
            if let Err(e) = self.start_capture_entry(&new_config, &name, entry) {
                warn!("{}: not starting capture: {:#}", name, e);
            }
        }

        self.plugins.broadcast_reload();
    }

    // ---- flow expiry ----

    /// Mark a flow for expiry. Completed flows expire in place; flows
    /// still in detection get one final pass on their sticky worker.
    /// Returns true if the flow entered the expiring state.
    pub fn expire_flow(&self, flow: &Arc<FlowRecord>) -> bool {
        if flow.is_detection_complete() {
            if !flow.is_expired() {
                FlowFlags::set(&flow.flags.expiring);
                self.plugins.broadcast_flow_event(EventKind::FlowExpiring, flow);
                FlowFlags::set(&flow.flags.expired);
            }
            return false;
        }

        if flow.is_expiring() {
            return false;
        }
        FlowFlags::set(&flow.flags.expiring);

        let worker = flow.dpi_thread_id.load(Ordering::Acquire);
        let dispatched = worker >= 0
            && self
                .detection_handles
                .get(worker as usize)
                .map(|handle| {
                    handle.dispatch(DetectionTask {
                        flow: flow.clone(),
                        packet: None,
                    })
                })
                .unwrap_or(false);

        if !dispatched {
            // No worker will run the final pass; expire in place.
            self.plugins.broadcast_flow_event(EventKind::FlowExpiring, flow);
            FlowFlags::set(&flow.flags.expired);
            return false;
        }

        true
    }

    /// Force-expire every flow (terminate with auto flow expiry)
    pub fn expire_all_flows(&self) {
        for b in 0..self.flow_map.num_buckets() {
            let bucket = self.flow_map.bucket(b);
            for flow in bucket.values() {
                if !flow.is_expired() {
                    self.expire_flow(flow);
                }
            }
        }
    }

    /// Wait for the detection queues to drain
    pub fn detection_quiesce(&self, timeout: Duration) -> bool {
        let pool = self.detection_pool.lock();
        match pool.as_ref() {
            Some(pool) => pool.quiesce(timeout),
            None => true,
        }
    }

    // ---- update tick ----

    /// One full update tick: status snapshot, cache purge, plugin
    /// broadcasts, statistics collection and the flow expiry sweep.
    pub fn process_update(&self) {
        let config = self.config();

        // Status snapshot first; flow gauges carry last sweep's numbers.
        let status_copy = {
            let mut status = self.status.lock();
            status.update_usage();
            status.uptime = self.epoch.elapsed().as_secs();
            status.agent_uuid = self.agent_uuid.clone();
            status.dhc_status = self.dhc.is_some();
            status.dhc_size = self.dhc.as_ref().map_or(0, |d| d.len());
            let ((ac, am), (pc, pm)) = self.categories.sizes();
            status.signatures = SignatureStatus {
                application_categories: ac,
                application_members: am,
                protocol_categories: pc,
                protocol_members: pm,
            };
            status.clone()
        };

        if let Some(dhc) = &self.dhc {
            dhc.purge();
        }

        self.plugins.broadcast_status_update(&status_copy);
        self.plugins.broadcast_update_init(&status_copy);

        // Refresh interface address sets and advance endpoint snapshots.
        self.refresh_interface_addrs();
        let ifaces: Vec<Arc<InterfaceInfo>> = {
            let capture = self.capture.lock();
            capture
                .values()
                .map(|set| {
                    set.iface.next_endpoint_snapshot();
                    set.iface.clone()
                })
                .collect()
        };
        self.plugins.broadcast_interfaces(&ifaces);

        // Per-interface statistics, read-and-reset.
        let mut tick_total = CaptureStatsSnapshot::default();
        {
            let capture = self.capture.lock();
            let mut status = self.status.lock();
            for (name, set) in capture.iter() {
                let snap = set.stats.snapshot_and_reset();
                tick_total.merge(&snap);

                let state = set
                    .workers
                    .iter()
                    .map(|w| w.state.get())
                    .fold(CaptureState::Offline, |acc, s| {
                        if s == CaptureState::Online { CaptureState::Online } else { acc }
                    });
                status.interfaces.insert(
                    name.clone(),
                    crate::status::InterfaceStatus {
                        role: match set.entry.role {
                            InterfaceRole::Lan => "LAN".to_string(),
                            InterfaceRole::Wan => "WAN".to_string(),
                        },
                        state: match state {
                            CaptureState::Init => "init",
                            CaptureState::Online => "online",
                            CaptureState::Offline => "offline",
                        }
                        .to_string(),
                        addrs: set.iface.addrs().iter().map(|a| a.to_string()).collect(),
                        stats: snap,
                    },
                );

                self.plugins.broadcast_capture_stats(name, &snap);
            }
        }

        let global = {
            let mut global = self.global_stats.lock();
            global.merge(&tick_total);
            *global
        };
        {
            let mut status = self.status.lock();
            status.stats = global;
            if let Err(e) = status.save(config.status_path()) {
                debug!("Status snapshot not written: {:#}", e);
            }
        }
        self.plugins.broadcast_global_stats(&global);

        self.plugins.broadcast_flow_map(&self.flow_map);
        self.plugins.broadcast_update_complete();

        self.sweep_flows_at(epoch_ms());
    }

    /// Walk every bucket: apply idle timers, purge unreferenced expired
    /// flows, and reset per-tick bookkeeping on active flows.
    pub fn sweep_flows_at(&self, now_ms: u64) {
        let config = self.config();
        let ttl_idle_ms = config.flow.ttl_idle * 1000;
        let ttl_idle_tcp_ms = config.flow.ttl_idle_tcp * 1000;

        let mut flows_total = 0usize;
        let mut in_use = 0usize;
        let mut expiring = 0usize;
        let mut expired = 0usize;
        let mut purged = 0usize;
        let mut active = 0usize;
        let mut pre_init = 0usize;

        for b in 0..self.flow_map.num_buckets() {
            let mut bucket = self.flow_map.bucket(b);
            let mut remove = Vec::new();

            for (digest, flow) in bucket.iter() {
                if Arc::strong_count(flow) > 1 {
                    in_use += 1;
                }

                if !flow.is_expired() {
                    // TCP flows that finished their close handshake fall
                    // back to the short idle timer.
                    let ttl_ms = if flow.ip_protocol != 6 {
                        ttl_idle_ms
                    } else if FlowFlags::get(&flow.flags.tcp_fin_ack) {
                        ttl_idle_ms
                    } else {
                        ttl_idle_tcp_ms
                    };

                    if flow.last_seen_ms() + ttl_ms < now_ms && self.expire_flow(flow) {
                        expiring += 1;
                    }
                }

                if flow.is_expired() {
                    expired += 1;
                    if Arc::strong_count(flow) == 1 {
                        self.plugins.broadcast_flow_event(EventKind::FlowExpire, flow);
                        remove.push(*digest);
                    }
                } else if FlowFlags::get(&flow.flags.detection_init) {
                    if flow.stats.tick_packets.load(Ordering::Relaxed) > 0 {
                        active += 1;
                        flow.reset();
                    }
                } else {
                    pre_init += 1;
                }
            }

            purged += remove.len();
            for digest in remove {
                bucket.remove(&digest);
            }
            flows_total += bucket.len();
        }

        if purged > 0 {
            self.flow_count.fetch_sub(purged, Ordering::AcqRel);
        }

        {
            let mut status = self.status.lock();
            status.flow_count = flows_total;
            status.flows_in_use = in_use;
            status.flows_expiring = expiring;
            status.flows_expired = expired;
            status.flows_purged = purged;
        }

        debug!(
            "flows: total: {}, pre-dpi: {}, in-use: {}, active: {}, expiring: {}, expired: {}, purged: {}",
            flows_total, pre_init, in_use, active, expiring, expired, purged
        );
    }
}

fn load_categories(categories: &Arc<Categories>, config: &AgentConfig) {
    let path = &config.categories.path_index;
    if path.exists() {
        if let Err(e) = categories.load(path) {
            warn!("Category index load failed: {:#}", e);
            let legacy = &config.categories.path_legacy_index;
            if legacy.exists() {
                if let Err(e) = categories.load_legacy(legacy) {
                    warn!("Legacy category index load failed: {:#}", e);
                }
            }
        }
    } else {
        let legacy = &config.categories.path_legacy_index;
        if legacy.exists() {
            if let Err(e) = categories.load_legacy(legacy) {
                warn!("Legacy category index load failed: {:#}", e);
            }
        }
    }

    if config.categories.dotd_enabled && config.categories.path_dotd.exists() {
        if let Err(e) = categories.load_dotd(&config.categories.path_dotd) {
            warn!("Category directory load failed: {:#}", e);
        }
    }
}

/// Load the persisted agent UUID, creating one on first run.
fn load_or_create_uuid(config: &AgentConfig) -> String {
    let path = config.uuid_path();
    if let Ok(uuid) = std::fs::read_to_string(&path) {
        let uuid = uuid.trim().to_string();
        if !uuid.is_empty() {
            return uuid;
        }
    }

    let uuid = generate_uuid();
    if let Err(e) = std::fs::create_dir_all(config.general.path_state_persistent.as_path())
        .and_then(|_| std::fs::write(&path, format!("{}\n", uuid)))
    {
        debug!("Agent UUID not persisted: {}", e);
    } else {
        info!("Generated agent UUID: {}", uuid);
    }
    uuid
}

fn generate_uuid() -> String {
    use sha1::{Digest, Sha1};

    let mut ctx = Sha1::new();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    ctx.update(nanos.to_be_bytes());
    ctx.update(std::process::id().to_be_bytes());
    let digest = ctx.finalize();

    digest[..4]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 11);
        assert_eq!(uuid.matches('-').count(), 3);
    }
}
