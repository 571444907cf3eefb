//! Agent configuration
//!
//! TOML-backed configuration with compiled-in defaults. The configuration
//! is effectively immutable after load; reload builds a fresh `AgentConfig`
//! and swaps it behind the instance lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name of the persisted flow-hash cache (under a state directory).
pub const FHC_FILE_NAME: &str = "flow-hash-cache.dat";
/// File name of the persisted DNS hint cache (under a state directory).
pub const DHC_FILE_NAME: &str = "dns-cache.csv";
/// File name of the agent status snapshot (under the volatile state dir).
pub const STATUS_FILE_NAME: &str = "status.json";
/// File name of the persisted agent UUID (under the persistent state dir).
pub const UUID_FILE_NAME: &str = "agent.uuid";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub fhc: FhcConfig,

    #[serde(default)]
    pub dhc: DhcConfig,

    #[serde(default)]
    pub categories: CategoryConfig,

    #[serde(default)]
    pub privacy: PrivacyConfig,

    /// Capture interfaces, keyed by interface name. A BTreeMap keeps
    /// reload diffs and status output stable.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            flow: FlowConfig::default(),
            detection: DetectionConfig::default(),
            capture: CaptureConfig::default(),
            fhc: FhcConfig::default(),
            dhc: DhcConfig::default(),
            categories: CategoryConfig::default(),
            privacy: PrivacyConfig::default(),
            interfaces: BTreeMap::new(),
        }
    }
}

/// General agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Persistent state directory (caches that survive reboot)
    pub path_state_persistent: PathBuf,
    /// Volatile state directory (status snapshot, runtime caches)
    pub path_state_volatile: PathBuf,
    /// Stay alive when no capture sources remain
    pub run_without_sources: bool,
    /// Expire all remaining flows on terminate
    pub auto_flow_expiry: bool,
    /// Seconds to wait before starting capture sources
    pub capture_delay: u64,
    /// Update tick interval in seconds
    pub update_interval: u64,
    /// Per-event debug verbosity
    #[serde(default)]
    pub verbosity: VerbosityConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            path_state_persistent: PathBuf::from("/etc/flowmon"),
            path_state_volatile: PathBuf::from("/var/run/flowmon"),
            run_without_sources: false,
            auto_flow_expiry: true,
            capture_delay: 0,
            update_interval: 15,
            verbosity: VerbosityConfig::default(),
        }
    }
}

/// Gates for per-event debug output and `flow_dpi_update` emission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerbosityConfig {
    #[serde(default)]
    pub event_dpi_new: bool,
    #[serde(default)]
    pub event_dpi_update: bool,
    #[serde(default)]
    pub event_dpi_complete: bool,
}

/// Flow map and expiry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Number of flow map buckets; fixed for the instance lifetime
    pub map_buckets: usize,
    /// Maximum tracked flows (0 = unlimited); new flows are rejected
    /// at capture once reached
    pub max_flows: usize,
    /// Idle TTL for non-TCP flows (and closed TCP flows), seconds
    pub ttl_idle: u64,
    /// Idle TTL for established TCP flows, seconds
    pub ttl_idle_tcp: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            map_buckets: 128,
            max_flows: 0,
            ttl_idle: 30,
            ttl_idle_tcp: 300,
        }
    }
}

/// Detection worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Number of detection workers (0 = one per CPU, capped at CPU count)
    pub cores: usize,
    /// Per-flow packet budget before classification is forced to a guess
    pub max_detection_pkts: u32,
    /// Per-worker packet queue cap in kilobytes; overflow drops packets
    pub max_packet_queue_kb: usize,
    /// Allow port-based fallback dissection
    pub soft_dissectors: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cores: 0,
            max_detection_pkts: 32,
            max_packet_queue_kb: 8192,
            soft_dissectors: true,
        }
    }
}

/// Capture source defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Read timeout in milliseconds so workers can observe termination
    pub read_timeout_ms: u32,
    /// Snapshot length
    pub snaplen: u32,
    /// Promiscuous mode for live sources
    pub promiscuous: bool,
    /// Pace offline replay by packet timestamps
    pub replay_delay: bool,
    /// AF_PACKET v3 defaults, applied where an interface omits them
    #[serde(default)]
    pub tpv3_defaults: Tpv3Config,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            snaplen: 65535,
            promiscuous: true,
            replay_delay: false,
            tpv3_defaults: Tpv3Config::default(),
        }
    }
}

/// Flow-hash cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhcConfig {
    pub save: CacheSave,
    /// Maximum entries
    pub max_entries: usize,
    /// On insert at capacity, drop `max_entries / purge_divisor` tail entries
    pub purge_divisor: usize,
}

impl Default for FhcConfig {
    fn default() -> Self {
        Self {
            save: CacheSave::Persistent,
            max_entries: 10_000,
            purge_divisor: 10,
        }
    }
}

/// DNS hint cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcConfig {
    pub save: CacheSave,
    /// Entry TTL in seconds
    pub ttl: u64,
}

impl Default for DhcConfig {
    fn default() -> Self {
        Self {
            save: CacheSave::Persistent,
            ttl: 30 * 60,
        }
    }
}

/// Cache persistence mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSave {
    /// Cache is disabled entirely
    Disabled,
    /// Persist under the persistent state directory
    Persistent,
    /// Persist under the volatile state directory
    Volatile,
}

/// Category/signature database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Application/protocol category index (JSON)
    pub path_index: PathBuf,
    /// Legacy application index (JSON, arrays of member ids)
    pub path_legacy_index: PathBuf,
    /// Directory of `<priority>-<category_tag>.conf` domain/network lists
    pub path_dotd: PathBuf,
    /// Scan the dot-directory on load/reload
    pub dotd_enabled: bool,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            path_index: PathBuf::from("/etc/flowmon/categories.json"),
            path_legacy_index: PathBuf::from("/etc/flowmon/apps-legacy.json"),
            path_dotd: PathBuf::from("/etc/flowmon/categories.d"),
            dotd_enabled: true,
        }
    }
}

/// Privacy redaction filters. Matching addresses keep their digests but
/// are masked in emitted events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// MAC addresses, `aa:bb:cc:dd:ee:ff`
    #[serde(default)]
    pub mac: Vec<String>,
    /// IP addresses
    #[serde(default)]
    pub host: Vec<String>,
}

/// Interface role; decides which endpoint counts as "local" in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceRole {
    Lan,
    Wan,
}

/// Per-interface capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub role: InterfaceRole,
    #[serde(default)]
    pub method: CaptureMethod,
    /// Offline capture file, for `method = "pcap_offline"`
    #[serde(default)]
    pub pcap_file: Option<PathBuf>,
    /// AF_PACKET v3 tuning, for `method = "tpv3"`
    #[serde(default)]
    pub tpv3: Option<Tpv3Config>,
    /// NFQUEUE tuning, for `method = "nfqueue"`
    #[serde(default)]
    pub nfqueue: Option<NfqConfig>,
    /// BPF filter expression passed to the capture primitive
    #[serde(default)]
    pub filter: Option<String>,
    /// Locally assigned addresses (exact-match `local` classification)
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Local subnets in CIDR form (`local_net` classification)
    #[serde(default)]
    pub local_networks: Vec<String>,
}

/// Capture method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// libpcap live capture
    Pcap,
    /// pcap file replay
    PcapOffline,
    /// AF_PACKET v3 ring with optional fanout
    Tpv3,
    /// NFQUEUE (netfilter queue)
    Nfqueue,
}

impl Default for CaptureMethod {
    fn default() -> Self {
        CaptureMethod::Pcap
    }
}

/// AF_PACKET v3 fanout mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    Disabled,
    Hash,
    LoadBalanced,
    Cpu,
    Rollover,
    Random,
    QueueMap,
}

impl Default for FanoutMode {
    fn default() -> Self {
        FanoutMode::Disabled
    }
}

/// AF_PACKET v3 ring/fanout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tpv3Config {
    pub fanout_mode: FanoutMode,
    /// PACKET_FANOUT_FLAG_DEFRAG
    pub defrag: bool,
    /// PACKET_FANOUT_FLAG_ROLLOVER
    pub rollover: bool,
    /// Fanout instances (0 = one)
    pub fanout_instances: usize,
    pub rb_block_size: usize,
    pub rb_frame_size: usize,
    pub rb_blocks: usize,
}

impl Default for Tpv3Config {
    fn default() -> Self {
        Self {
            fanout_mode: FanoutMode::Disabled,
            defrag: false,
            rollover: false,
            fanout_instances: 0,
            rb_block_size: 1 << 22,
            rb_frame_size: 1 << 11,
            rb_blocks: 64,
        }
    }
}

/// NFQUEUE configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfqConfig {
    pub queue_id: u16,
    pub instances: usize,
}

impl Default for NfqConfig {
    fn default() -> Self {
        Self { queue_id: 0, instances: 0 }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowmon/flowmond.toml"),
            PathBuf::from("flowmond.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Resolve the actual detection worker count
    pub fn detection_workers(&self) -> usize {
        let cpus = num_cpus::get().max(1);
        if self.detection.cores == 0 {
            cpus
        } else {
            self.detection.cores.min(cpus)
        }
    }

    /// State directory for a cache persistence mode, if persistence is on
    pub fn state_dir(&self, save: CacheSave) -> Option<&Path> {
        match save {
            CacheSave::Disabled => None,
            CacheSave::Persistent => Some(self.general.path_state_persistent.as_path()),
            CacheSave::Volatile => Some(self.general.path_state_volatile.as_path()),
        }
    }

    /// Path of the persisted flow-hash cache, if enabled
    pub fn fhc_path(&self) -> Option<PathBuf> {
        self.state_dir(self.fhc.save).map(|d| d.join(FHC_FILE_NAME))
    }

    /// Path of the persisted DNS hint cache, if enabled
    pub fn dhc_path(&self) -> Option<PathBuf> {
        self.state_dir(self.dhc.save).map(|d| d.join(DHC_FILE_NAME))
    }

    /// Path of the status snapshot file
    pub fn status_path(&self) -> PathBuf {
        self.general.path_state_volatile.join(STATUS_FILE_NAME)
    }

    /// Path of the persisted agent UUID
    pub fn uuid_path(&self) -> PathBuf {
        self.general.path_state_persistent.join(UUID_FILE_NAME)
    }
}
