//! Resource limit configuration model
//!
//! A [`ResourceLimitConfig`] names a set of executables and the limits that
//! apply to every process running one of them. The list is produced
//! wholesale by a configuration collaborator ([`ConfigSource`]) and consumed
//! by the governor. All sub-configs deserialize with defaults so partial
//! documents load.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MemorySize, Result};

/// Executable path plus optional arguments.
///
/// Only `path` participates in matching; `arguments` is carried for display.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathMatcher {
    /// Executable image path
    pub path: PathBuf,
    /// Arguments shown next to the path
    pub arguments: Vec<String>,
}

impl PathMatcher {
    /// Matcher for an executable path without arguments
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            arguments: Vec::new(),
        }
    }
}

/// Group-level CPU rate control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum CpuRateMode {
    /// No rate control
    #[default]
    None,
    /// Weight-based share, 1..=9
    RelativeWeight(i32),
    /// Hard cap in percent of the whole machine, 1..=100
    AbsoluteCap(i32),
}

/// Per-process core affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum AffinityMode {
    /// Leave affinity untouched
    #[default]
    None,
    /// Use the N lowest-numbered cores
    CoreCount(i32),
    /// Pin to a single core index
    CoreIndex(i32),
}

/// CPU limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLimitSpec {
    /// Whether CPU limiting is active
    pub enabled: bool,
    /// Group-level rate control
    pub rate_mode: CpuRateMode,
    /// Per-process affinity
    pub affinity_mode: AffinityMode,
}

/// What to do with a process whose working set exceeds its cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OveruseAction {
    /// Push resident pages out to the backing store
    #[default]
    TrimWorkingSet,
    /// Kill the process
    Terminate,
}

/// Memory limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimitSpec {
    /// Whether memory limiting is active
    pub enabled: bool,
    /// Cap in megabytes
    pub cap_mb: u64,
    /// Implied overuse behavior
    pub overuse_action: OveruseAction,
    /// Register members with the memory monitor
    pub enable_monitoring: bool,
    /// Trim on overage regardless of `overuse_action`
    pub enable_auto_trim: bool,
    /// Terminate on overage regardless of `overuse_action`
    pub terminate_on_exceed: bool,
}

impl Default for MemoryLimitSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            cap_mb: 0,
            overuse_action: OveruseAction::default(),
            enable_monitoring: true,
            enable_auto_trim: false,
            terminate_on_exceed: false,
        }
    }
}

impl MemoryLimitSpec {
    /// The cap as a byte size
    #[must_use]
    pub const fn cap(&self) -> MemorySize {
        MemorySize::from_mb(self.cap_mb)
    }

    /// Explicit flag OR the behavior implied by `overuse_action`
    #[must_use]
    pub fn auto_trim_effective(&self) -> bool {
        self.enable_auto_trim || self.overuse_action == OveruseAction::TrimWorkingSet
    }

    /// Explicit flag OR the behavior implied by `overuse_action`
    #[must_use]
    pub fn terminate_effective(&self) -> bool {
        self.terminate_on_exceed || self.overuse_action == OveruseAction::Terminate
    }
}

/// Disk I/O limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLimitSpec {
    /// Whether disk limiting is active
    pub enabled: bool,
    /// Combined read+write cap in megabytes per second
    pub rate_limit_mb_per_sec: u64,
}

/// Network limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkLimitSpec {
    /// Whether network limiting is active
    pub enabled: bool,
    /// Maximum outgoing bandwidth in KB/s
    pub max_rate_kb_per_sec: u64,
    /// Also set a DSCP priority tag
    pub specify_priority: bool,
    /// DSCP tag, 0..=63
    pub priority_value: i32,
}

/// Scheduling priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Runs only when the system is idle
    Idle,
    /// Below normal
    BelowNormal,
    /// Normal
    #[default]
    Normal,
    /// Above normal
    AboveNormal,
    /// High
    High,
    /// Highest class the OS offers
    RealTime,
}

impl PriorityClass {
    /// Map a configured level `0..=5`; anything else is `Normal`.
    #[must_use]
    pub const fn from_level(level: i32) -> Self {
        match level {
            0 => Self::Idle,
            1 => Self::BelowNormal,
            3 => Self::AboveNormal,
            4 => Self::High,
            5 => Self::RealTime,
            _ => Self::Normal,
        }
    }

    /// Human-readable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::BelowNormal => "BelowNormal",
            Self::Normal => "Normal",
            Self::AboveNormal => "AboveNormal",
            Self::High => "High",
            Self::RealTime => "RealTime",
        }
    }
}

/// Scheduling priority limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityLimitSpec {
    /// Whether the priority is applied
    pub enabled: bool,
    /// Level 0..=5
    pub level: i32,
}

impl Default for PriorityLimitSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 2,
        }
    }
}

impl PriorityLimitSpec {
    /// Effective priority class
    #[must_use]
    pub const fn class(&self) -> PriorityClass {
        PriorityClass::from_level(self.level)
    }
}

/// One named resource limit configuration. Identity is the `name`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    /// Unique name
    pub name: String,
    /// Disabled configs never apply limits nor register monitors
    pub enabled: bool,
    /// Executables governed by this config
    pub paths: Vec<PathMatcher>,
    /// CPU limits
    pub cpu: CpuLimitSpec,
    /// Memory limits
    pub memory: MemoryLimitSpec,
    /// Disk limits
    pub disk: DiskLimitSpec,
    /// Network limits
    pub network: NetworkLimitSpec,
    /// Scheduling priority
    pub priority: PriorityLimitSpec,
}

impl ResourceLimitConfig {
    /// Enabled config with no limits and no paths
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Add an executable path
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(PathMatcher::new(path));
        self
    }

    /// Set the memory limits
    #[must_use]
    pub const fn with_memory(mut self, memory: MemoryLimitSpec) -> Self {
        self.memory = memory;
        self
    }

    /// Set the CPU limits
    #[must_use]
    pub const fn with_cpu(mut self, cpu: CpuLimitSpec) -> Self {
        self.cpu = cpu;
        self
    }

    /// Set the disk limits
    #[must_use]
    pub const fn with_disk(mut self, disk: DiskLimitSpec) -> Self {
        self.disk = disk;
        self
    }

    /// Set the network limits
    #[must_use]
    pub const fn with_network(mut self, network: NetworkLimitSpec) -> Self {
        self.network = network;
        self
    }

    /// Set the priority
    #[must_use]
    pub const fn with_priority(mut self, priority: PriorityLimitSpec) -> Self {
        self.priority = priority;
        self
    }
}

/// Governor tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    /// Reconciliation tick period
    pub tick_interval_ms: u64,
    /// Memory monitor cadence
    pub memory_interval_ms: u64,
    /// Disk monitor cadence
    pub disk_interval_ms: u64,
    /// Minimum spacing between two valid disk samples of one process
    pub disk_min_sample_ms: u64,
    /// Bound on joining a background task at stop
    pub stop_timeout_ms: u64,
    /// Mount point of the cgroup v2 hierarchy
    pub cgroup_root: PathBuf,
    /// Kill every member when a group's last handle is closed
    pub kill_on_close: bool,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 300,
            memory_interval_ms: 2_000,
            disk_interval_ms: 1_000,
            disk_min_sample_ms: 100,
            stop_timeout_ms: 3_000,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            kill_on_close: true,
        }
    }
}

impl GovernorSettings {
    /// Tick period
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Memory monitor cadence
    #[must_use]
    pub const fn memory_interval(&self) -> Duration {
        Duration::from_millis(self.memory_interval_ms)
    }

    /// Disk monitor cadence
    #[must_use]
    pub const fn disk_interval(&self) -> Duration {
        Duration::from_millis(self.disk_interval_ms)
    }

    /// Minimum disk sample spacing
    #[must_use]
    pub const fn disk_min_sample(&self) -> Duration {
        Duration::from_millis(self.disk_min_sample_ms)
    }

    /// Bounded join timeout
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Notifications from the configuration collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// The configuration list was replaced
    Changed(Vec<ResourceLimitConfig>),
    /// The user asked to apply the stored configuration now
    ApplyRequested,
}

/// The external configuration store
pub trait ConfigSource: Send + Sync {
    /// Current configuration list
    ///
    /// # Errors
    /// Returns error if the store cannot be read
    fn configs(&self) -> Result<Vec<ResourceLimitConfig>>;
}

/// In-memory configuration source
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    configs: std::sync::RwLock<Vec<ResourceLimitConfig>>,
}

impl StaticConfigSource {
    /// Source that always returns `configs`
    #[must_use]
    pub const fn new(configs: Vec<ResourceLimitConfig>) -> Self {
        Self {
            configs: std::sync::RwLock::new(configs),
        }
    }

    /// Replace the stored list
    pub fn set(&self, configs: Vec<ResourceLimitConfig>) {
        let mut guard = self
            .configs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = configs;
    }
}

impl ConfigSource for StaticConfigSource {
    fn configs(&self) -> Result<Vec<ResourceLimitConfig>> {
        Ok(self
            .configs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}
