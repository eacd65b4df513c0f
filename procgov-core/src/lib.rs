//! Procgov Core - Foundation types, configuration model and events
//!
//! This crate provides the value types shared by the kernel layer
//! (`procgov-cgroup`), the governor engine (`procgov-governor`) and the CLI.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod resources;
pub mod types;

pub use config::{
    AffinityMode, ConfigEvent, ConfigSource, CpuLimitSpec, CpuRateMode, DiskLimitSpec,
    GovernorSettings, MemoryLimitSpec, NetworkLimitSpec, OveruseAction, PathMatcher,
    PriorityClass, PriorityLimitSpec, ResourceLimitConfig, StaticConfigSource,
};
pub use error::{Error, Result};
pub use events::{describe_limits, render_report, GovernorEvent, GroupSummary};
pub use resources::{AffinityMask, IoCounters, MemorySize, BYTES_PER_MB};
pub use types::{ProcessId, ProcessInfo};
