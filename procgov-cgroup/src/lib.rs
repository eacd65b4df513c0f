//! Kernel resource groups and per-process OS controls
//!
//! This crate provides trait-based abstractions over the two things the
//! governor changes on a host: CGroup v2 resource groups
//! ([`ResourceBackend`]/[`GroupHandle`]) and individual processes
//! ([`ProcessControl`]), each with a production and a mock implementation.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod controller;
pub mod limits;
pub mod process;
pub mod procfs;

pub use backend::{
    CpuRateControl, GroupHandle, MockBackend, MockGroup, MockGroupState, NetworkRateControl,
    ResourceBackend,
};
pub use controller::{CGROUP_ROOT, CGroupBackend, CGroupController};
pub use process::{MockProcess, MockProcessControl, ProcessControl};
pub use procfs::LinuxProcessControl;
