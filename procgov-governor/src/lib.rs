//! Process resource governor engine
//!
//! Periodically snapshots the process table, matches processes to
//! configured groups by executable path, and applies CPU, memory, priority,
//! disk and network limits to groups that gained members. Memory and disk
//! limits are enforced continuously by two background monitors.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bus;
pub mod governor;
pub mod group;
pub mod math;
pub mod monitor;
pub mod plan;
pub mod throttle;

pub use bus::EventBus;
pub use governor::Governor;
pub use group::{ResourceGroup, Services};
pub use monitor::{DiskEntry, DiskMonitor, MemoryEntry, MemoryMonitor};
pub use plan::{GroupPlan, PriorGroup, plan_groups};
