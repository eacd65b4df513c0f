//! Per-resource throttlers
//!
//! Each throttler applies one dimension of a group's limits and reports
//! success as a boolean; failures are logged here and never propagated.
//! A process exiting mid-operation is not a failure.

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;
pub mod priority;

use procgov_cgroup::GroupHandle;
use procgov_core::{ProcessInfo, Result};
use tracing::{debug, warn};

/// The part of a resource group a throttler works on
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// Group (config) name
    pub group: &'a str,
    /// Kernel group, if one could be created
    pub handle: Option<&'a dyn GroupHandle>,
    /// Member processes
    pub members: &'a [ProcessInfo],
}

/// Log the outcome of a per-process operation; true unless it failed for
/// a reason other than the process having exited
pub(crate) fn per_process(group: &str, process: &ProcessInfo, operation: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_process_gone() => {
            debug!(group, pid = process.pid.as_raw(), "{} skipped, process exited", operation);
            true
        }
        Err(e) => {
            warn!(
                group,
                pid = process.pid.as_raw(),
                process = %process.name,
                error = %e,
                "{} failed",
                operation
            );
            false
        }
    }
}

/// Log the outcome of a group-level operation
pub(crate) fn group_level(group: &str, operation: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(group, error = %e, "{} failed", operation);
            false
        }
    }
}
