//! Memory throttling: group cap, per-process working-set bounds and
//! registration with the memory monitor

use procgov_cgroup::ProcessControl;
use procgov_core::{MemoryLimitSpec, ProcessInfo};
use tracing::{debug, warn};

use super::{Target, group_level, per_process};
use crate::monitor::{MemoryEntry, MemoryMonitor};

/// Apply `spec` to `target`.
///
/// Per-process bounds are set whether or not the group cap could be.
pub async fn apply(
    target: &Target<'_>,
    spec: &MemoryLimitSpec,
    control: &dyn ProcessControl,
    monitor: &MemoryMonitor,
) -> bool {
    let cap = spec.cap();
    if cap.is_zero() {
        warn!(group = target.group, "Memory cap is zero, memory limits not applied");
        return false;
    }

    let mut success = match target.handle {
        Some(handle) => {
            debug!(group = target.group, limit_mb = cap.as_mb(), "Setting group memory cap");
            group_level(target.group, "Set memory cap", handle.set_memory_limit(cap).await)
        }
        None => {
            warn!(group = target.group, "No kernel group, only per-process memory bounds applied");
            false
        }
    };

    let min = control.page_size();
    for process in target.members {
        let result = control.set_working_set_bounds(process.pid, min, cap).await;
        success &= per_process(target.group, process, "Set working-set bounds", result);
    }

    if spec.enable_monitoring {
        for process in target.members {
            success &= register(target.group, process, spec, monitor).await;
        }
    } else {
        unregister_all(target.group, target.members, monitor).await;
    }

    success
}

/// Register every member with the monitor without touching the kernel
pub async fn resume(target: &Target<'_>, spec: &MemoryLimitSpec, monitor: &MemoryMonitor) -> bool {
    if !spec.enable_monitoring || spec.cap().is_zero() {
        return true;
    }

    let mut success = true;
    for process in target.members {
        success &= register(target.group, process, spec, monitor).await;
    }
    success
}

/// Drop every member from the monitor
pub async fn unregister_all(group: &str, members: &[ProcessInfo], monitor: &MemoryMonitor) {
    for process in members {
        if let Err(e) = monitor.unregister(process.pid).await {
            warn!(group, pid = process.pid.as_raw(), error = %e, "Failed to stop memory monitoring");
        }
    }
}

async fn register(
    group: &str,
    process: &ProcessInfo,
    spec: &MemoryLimitSpec,
    monitor: &MemoryMonitor,
) -> bool {
    match monitor
        .register(MemoryEntry::from_spec(process.clone(), spec))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(group, pid = process.pid.as_raw(), error = %e, "Failed to monitor memory");
            false
        }
    }
}
