//! Disk throttling: registration with the disk monitor

use std::collections::HashSet;

use procgov_core::{DiskLimitSpec, ProcessId};
use tracing::warn;

use super::Target;
use crate::monitor::DiskMonitor;

/// Register every member of `target` with the disk monitor
pub async fn apply(target: &Target<'_>, spec: &DiskLimitSpec, monitor: &DiskMonitor) -> bool {
    let mut success = true;
    for process in target.members {
        if let Err(e) = monitor
            .register(process.clone(), spec.rate_limit_mb_per_sec)
            .await
        {
            warn!(
                group = target.group,
                pid = process.pid.as_raw(),
                error = %e,
                "Failed to rate-limit disk I/O"
            );
            success = false;
        }
    }
    success
}

/// Drop every member of `target` from the disk monitor
pub async fn unregister_all(target: &Target<'_>, monitor: &DiskMonitor) {
    unregister_except(target, &HashSet::new(), monitor).await;
}

/// Drop the members of `target` not in `retained`.
///
/// Retained entries keep their last sample, so a process that stays
/// rate-limited across a rebuild is measured against its old baseline.
pub async fn unregister_except(
    target: &Target<'_>,
    retained: &HashSet<ProcessId>,
    monitor: &DiskMonitor,
) {
    for process in target.members {
        if retained.contains(&process.pid) {
            continue;
        }
        if let Err(e) = monitor.unregister(process.pid).await {
            warn!(group = target.group, pid = process.pid.as_raw(), error = %e, "Failed to stop disk monitoring");
        }
    }
}
