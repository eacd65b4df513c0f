//! Scheduling priority, set directly on each member

use procgov_cgroup::ProcessControl;
use procgov_core::PriorityLimitSpec;
use tracing::debug;

use super::{Target, per_process};

/// Apply `spec` to every member of `target`
pub async fn apply(target: &Target<'_>, spec: &PriorityLimitSpec, control: &dyn ProcessControl) -> bool {
    let class = spec.class();
    debug!(group = target.group, class = class.label(), "Setting priority class");

    let mut success = true;
    for process in target.members {
        let result = control.set_priority(process.pid, class).await;
        success &= per_process(target.group, process, "Set priority", result);
    }
    success
}
