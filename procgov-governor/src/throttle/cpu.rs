//! CPU throttling: group rate control plus per-process affinity

use procgov_cgroup::ProcessControl;
use procgov_core::CpuLimitSpec;
use tracing::{debug, warn};

use super::{Target, group_level, per_process};
use crate::math::{affinity_mask, cpu_rate_control};

/// Apply `spec` to `target`.
///
/// Needs a kernel group: without one nothing is applied. Affinity is
/// applied to every member even when some of them fail.
pub async fn apply(target: &Target<'_>, spec: &CpuLimitSpec, control: &dyn ProcessControl) -> bool {
    let Some(handle) = target.handle else {
        warn!(group = target.group, "No kernel group, CPU limits not applied");
        return false;
    };

    let mut success = true;

    if let Some(rate) = cpu_rate_control(spec.rate_mode) {
        debug!(group = target.group, ?rate, "Applying CPU rate control");
        success &= group_level(target.group, "Set CPU rate", handle.set_cpu_rate(rate).await);
    }

    if let Some(mask) = affinity_mask(spec.affinity_mode, control.logical_cores()) {
        debug!(group = target.group, %mask, members = target.members.len(), "Applying CPU affinity");
        for process in target.members {
            let result = control.set_affinity(process.pid, mask).await;
            success &= per_process(target.group, process, "Set affinity", result);
        }
    }

    success
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_cgroup::{CpuRateControl, MockBackend, MockProcessControl, ResourceBackend};
    use procgov_core::{AffinityMode, CpuRateMode, ProcessId, ProcessInfo};

    fn members() -> Vec<ProcessInfo> {
        (1..=3)
            .map(|pid| ProcessInfo::new(ProcessId::from_raw(pid), "x", None))
            .collect()
    }

    #[tokio::test]
    async fn test_weight_and_affinity() {
        let backend = MockBackend::new();
        let control = MockProcessControl::new(8);
        let members = members();
        for m in &members {
            control.spawn(m.clone()).await;
        }
        let handle = backend.create_group("A").await.unwrap();

        let spec = CpuLimitSpec {
            enabled: true,
            rate_mode: CpuRateMode::RelativeWeight(15),
            affinity_mode: AffinityMode::CoreCount(3),
        };
        let target = Target {
            group: "A",
            handle: Some(handle.as_ref()),
            members: &members,
        };

        assert!(apply(&target, &spec, &control).await);
        assert_eq!(
            backend.group("A").await.unwrap().cpu_rate,
            Some(CpuRateControl::Weight(9))
        );
        for m in &members {
            let p = control.process(m.pid).await.unwrap();
            assert_eq!(p.affinity.unwrap().bits(), 0b111);
        }
    }

    #[tokio::test]
    async fn test_no_handle_applies_nothing() {
        let control = MockProcessControl::new(8);
        let members = members();
        for m in &members {
            control.spawn(m.clone()).await;
        }

        let spec = CpuLimitSpec {
            enabled: true,
            rate_mode: CpuRateMode::AbsoluteCap(50),
            affinity_mode: AffinityMode::CoreIndex(2),
        };
        let target = Target {
            group: "A",
            handle: None,
            members: &members,
        };

        assert!(!apply(&target, &spec, &control).await);
        assert_eq!(control.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_exited_member_does_not_block_others() {
        let backend = MockBackend::new();
        let control = MockProcessControl::new(8);
        let members = members();
        // pid 1 never started
        for m in &members[1..] {
            control.spawn(m.clone()).await;
        }
        let handle = backend.create_group("A").await.unwrap();

        let spec = CpuLimitSpec {
            enabled: true,
            rate_mode: CpuRateMode::None,
            affinity_mode: AffinityMode::CoreIndex(5),
        };
        let target = Target {
            group: "A",
            handle: Some(handle.as_ref()),
            members: &members,
        };

        assert!(apply(&target, &spec, &control).await);
        assert_eq!(backend.group("A").await.unwrap().cpu_rate, None);
        for m in &members[1..] {
            let p = control.process(m.pid).await.unwrap();
            assert_eq!(p.affinity.unwrap().bits(), 1 << 5);
        }
    }
}
