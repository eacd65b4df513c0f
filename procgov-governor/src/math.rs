//! Affinity and rate math
//!
//! Pure conversions from configured values to the controls the kernel
//! seams accept. Out-of-range inputs are clamped, never rejected.

use std::time::Duration;

use procgov_cgroup::{CpuRateControl, NetworkRateControl};
use procgov_core::{AffinityMask, AffinityMode, BYTES_PER_MB, CpuRateMode, NetworkLimitSpec};

/// Longest single disk suspension, as a fraction of a second
pub const MAX_SUSPEND_FRACTION: f64 = 0.9;

/// Clamp a relative weight into `1..=9`
#[must_use]
pub fn clamp_weight(weight: i32) -> u32 {
    weight.clamp(1, 9).unsigned_abs()
}

/// Hard-cap rate in hundredths of a percent for a cap given in percent
/// (clamped into `1..=100`)
#[must_use]
pub fn cap_rate(percent: i32) -> u32 {
    percent.clamp(1, 100).unsigned_abs() * 100
}

/// Group rate control for a configured mode; `None` leaves the group alone
#[must_use]
pub fn cpu_rate_control(mode: CpuRateMode) -> Option<CpuRateControl> {
    match mode {
        CpuRateMode::None => None,
        CpuRateMode::RelativeWeight(w) => Some(CpuRateControl::Weight(clamp_weight(w))),
        CpuRateMode::AbsoluteCap(p) => Some(CpuRateControl::HardCap(cap_rate(p))),
    }
}

/// Affinity mask for a configured mode on a machine with `cores` cores.
///
/// `CoreCount(n)` selects the `clamp(n, 1, cores)` lowest cores,
/// `CoreIndex(i)` the single core `clamp(i, 0, cores - 1)`.
#[must_use]
pub fn affinity_mask(mode: AffinityMode, cores: usize) -> Option<AffinityMask> {
    let cores = i32::try_from(cores.clamp(1, AffinityMask::MAX_CORES)).unwrap_or(1);

    match mode {
        AffinityMode::None => None,
        AffinityMode::CoreCount(n) => {
            let n = n.clamp(1, cores).unsigned_abs();
            let bits = if n >= 64 { u64::MAX } else { (1u64 << n) - 1 };
            Some(AffinityMask::from_bits(bits))
        }
        AffinityMode::CoreIndex(i) => {
            let i = i.clamp(0, cores - 1).unsigned_abs();
            Some(AffinityMask::from_bits(1u64 << i))
        }
    }
}

/// DSCP tag clamped into `0..=63`
#[must_use]
pub fn dscp_tag(value: i32) -> u8 {
    u8::try_from(value.clamp(0, 63)).unwrap_or(0)
}

/// Group network control for a spec
#[must_use]
pub fn network_rate_control(spec: &NetworkLimitSpec) -> NetworkRateControl {
    NetworkRateControl {
        max_bytes_per_sec: spec.max_rate_kb_per_sec.saturating_mul(1024),
        dscp_tag: spec.specify_priority.then(|| dscp_tag(spec.priority_value)),
    }
}

/// Throughput in MB/s for `bytes` transferred over `elapsed`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn throughput_mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / BYTES_PER_MB as f64 / secs
}

/// How long to suspend a process measured at `throughput` MB/s against a
/// cap of `cap` MB/s.
///
/// `overage = (throughput - cap) / throughput` is the share of time the
/// process must stand still to bring its average down to the cap; a single
/// suspension is capped at 900 ms. `None` when within the cap.
#[must_use]
pub fn suspend_duration(throughput: f64, cap: f64) -> Option<Duration> {
    if throughput <= cap || throughput <= 0.0 {
        return None;
    }

    let overage = (throughput - cap) / throughput;
    let millis = (overage.min(MAX_SUSPEND_FRACTION) * 1000.0).round();

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = millis as u64;

    (millis > 0).then(|| Duration::from_millis(millis))
}
