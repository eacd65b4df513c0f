//! Resource limit implementations
//!
//! This module provides methods for setting CPU and memory limits
//! by writing to CGroup v2 control files

use std::sync::atomic::Ordering;

use async_trait::async_trait;
use procgov_core::{Error, MemorySize, ProcessId, Result};
use tokio::fs;
use tracing::debug;

use crate::backend::{CpuRateControl, GroupHandle, NetworkRateControl};
use crate::controller::{CGroupController, permission_or_io};

/// CFS period used for every hard cap, in microseconds
pub const CPU_PERIOD_US: u64 = 100_000;

/// Smallest quota the kernel accepts, in microseconds
pub const MIN_QUOTA_US: u64 = 1_000;

/// `cpu.weight` value for a relative weight of 1..=9
#[must_use]
pub fn cpu_weight(weight: u32) -> u32 {
    weight.clamp(1, 9) * 20
}

/// `cpu.max` quota for a hard cap given in hundredths of a percent of the
/// whole machine.
///
/// 10000 on a 4-core machine is 4 full CPUs per period.
#[must_use]
pub fn cpu_quota(rate: u32, cores: usize) -> u64 {
    let rate = u64::from(rate.clamp(1, 10_000));
    let cores = cores.max(1) as u64;
    (rate * CPU_PERIOD_US * cores / 10_000).max(MIN_QUOTA_US)
}

impl CGroupController {
    /// Set CPU rate control for this cgroup
    ///
    /// A weight sets `cpu.weight` and lifts any hard cap; a hard cap sets
    /// `cpu.max` and restores the default weight.
    pub async fn set_cpu_limit(&self, control: CpuRateControl) -> Result<()> {
        self.ensure_open()?;

        match control {
            CpuRateControl::Weight(weight) => {
                let value = cpu_weight(weight);
                debug!(group = %self.name, weight, cpu_weight = value, "Setting CPU weight");
                self.write_control("cpu.weight", &value.to_string(), "Set CPU weight")
                    .await?;
                self.remove_cpu_limit().await
            }
            CpuRateControl::HardCap(rate) => {
                let quota = cpu_quota(rate, self.cores);
                debug!(
                    group = %self.name,
                    rate,
                    quota,
                    period = CPU_PERIOD_US,
                    "Setting CPU hard cap"
                );
                self.write_control("cpu.max", &format!("{quota} {CPU_PERIOD_US}"), "Set CPU limit")
                    .await?;
                self.write_control("cpu.weight", "100", "Reset CPU weight").await
            }
        }
    }

    /// Set memory limit for this cgroup
    ///
    /// This sets the maximum amount of memory the cgroup can use.
    /// If exceeded, the kernel reclaims and eventually OOM-kills inside
    /// the cgroup.
    pub async fn set_memory_max(&self, limit: MemorySize) -> Result<()> {
        self.ensure_open()?;

        debug!(group = %self.name, "Setting memory limit to {}", limit);

        self.write_control("memory.max", &limit.as_bytes().to_string(), "Set memory limit")
            .await
    }

    /// Remove CPU limit (set to "max")
    ///
    /// This allows the cgroup to use unlimited CPU.
    pub async fn remove_cpu_limit(&self) -> Result<()> {
        debug!(group = %self.name, "Removing CPU limit");

        // "max" means unlimited
        self.write_control("cpu.max", &format!("max {CPU_PERIOD_US}"), "Remove CPU limit")
            .await
    }

    /// Remove memory limit (set to "max")
    ///
    /// This allows the cgroup to use unlimited memory.
    pub async fn remove_memory_limit(&self) -> Result<()> {
        debug!(group = %self.name, "Removing memory limit");

        self.write_control("memory.max", "max", "Remove memory limit")
            .await
    }

    async fn write_control(&self, file: &str, content: &str, operation: &str) -> Result<()> {
        fs::write(self.path.join(file), content)
            .await
            .map_err(|e| permission_or_io(operation, e))
    }
}

#[async_trait]
impl GroupHandle for CGroupController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_kill_on_close(&self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.kill_on_close.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn add_process(&self, pid: ProcessId) -> Result<()> {
        self.assign(pid).await
    }

    async fn set_cpu_rate(&self, control: CpuRateControl) -> Result<()> {
        self.set_cpu_limit(control).await
    }

    async fn set_memory_limit(&self, limit: MemorySize) -> Result<()> {
        self.set_memory_max(limit).await
    }

    async fn set_network_rate(&self, control: NetworkRateControl) -> Result<()> {
        self.ensure_open()?;
        debug!(
            group = %self.name,
            max_bytes_per_sec = control.max_bytes_per_sec,
            "Network rate control requested"
        );
        // cgroup v2 has no bandwidth controller; shaping needs tc/eBPF.
        Err(Error::Unsupported {
            capability: "network bandwidth limits on cgroup v2".to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.close_handle().await
    }
}
