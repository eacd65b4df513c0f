//! Resource groups
//!
//! A group owns the kernel handle for one config and the processes matched
//! to it, and runs the throttlers over them in a fixed order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use procgov_cgroup::{GroupHandle, ProcessControl, ResourceBackend};
use procgov_core::{
    GovernorEvent, GovernorSettings, GroupSummary, ProcessId, ProcessInfo, ResourceLimitConfig,
};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::monitor::{DiskMonitor, MemoryMonitor};
use crate::plan::{GroupPlan, PriorGroup};
use crate::throttle::{self, Target};

/// Services shared by every group of every generation
pub struct Services {
    /// Kernel group factory
    pub backend: Arc<dyn ResourceBackend>,
    /// Per-process OS operations
    pub control: Arc<dyn ProcessControl>,
    /// Working-set monitor
    pub memory: Arc<MemoryMonitor>,
    /// Disk rate limiter
    pub disk: Arc<DiskMonitor>,
    /// Event delivery
    pub events: Arc<EventBus>,
    /// Baseline kill-on-close flag for new kernel groups
    pub kill_on_close: bool,
}

impl Services {
    /// Build the services, with both monitors idle
    #[must_use]
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        control: Arc<dyn ProcessControl>,
        settings: &GovernorSettings,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let memory = Arc::new(MemoryMonitor::new(
            Arc::clone(&control),
            Arc::clone(&events),
            settings.memory_interval(),
            settings.stop_timeout(),
        ));
        let disk = Arc::new(DiskMonitor::new(
            Arc::clone(&control),
            Arc::clone(&events),
            settings.disk_interval(),
            settings.disk_min_sample(),
            settings.stop_timeout(),
        ));

        Self {
            backend,
            control,
            memory,
            disk,
            events,
            kill_on_close: settings.kill_on_close,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("memory", &self.memory)
            .field("disk", &self.disk)
            .field("kill_on_close", &self.kill_on_close)
            .finish_non_exhaustive()
    }
}

/// Processes governed by one config
pub struct ResourceGroup {
    config: Arc<ResourceLimitConfig>,
    services: Arc<Services>,
    handle: Option<Box<dyn GroupHandle>>,
    members: Vec<ProcessInfo>,
    is_new: bool,
    disposed: bool,
}

impl ResourceGroup {
    /// Create an empty group, acquiring a kernel group for enabled configs.
    ///
    /// Failing to get a kernel group is logged; the group then only
    /// applies per-process limits.
    pub async fn new(config: Arc<ResourceLimitConfig>, services: Arc<Services>) -> Self {
        let handle = if config.enabled {
            acquire_handle(&config.name, &services).await
        } else {
            None
        };

        Self {
            config,
            services,
            handle,
            members: Vec::new(),
            is_new: false,
            disposed: false,
        }
    }

    /// Build a group from a plan: acquire the handle, then assign members
    pub async fn from_plan(plan: GroupPlan, services: Arc<Services>) -> Self {
        let mut group = Self::new(plan.config, services).await;
        for process in plan.members {
            group.add_process(process).await;
        }
        group.is_new = plan.is_new;
        group
    }

    /// Config name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The config this group was built from
    #[must_use]
    pub fn config(&self) -> &Arc<ResourceLimitConfig> {
        &self.config
    }

    /// Member processes
    #[must_use]
    pub fn members(&self) -> &[ProcessInfo] {
        &self.members
    }

    /// Whether members are waiting for limits
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether a kernel group is held
    #[must_use]
    pub const fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Add a member; true if it was not a member yet.
    ///
    /// The process is kept as a member even if the kernel group refuses
    /// it, so per-process limits still reach it.
    pub async fn add_process(&mut self, process: ProcessInfo) -> bool {
        if self.members.iter().any(|m| m.pid == process.pid) {
            return false;
        }

        if let Some(handle) = &self.handle {
            assign(self.config.name.as_str(), handle.as_ref(), &process).await;
        } else {
            debug!(
                group = %self.config.name,
                pid = process.pid.as_raw(),
                "No kernel group, member tracked for per-process limits only"
            );
        }

        self.members.push(process);
        true
    }

    /// Apply every enabled limit to the members.
    ///
    /// Order: CPU, memory, priority, disk, network. A failing throttler
    /// does not stop the ones after it. Disabled or empty groups are left
    /// alone.
    pub async fn apply_limits(&mut self) -> bool {
        if !self.config.enabled || self.members.is_empty() {
            return true;
        }

        if self.handle.is_none() {
            debug!(group = %self.config.name, "Retrying kernel group creation");
            self.handle = acquire_handle(&self.config.name, &self.services).await;
            if let Some(handle) = &self.handle {
                for process in &self.members {
                    assign(&self.config.name, handle.as_ref(), process).await;
                }
            }
        }

        let config = Arc::clone(&self.config);
        let services = Arc::clone(&self.services);
        let target = Target {
            group: &config.name,
            handle: self.handle.as_deref(),
            members: &self.members,
        };

        info!(group = %config.name, members = target.members.len(), "Applying limits");

        let mut success = true;

        if config.cpu.enabled {
            success &= throttle::cpu::apply(&target, &config.cpu, &*services.control).await;
        }

        if config.memory.enabled {
            success &= throttle::memory::apply(
                &target,
                &config.memory,
                &*services.control,
                &services.memory,
            )
            .await;
        } else {
            // Clear registrations left by an earlier config of this name
            throttle::memory::unregister_all(target.group, target.members, &services.memory).await;
        }

        if config.priority.enabled {
            success &= throttle::priority::apply(&target, &config.priority, &*services.control).await;
        }

        if config.disk.enabled {
            success &= throttle::disk::apply(&target, &config.disk, &services.disk).await;
        }

        if config.network.enabled {
            success &= throttle::network::apply(&target, &config.network).await;
        }

        self.is_new = false;

        services.events.publish(GovernorEvent::LimitsApplied {
            group: config.name.clone(),
            success,
            timestamp: SystemTime::now(),
        });

        success
    }

    /// Re-register the members with the monitors, without kernel calls.
    ///
    /// Used for a group carried over from the previous generation whose
    /// limits are already in place.
    pub async fn resume_monitoring(&self) -> bool {
        if !self.config.enabled || self.members.is_empty() {
            return true;
        }

        let target = self.target();
        let mut success = true;

        if self.config.memory.enabled {
            success &=
                throttle::memory::resume(&target, &self.config.memory, &self.services.memory).await;
        }
        if self.config.disk.enabled {
            success &= throttle::disk::apply(&target, &self.config.disk, &self.services.disk).await;
        }

        success
    }

    /// Unregister members from the monitors, close the kernel group and
    /// forget the members. Safe to call more than once.
    pub async fn dispose(&mut self) {
        self.dispose_retaining(&HashSet::new()).await;
    }

    /// Like [`dispose`](Self::dispose), but leaves the disk monitor entries
    /// of `disk_retained` in place so their sampling state carries over to
    /// the group that takes them next.
    pub async fn dispose_retaining(&mut self, disk_retained: &HashSet<ProcessId>) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let target = self.target();
        throttle::memory::unregister_all(target.group, target.members, &self.services.memory).await;
        throttle::disk::unregister_except(&target, disk_retained, &self.services.disk).await;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!(group = %self.config.name, error = %e, "Failed to close kernel group");
            }
        }

        self.members.clear();
        self.is_new = false;
        debug!(group = %self.config.name, "Group disposed");
    }

    /// Snapshot for UI collaborators
    #[must_use]
    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            config: (*self.config).clone(),
            handle_ready: self.handle.is_some(),
            is_new: self.is_new,
            members: self.members.clone(),
        }
    }

    /// Members this group keeps registered with the disk monitor
    #[must_use]
    pub fn disk_rate_limited(&self) -> impl Iterator<Item = ProcessId> + '_ {
        let limited = self.config.enabled
            && self.config.disk.enabled
            && self.config.disk.rate_limit_mb_per_sec > 0;
        self.members
            .iter()
            .filter(move |_| limited)
            .map(|m| m.pid)
    }

    /// What the next generation needs to know about this group
    #[must_use]
    pub fn prior(&self) -> PriorGroup {
        PriorGroup {
            config: Arc::clone(&self.config),
            members: self.members.iter().map(|m| m.pid).collect(),
            pending: self.is_new,
        }
    }

    fn target(&self) -> Target<'_> {
        Target {
            group: &self.config.name,
            handle: self.handle.as_deref(),
            members: &self.members,
        }
    }
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("name", &self.config.name)
            .field("handle", &self.handle)
            .field("members", &self.members.len())
            .field("is_new", &self.is_new)
            .finish_non_exhaustive()
    }
}

async fn acquire_handle(name: &str, services: &Services) -> Option<Box<dyn GroupHandle>> {
    match services.backend.create_group(name).await {
        Ok(handle) => {
            if let Err(e) = handle.set_kill_on_close(services.kill_on_close).await {
                warn!(group = name, error = %e, "Failed to set kill-on-close");
            }
            Some(handle)
        }
        Err(e) => {
            warn!(
                group = name,
                error = %e,
                "Could not create kernel group, applying per-process limits only \
                 (is procgov running as root on a cgroup v2 host?)"
            );
            None
        }
    }
}

async fn assign(group: &str, handle: &dyn GroupHandle, process: &ProcessInfo) {
    if let Err(e) = handle.add_process(process.pid).await {
        if e.is_process_gone() {
            debug!(group, pid = process.pid.as_raw(), "Process exited before assignment");
        } else {
            warn!(
                group,
                pid = process.pid.as_raw(),
                process = %process.name,
                error = %e,
                "Failed to assign process to kernel group"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_cgroup::{MockBackend, MockProcessControl};
    use procgov_core::{
        CpuLimitSpec, CpuRateMode, DiskLimitSpec, MemoryLimitSpec, PriorityClass,
        PriorityLimitSpec, ProcessId,
    };

    struct Fixture {
        backend: MockBackend,
        control: Arc<MockProcessControl>,
        services: Arc<Services>,
    }

    async fn fixture(pids: &[i32]) -> Fixture {
        let backend = MockBackend::new();
        let control = Arc::new(MockProcessControl::new(8));
        for &pid in pids {
            control.spawn(info(pid)).await;
        }
        let services = Arc::new(Services::new(
            Arc::new(backend.clone()),
            control.clone(),
            &GovernorSettings::default(),
        ));
        Fixture {
            backend,
            control,
            services,
        }
    }

    fn info(pid: i32) -> ProcessInfo {
        ProcessInfo::new(ProcessId::from_raw(pid), "x", Some("/bin/x".into()))
    }

    fn full_config() -> Arc<ResourceLimitConfig> {
        Arc::new(
            ResourceLimitConfig::new("A")
                .with_path("/bin/x")
                .with_cpu(CpuLimitSpec {
                    enabled: true,
                    rate_mode: CpuRateMode::AbsoluteCap(50),
                    ..CpuLimitSpec::default()
                })
                .with_memory(MemoryLimitSpec {
                    enabled: true,
                    cap_mb: 100,
                    ..MemoryLimitSpec::default()
                })
                .with_priority(PriorityLimitSpec {
                    enabled: true,
                    level: 1,
                })
                .with_disk(DiskLimitSpec {
                    enabled: true,
                    rate_limit_mb_per_sec: 10,
                }),
        )
    }

    #[tokio::test]
    async fn test_add_process_is_idempotent() {
        let f = fixture(&[1]).await;
        let mut group = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;

        assert!(group.add_process(info(1)).await);
        assert!(!group.add_process(info(1)).await);
        assert_eq!(group.members().len(), 1);
        assert_eq!(
            f.backend.group("A").await.unwrap().processes,
            vec![ProcessId::from_raw(1)]
        );
        assert!(f.backend.group("A").await.unwrap().kill_on_close);
    }

    #[tokio::test]
    async fn test_rejected_assignment_keeps_member() {
        let f = fixture(&[1]).await;
        f.backend.reject_process(ProcessId::from_raw(1)).await;
        let mut group = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;

        group.add_process(info(1)).await;
        assert_eq!(group.members().len(), 1);
        assert!(group.apply_limits().await);
        assert_eq!(
            f.control.process(ProcessId::from_raw(1)).await.unwrap().priority,
            Some(PriorityClass::BelowNormal)
        );

        group.dispose().await;
    }

    #[tokio::test]
    async fn test_apply_limits_clears_is_new() {
        let f = fixture(&[1, 2]).await;
        let plan = GroupPlan {
            config: full_config(),
            members: vec![info(1), info(2)],
            is_new: true,
            config_changed: false,
        };
        let mut group = ResourceGroup::from_plan(plan, Arc::clone(&f.services)).await;
        assert!(group.is_new());

        assert!(group.apply_limits().await);
        assert!(!group.is_new());
        assert!(f.services.memory.contains(ProcessId::from_raw(1)));
        assert!(f.services.disk.contains(ProcessId::from_raw(2)));

        group.dispose().await;
        assert!(f.services.memory.is_empty());
        assert!(f.services.disk.is_empty());
        assert!(!f.services.memory.is_monitoring());
        assert_eq!(f.backend.group("A").await.unwrap().open_handles, 0);
    }

    #[tokio::test]
    async fn test_degraded_group_applies_per_process_limits() {
        let f = fixture(&[1]).await;
        f.backend.set_fail_create(true).await;

        let mut group = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;
        assert!(!group.has_handle());
        group.add_process(info(1)).await;

        assert!(!group.apply_limits().await);
        let process = f.control.process(ProcessId::from_raw(1)).await.unwrap();
        assert_eq!(process.priority, Some(PriorityClass::BelowNormal));
        assert!(process.working_set_bounds.is_some());

        group.dispose().await;
    }

    #[tokio::test]
    async fn test_handle_reacquired_on_apply() {
        let f = fixture(&[1]).await;
        f.backend.set_fail_create(true).await;
        let mut group = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;
        group.add_process(info(1)).await;

        f.backend.set_fail_create(false).await;
        assert!(group.apply_limits().await);
        assert!(group.has_handle());
        assert_eq!(
            f.backend.group("A").await.unwrap().processes,
            vec![ProcessId::from_raw(1)]
        );

        group.dispose().await;
    }

    #[tokio::test]
    async fn test_memory_disabled_clears_stale_registration() {
        let f = fixture(&[1]).await;
        f.services
            .memory
            .register(crate::monitor::MemoryEntry::from_spec(
                info(1),
                &MemoryLimitSpec {
                    enabled: true,
                    cap_mb: 10,
                    ..MemoryLimitSpec::default()
                },
            ))
            .await
            .unwrap();

        let config = Arc::new(ResourceLimitConfig::new("A").with_path("/bin/x"));
        let mut group = ResourceGroup::new(config, Arc::clone(&f.services)).await;
        group.add_process(info(1)).await;
        group.apply_limits().await;

        assert!(f.services.memory.is_empty());
        assert!(!f.services.memory.is_monitoring());
    }

    #[tokio::test]
    async fn test_empty_and_disabled_groups_apply_nothing() {
        let f = fixture(&[1]).await;
        let mut empty = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;
        assert!(empty.apply_limits().await);

        let mut disabled_config = (*full_config()).clone();
        disabled_config.enabled = false;
        let mut disabled = ResourceGroup::new(Arc::new(disabled_config), Arc::clone(&f.services)).await;
        disabled.add_process(info(1)).await;
        assert!(!disabled.has_handle());
        assert!(disabled.apply_limits().await);

        assert_eq!(f.control.call_count().await, 0);
        assert!(f.services.memory.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_twice() {
        let f = fixture(&[1]).await;
        let mut group = ResourceGroup::new(full_config(), Arc::clone(&f.services)).await;
        group.add_process(info(1)).await;

        group.dispose().await;
        group.dispose().await;
        assert!(group.members().is_empty());
        assert_eq!(f.backend.group("A").await.unwrap().closed, 1);
    }
}
