//! Resource-group backend traits for pluggable implementations

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use procgov_core::{Error, MemorySize, ProcessId, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Group-level CPU rate control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuRateControl {
    /// Weight-based share, 1..=9 (5 is neutral)
    Weight(u32),
    /// Hard cap in hundredths of a percent of the whole machine, 100..=10000
    HardCap(u32),
}

/// Group-level network rate control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRateControl {
    /// Maximum outgoing bandwidth
    pub max_bytes_per_sec: u64,
    /// DSCP tag, 0..=63
    pub dscp_tag: Option<u8>,
}

/// A kernel resource-group handle
///
/// Implementations:
/// - [`CGroupController`](crate::CGroupController) - Production CGroup v2
/// - [`MockGroup`] - Testing without filesystem
///
/// # Thread Safety
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait GroupHandle: Send + Sync + fmt::Debug {
    /// Name the group was created under
    fn name(&self) -> &str;

    /// Make closing the last handle terminate every member
    async fn set_kill_on_close(&self, enabled: bool) -> Result<()>;

    /// Assign a process to this group
    ///
    /// # Errors
    /// Returns error if the process cannot be assigned
    async fn add_process(&self, pid: ProcessId) -> Result<()>;

    /// Set group CPU rate control
    async fn set_cpu_rate(&self, control: CpuRateControl) -> Result<()>;

    /// Set group memory cap
    async fn set_memory_limit(&self, limit: MemorySize) -> Result<()>;

    /// Set group bandwidth cap; [`Error::Unsupported`] when the kernel
    /// offers no such control
    async fn set_network_rate(&self, control: NetworkRateControl) -> Result<()>;

    /// Release the handle. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Factory for kernel resource groups
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Create (or join) the kernel group for `name`
    ///
    /// # Errors
    /// Returns error if the group cannot be created
    async fn create_group(&self, name: &str) -> Result<Box<dyn GroupHandle>>;
}

/// Recorded state of one mock group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockGroupState {
    /// Assigned processes
    pub processes: Vec<ProcessId>,
    /// Last CPU rate control
    pub cpu_rate: Option<CpuRateControl>,
    /// Last memory cap
    pub memory_limit: Option<MemorySize>,
    /// Last network control
    pub network_rate: Option<NetworkRateControl>,
    /// Kill-on-close flag
    pub kill_on_close: bool,
    /// Handles currently open
    pub open_handles: usize,
    /// Times a handle was closed
    pub closed: usize,
}

#[derive(Default)]
struct MockState {
    groups: HashMap<String, MockGroupState>,
    call_count: usize,
    fail_create: bool,
    network_unsupported: bool,
    rejected: HashSet<ProcessId>,
}

/// Mock backend for testing (doesn't touch filesystem)
///
/// Every kernel operation increments a shared call counter.
///
/// # Example
/// ```
/// use procgov_cgroup::{CpuRateControl, MockBackend, ResourceBackend};
/// use procgov_core::ProcessId;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = MockBackend::new();
/// let group = backend.create_group("editors").await.unwrap();
///
/// group.set_cpu_rate(CpuRateControl::Weight(3)).await.unwrap();
/// group.add_process(ProcessId::from_raw(123)).await.unwrap();
///
/// let state = backend.group("editors").await.unwrap();
/// assert_eq!(state.processes, vec![ProcessId::from_raw(123)]);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Create a new mock backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of kernel calls made (for testing)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.call_count
    }

    /// Recorded state of a group (for testing)
    pub async fn group(&self, name: &str) -> Option<MockGroupState> {
        self.state.lock().await.groups.get(name).cloned()
    }

    /// Make `create_group` fail (for testing degraded mode)
    pub async fn set_fail_create(&self, fail: bool) {
        self.state.lock().await.fail_create = fail;
    }

    /// Report network control as absent (for testing soft-fail)
    pub async fn set_network_unsupported(&self, unsupported: bool) {
        self.state.lock().await.network_unsupported = unsupported;
    }

    /// Make assignments of `pid` fail (for testing)
    pub async fn reject_process(&self, pid: ProcessId) {
        self.state.lock().await.rejected.insert(pid);
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceBackend for MockBackend {
    async fn create_group(&self, name: &str) -> Result<Box<dyn GroupHandle>> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.fail_create {
            return Err(Error::PermissionDenied {
                operation: format!("Mock: create group {name}"),
            });
        }

        state.groups.entry(name.to_string()).or_default().open_handles += 1;

        tracing::debug!(group = name, "Mock: Created group");

        Ok(Box::new(MockGroup {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}

/// Handle produced by [`MockBackend`]
pub struct MockGroup {
    name: String,
    state: Arc<Mutex<MockState>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MockGroup {
    async fn with_group<T>(&self, f: impl FnOnce(&mut MockGroupState) -> T) -> T {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        f(state.groups.entry(self.name.clone()).or_default())
    }
}

impl fmt::Debug for MockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockGroup")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl GroupHandle for MockGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_kill_on_close(&self, enabled: bool) -> Result<()> {
        self.with_group(|g| g.kill_on_close = enabled).await;
        Ok(())
    }

    async fn add_process(&self, pid: ProcessId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.rejected.contains(&pid) {
            return Err(Error::PermissionDenied {
                operation: format!("Mock: assign process {pid}"),
            });
        }

        let group = state.groups.entry(self.name.clone()).or_default();
        if !group.processes.contains(&pid) {
            group.processes.push(pid);
        }

        tracing::debug!(
            group = %self.name,
            pid = pid.as_raw(),
            total_processes = group.processes.len(),
            "Mock: Added process"
        );

        Ok(())
    }

    async fn set_cpu_rate(&self, control: CpuRateControl) -> Result<()> {
        self.with_group(|g| g.cpu_rate = Some(control)).await;
        tracing::debug!(group = %self.name, ?control, "Mock: Set CPU rate");
        Ok(())
    }

    async fn set_memory_limit(&self, limit: MemorySize) -> Result<()> {
        self.with_group(|g| g.memory_limit = Some(limit)).await;
        tracing::debug!(group = %self.name, limit_mb = limit.as_mb(), "Mock: Set memory limit");
        Ok(())
    }

    async fn set_network_rate(&self, control: NetworkRateControl) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.network_unsupported {
            return Err(Error::Unsupported {
                capability: "network rate control".to_string(),
            });
        }

        state.groups.entry(self.name.clone()).or_default().network_rate = Some(control);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        self.with_group(|g| {
            g.open_handles = g.open_handles.saturating_sub(1);
            g.closed += 1;
        })
        .await;

        tracing::debug!(group = %self.name, "Mock: Closed group");
        Ok(())
    }
}
