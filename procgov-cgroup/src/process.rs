//! Per-process OS controls
//!
//! Everything the throttlers do to an individual process (as opposed to a
//! kernel group) goes through [`ProcessControl`], so the engine can run
//! against [`MockProcessControl`] in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use procgov_core::{
    AffinityMask, Error, IoCounters, MemorySize, PriorityClass, ProcessId, ProcessInfo, Result,
};
use tokio::sync::Mutex;

/// OS operations on individual processes
///
/// Operations on a process that no longer exists fail with
/// [`Error::ProcessGone`].
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Every process currently running
    async fn snapshot(&self) -> Result<Vec<ProcessInfo>>;

    /// Number of logical cores (at most [`AffinityMask::MAX_CORES`])
    fn logical_cores(&self) -> usize;

    /// Size of one memory page
    fn page_size(&self) -> MemorySize;

    /// Restrict every thread of `pid` to `mask`
    async fn set_affinity(&self, pid: ProcessId, mask: AffinityMask) -> Result<()>;

    /// Set the scheduling class of every thread of `pid`
    async fn set_priority(&self, pid: ProcessId, class: PriorityClass) -> Result<()>;

    /// Bound the resident set of `pid`
    async fn set_working_set_bounds(
        &self,
        pid: ProcessId,
        min: MemorySize,
        max: MemorySize,
    ) -> Result<()>;

    /// Resident set size of `pid`
    async fn working_set(&self, pid: ProcessId) -> Result<MemorySize>;

    /// Push every resident page of `pid` out to the backing store
    async fn trim_working_set(&self, pid: ProcessId) -> Result<()>;

    /// Kill `pid`
    async fn terminate(&self, pid: ProcessId) -> Result<()>;

    /// Cumulative storage I/O of `pid`
    async fn io_counters(&self, pid: ProcessId) -> Result<IoCounters>;

    /// Stop every thread of `pid`
    async fn suspend(&self, pid: ProcessId) -> Result<()>;

    /// Continue every thread of `pid`
    async fn resume(&self, pid: ProcessId) -> Result<()>;
}

/// Recorded state of one mock process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockProcess {
    /// Snapshot entry
    pub info: ProcessInfo,
    /// Reported resident set
    pub working_set: MemorySize,
    /// Reported cumulative I/O
    pub io: IoCounters,
    /// Last affinity set
    pub affinity: Option<AffinityMask>,
    /// Last priority set
    pub priority: Option<PriorityClass>,
    /// Last working-set bounds set
    pub working_set_bounds: Option<(MemorySize, MemorySize)>,
    /// Currently stopped
    pub suspended: bool,
    /// Times suspended
    pub suspend_count: usize,
    /// Times trimmed
    pub trim_count: usize,
}

impl MockProcess {
    fn new(info: ProcessInfo) -> Self {
        Self {
            info,
            working_set: MemorySize::from_mb(10),
            io: IoCounters::default(),
            affinity: None,
            priority: None,
            working_set_bounds: None,
            suspended: false,
            suspend_count: 0,
            trim_count: 0,
        }
    }
}

struct MockProcessState {
    processes: BTreeMap<ProcessId, MockProcess>,
    terminated: Vec<ProcessId>,
    call_count: usize,
    snapshot_failures: usize,
    snapshot_delay: Duration,
}

/// Mock process table for testing (doesn't touch `/proc`)
///
/// Operations on unknown pids fail with [`Error::ProcessGone`]; `terminate`
/// removes the process from the table.
#[derive(Clone)]
pub struct MockProcessControl {
    state: Arc<Mutex<MockProcessState>>,
    cores: usize,
}

impl MockProcessControl {
    /// Page size reported by the mock
    pub const PAGE_SIZE: MemorySize = MemorySize::from_kb(4);

    /// Mock machine with `cores` logical cores
    #[must_use]
    pub fn new(cores: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockProcessState {
                processes: BTreeMap::new(),
                terminated: Vec::new(),
                call_count: 0,
                snapshot_failures: 0,
                snapshot_delay: Duration::ZERO,
            })),
            cores: cores.clamp(1, AffinityMask::MAX_CORES),
        }
    }

    /// Start a process
    pub async fn spawn(&self, info: ProcessInfo) {
        let pid = info.pid;
        self.state
            .lock()
            .await
            .processes
            .insert(pid, MockProcess::new(info));
    }

    /// Let a process exit
    pub async fn exit(&self, pid: ProcessId) {
        self.state.lock().await.processes.remove(&pid);
    }

    /// Set the reported resident set
    pub async fn set_working_set(&self, pid: ProcessId, size: MemorySize) {
        if let Some(p) = self.state.lock().await.processes.get_mut(&pid) {
            p.working_set = size;
        }
    }

    /// Set the reported cumulative I/O
    pub async fn set_io(&self, pid: ProcessId, io: IoCounters) {
        if let Some(p) = self.state.lock().await.processes.get_mut(&pid) {
            p.io = io;
        }
    }

    /// Recorded state of a process (for testing)
    pub async fn process(&self, pid: ProcessId) -> Option<MockProcess> {
        self.state.lock().await.processes.get(&pid).cloned()
    }

    /// Processes killed through [`ProcessControl::terminate`]
    pub async fn terminated(&self) -> Vec<ProcessId> {
        self.state.lock().await.terminated.clone()
    }

    /// Number of per-process OS calls made (snapshots excluded)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.call_count
    }

    /// Make the next `n` snapshots fail (for testing)
    pub async fn fail_snapshots(&self, n: usize) {
        self.state.lock().await.snapshot_failures = n;
    }

    /// Make every snapshot take `delay`, like a slow /proc scan
    pub async fn delay_snapshots(&self, delay: Duration) {
        self.state.lock().await.snapshot_delay = delay;
    }

    async fn with_process<T>(
        &self,
        pid: ProcessId,
        f: impl FnOnce(&mut MockProcess) -> T + Send,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        state
            .processes
            .get_mut(&pid)
            .map(f)
            .ok_or(Error::ProcessGone { pid })
    }
}

impl fmt::Debug for MockProcessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProcessControl")
            .field("cores", &self.cores)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProcessControl for MockProcessControl {
    async fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
        let delay = self.state.lock().await.snapshot_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.snapshot_failures > 0 {
            state.snapshot_failures -= 1;
            return Err(Error::Io(std::io::Error::other("Mock: snapshot failed")));
        }
        Ok(state.processes.values().map(|p| p.info.clone()).collect())
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }

    fn page_size(&self) -> MemorySize {
        Self::PAGE_SIZE
    }

    async fn set_affinity(&self, pid: ProcessId, mask: AffinityMask) -> Result<()> {
        self.with_process(pid, |p| p.affinity = Some(mask)).await
    }

    async fn set_priority(&self, pid: ProcessId, class: PriorityClass) -> Result<()> {
        self.with_process(pid, |p| p.priority = Some(class)).await
    }

    async fn set_working_set_bounds(
        &self,
        pid: ProcessId,
        min: MemorySize,
        max: MemorySize,
    ) -> Result<()> {
        self.with_process(pid, |p| p.working_set_bounds = Some((min, max)))
            .await
    }

    async fn working_set(&self, pid: ProcessId) -> Result<MemorySize> {
        self.with_process(pid, |p| p.working_set).await
    }

    async fn trim_working_set(&self, pid: ProcessId) -> Result<()> {
        self.with_process(pid, |p| {
            p.trim_count += 1;
            p.working_set = Self::PAGE_SIZE;
        })
        .await
    }

    async fn terminate(&self, pid: ProcessId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.call_count += 1;
        if state.processes.remove(&pid).is_none() {
            return Err(Error::ProcessGone { pid });
        }
        state.terminated.push(pid);
        Ok(())
    }

    async fn io_counters(&self, pid: ProcessId) -> Result<IoCounters> {
        self.with_process(pid, |p| p.io).await
    }

    async fn suspend(&self, pid: ProcessId) -> Result<()> {
        self.with_process(pid, |p| {
            p.suspended = true;
            p.suspend_count += 1;
        })
        .await
    }

    async fn resume(&self, pid: ProcessId) -> Result<()> {
        self.with_process(pid, |p| p.suspended = false).await
    }
}
