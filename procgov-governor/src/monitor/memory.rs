//! Working-set monitor
//!
//! Polls the resident set of every registered process and trims or kills
//! the ones above their cap.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use procgov_cgroup::ProcessControl;
use procgov_core::{
    Error, GovernorEvent, MemoryLimitSpec, MemorySize, ProcessId, ProcessInfo, Result,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Worker, sleep_or_stop};
use crate::bus::EventBus;

/// One monitored process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// The process
    pub process: ProcessInfo,
    /// Working-set cap
    pub limit: MemorySize,
    /// Trim the working set when over the cap
    pub auto_trim: bool,
    /// Kill the process when over the cap
    pub terminate: bool,
    /// Last sampled working set
    pub usage: MemorySize,
}

impl MemoryEntry {
    /// Entry for `process` with the cap and effective behavior of `spec`
    #[must_use]
    pub fn from_spec(process: ProcessInfo, spec: &MemoryLimitSpec) -> Self {
        Self {
            process,
            limit: spec.cap(),
            auto_trim: spec.auto_trim_effective(),
            terminate: spec.terminate_effective(),
            usage: MemorySize::ZERO,
        }
    }

    /// Process id
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.process.pid
    }
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<ProcessId, MemoryEntry>,
    running: bool,
}

struct Shared {
    control: Arc<dyn ProcessControl>,
    events: Arc<EventBus>,
    interval: Duration,
    state: Mutex<State>,
}

/// Shared memory-monitor service
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use procgov_cgroup::MockProcessControl;
/// use procgov_core::{MemorySize, ProcessId, ProcessInfo};
/// use procgov_governor::{EventBus, MemoryEntry, MemoryMonitor};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let control = Arc::new(MockProcessControl::new(4));
/// let process = ProcessInfo::new(ProcessId::from_raw(42), "x", None);
/// control.spawn(process.clone()).await;
///
/// let monitor = MemoryMonitor::new(
///     control,
///     Arc::new(EventBus::new()),
///     Duration::from_secs(2),
///     Duration::from_secs(3),
/// );
///
/// let entry = MemoryEntry {
///     process,
///     limit: MemorySize::from_mb(100),
///     auto_trim: true,
///     terminate: false,
///     usage: MemorySize::ZERO,
/// };
/// monitor.register(entry).await.unwrap();
/// assert!(monitor.is_monitoring());
///
/// monitor.shutdown().await.unwrap();
/// assert!(!monitor.is_monitoring());
/// # });
/// ```
pub struct MemoryMonitor {
    shared: Arc<Shared>,
    worker: tokio::sync::Mutex<Worker>,
    stop_timeout: Duration,
}

impl MemoryMonitor {
    /// Create an idle monitor polling every `interval`
    #[must_use]
    pub fn new(
        control: Arc<dyn ProcessControl>,
        events: Arc<EventBus>,
        interval: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                control,
                events,
                interval,
                state: Mutex::default(),
            }),
            worker: tokio::sync::Mutex::default(),
            stop_timeout,
        }
    }

    /// Start watching a process, or update its cap and flags in place.
    ///
    /// The first registration starts the monitor task.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] for a zero cap; nothing is registered.
    pub async fn register(&self, entry: MemoryEntry) -> Result<()> {
        if entry.limit.is_zero() {
            return Err(Error::InvalidConfig {
                message: format!("Memory cap for {} must be greater than zero", entry.process),
            });
        }

        let mut worker = self.worker.lock().await;
        let start = {
            let mut state = self.shared.state();
            match state.entries.get_mut(&entry.pid()) {
                Some(existing) => {
                    existing.limit = entry.limit;
                    existing.auto_trim = entry.auto_trim;
                    existing.terminate = entry.terminate;
                }
                None => {
                    debug!(
                        pid = entry.pid().as_raw(),
                        limit_mb = entry.limit.as_mb(),
                        "Monitoring working set"
                    );
                    state.entries.insert(entry.pid(), entry);
                }
            }
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            let shared = Arc::clone(&self.shared);
            worker.spawn(move |shutdown| run(shared, shutdown));
        }

        Ok(())
    }

    /// Stop watching a process; removing the last one stops the task.
    ///
    /// # Errors
    /// [`Error::ShutdownTimeout`] if the task did not stop in time.
    pub async fn unregister(&self, pid: ProcessId) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let stop = {
            let mut state = self.shared.state();
            let removed = state.entries.remove(&pid).is_some();
            if removed {
                debug!(pid = pid.as_raw(), "Stopped monitoring working set");
            }
            let stop = removed && state.entries.is_empty() && state.running;
            if stop {
                state.running = false;
            }
            stop
        };

        if stop {
            worker.stop("memory monitor", self.stop_timeout).await?;
        }
        Ok(())
    }

    /// Whether the monitor task is active
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.shared.state().running
    }

    /// Number of monitored processes
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state().entries.len()
    }

    /// Whether no process is monitored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state().entries.is_empty()
    }

    /// Whether `pid` is monitored
    #[must_use]
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.shared.state().entries.contains_key(&pid)
    }

    /// The entry for `pid`
    #[must_use]
    pub fn entry(&self, pid: ProcessId) -> Option<MemoryEntry> {
        self.shared.state().entries.get(&pid).cloned()
    }

    /// Run one monitoring pass now
    pub async fn poll_once(&self) {
        self.shared.pass(None).await;
    }

    /// Drop every entry and stop the task.
    ///
    /// # Errors
    /// [`Error::ShutdownTimeout`] if the task did not stop in time.
    pub async fn shutdown(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        {
            let mut state = self.shared.state();
            state.entries.clear();
            state.running = false;
        }
        worker.stop("memory monitor", self.stop_timeout).await
    }
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("interval", &self.shared.interval)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, pid: ProcessId) {
        self.state().entries.remove(&pid);
    }

    /// Mark the task finished if nothing is left to watch
    fn finish_if_empty(&self) -> bool {
        let mut state = self.state();
        if state.entries.is_empty() {
            state.running = false;
            true
        } else {
            false
        }
    }

    async fn pass(&self, shutdown: Option<&watch::Receiver<bool>>) {
        let entries: Vec<MemoryEntry> = self.state().entries.values().cloned().collect();

        for entry in entries {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                return;
            }
            self.check(entry.pid()).await;
        }
    }

    async fn check(&self, pid: ProcessId) {
        let usage = match self.control.working_set(pid).await {
            Ok(usage) => usage,
            Err(e) => {
                if e.is_process_gone() {
                    debug!(pid = pid.as_raw(), "Monitored process exited");
                } else {
                    warn!(pid = pid.as_raw(), error = %e, "Cannot sample working set, dropping process");
                }
                self.remove(pid);
                return;
            }
        };

        // The entry may have been unregistered while sampling
        let entry = {
            let mut state = self.state();
            let Some(entry) = state.entries.get_mut(&pid) else {
                return;
            };
            entry.usage = usage;
            entry.clone()
        };

        if usage <= entry.limit {
            return;
        }

        info!(
            pid = pid.as_raw(),
            process = %entry.process.name,
            usage_mb = usage.as_mb(),
            limit_mb = entry.limit.as_mb(),
            "Working set over cap"
        );

        if entry.auto_trim {
            match self.control.trim_working_set(pid).await {
                Ok(()) => self.events.publish(GovernorEvent::MemoryTrimmed {
                    pid,
                    usage,
                    limit: entry.limit,
                    timestamp: SystemTime::now(),
                }),
                Err(e) if e.is_process_gone() => {
                    self.remove(pid);
                    return;
                }
                Err(e) => warn!(pid = pid.as_raw(), error = %e, "Failed to trim working set"),
            }
        }

        if entry.terminate {
            match self.control.terminate(pid).await {
                Ok(()) => {
                    self.events.publish(GovernorEvent::ProcessTerminated {
                        pid,
                        usage,
                        limit: entry.limit,
                        timestamp: SystemTime::now(),
                    });
                    self.remove(pid);
                }
                Err(e) if e.is_process_gone() => self.remove(pid),
                Err(e) => warn!(pid = pid.as_raw(), error = %e, "Failed to terminate process"),
            }
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_ms = shared.interval.as_millis(),
        "Memory monitor started"
    );

    loop {
        shared.pass(Some(&shutdown)).await;

        if shared.finish_if_empty() {
            debug!("No processes left to monitor");
            break;
        }
        if sleep_or_stop(shared.interval, &mut shutdown).await {
            break;
        }
    }

    info!("Memory monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgov_cgroup::MockProcessControl;

    fn setup() -> (Arc<MockProcessControl>, MemoryMonitor, Arc<EventBus>) {
        let control = Arc::new(MockProcessControl::new(4));
        let events = Arc::new(EventBus::new());
        let monitor = MemoryMonitor::new(
            control.clone(),
            Arc::clone(&events),
            Duration::from_secs(2),
            Duration::from_secs(3),
        );
        (control, monitor, events)
    }

    fn entry(pid: i32, limit_mb: u64, auto_trim: bool, terminate: bool) -> MemoryEntry {
        MemoryEntry {
            process: ProcessInfo::new(ProcessId::from_raw(pid), "x", None),
            limit: MemorySize::from_mb(limit_mb),
            auto_trim,
            terminate,
            usage: MemorySize::ZERO,
        }
    }

    #[tokio::test]
    async fn test_zero_cap_rejected() {
        let (_control, monitor, _events) = setup();

        let err = monitor.register(entry(1, 0, true, false)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(monitor.is_empty());
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test]
    async fn test_unregister_last_stops_task() {
        let (control, monitor, _events) = setup();
        control
            .spawn(ProcessInfo::new(ProcessId::from_raw(1), "x", None))
            .await;

        monitor.register(entry(1, 100, true, false)).await.unwrap();
        assert!(monitor.is_monitoring());

        monitor.unregister(ProcessId::from_raw(1)).await.unwrap();
        assert!(!monitor.is_monitoring());
        assert!(monitor.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_updates_in_place() {
        let (_control, monitor, _events) = setup();

        monitor.register(entry(1, 100, true, false)).await.unwrap();
        monitor.register(entry(1, 200, false, true)).await.unwrap();

        assert_eq!(monitor.len(), 1);
        let updated = monitor.entry(ProcessId::from_raw(1)).unwrap();
        assert_eq!(updated.limit, MemorySize::from_mb(200));
        assert!(!updated.auto_trim);
        assert!(updated.terminate);

        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_over_cap_trims() {
        let (control, monitor, events) = setup();
        let pid = ProcessId::from_raw(7);
        control.spawn(ProcessInfo::new(pid, "x", None)).await;
        let mut rx = events.subscribe(16);

        monitor.register(entry(7, 50, true, false)).await.unwrap();
        control.set_working_set(pid, MemorySize::from_mb(80)).await;
        monitor.poll_once().await;

        let process = control.process(pid).await.unwrap();
        assert!(process.trim_count >= 1);
        assert!(monitor.contains(pid));
        assert!(matches!(
            rx.recv().await,
            Some(GovernorEvent::MemoryTrimmed { pid: p, .. }) if p == pid
        ));

        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_process_dropped() {
        let (control, monitor, _events) = setup();
        let pid = ProcessId::from_raw(9);
        control.spawn(ProcessInfo::new(pid, "x", None)).await;

        monitor.register(entry(9, 50, true, false)).await.unwrap();
        control.exit(pid).await;
        monitor.poll_once().await;

        assert!(!monitor.contains(pid));
        monitor.shutdown().await.unwrap();
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_ends_when_last_process_removed_by_pass() {
        let (control, monitor, _events) = setup();
        let pid = ProcessId::from_raw(3);
        control.spawn(ProcessInfo::new(pid, "x", None)).await;

        monitor.register(entry(3, 50, false, true)).await.unwrap();
        control.set_working_set(pid, MemorySize::from_mb(60)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(control.terminated().await, vec![pid]);
        assert!(monitor.is_empty());
        assert!(!monitor.is_monitoring());
    }
}
