//! Disk I/O rate limiter
//!
//! There is no per-group disk quota to lean on, so throughput is measured
//! from cumulative I/O counters and a process running over its cap is
//! stopped for a while. The monitor task sleeps through the suspension, so
//! only one process is penalized at a time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use procgov_cgroup::ProcessControl;
use procgov_core::{Error, GovernorEvent, IoCounters, ProcessId, ProcessInfo, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Worker, sleep_or_stop};
use crate::bus::EventBus;
use crate::math::{suspend_duration, throughput_mb_per_sec};

/// One rate-limited process
#[derive(Debug, Clone, PartialEq)]
pub struct DiskEntry {
    /// The process
    pub process: ProcessInfo,
    /// Combined read+write cap in MB/s
    pub limit_mb_per_sec: u64,
    /// When the last valid sample was taken
    pub last_sample: Instant,
    /// Counters at the last valid sample (`None` until the first)
    pub last_counters: Option<IoCounters>,
    /// Last measured throughput in MB/s
    pub throughput_mb: f64,
}

impl DiskEntry {
    /// Fresh entry for `process` capped at `limit_mb_per_sec`
    #[must_use]
    pub fn new(process: ProcessInfo, limit_mb_per_sec: u64) -> Self {
        Self {
            process,
            limit_mb_per_sec,
            last_sample: Instant::now(),
            last_counters: None,
            throughput_mb: 0.0,
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
    entries: BTreeMap<ProcessId, DiskEntry>,
    running: bool,
}

struct Shared {
    control: Arc<dyn ProcessControl>,
    events: Arc<EventBus>,
    interval: Duration,
    min_sample: Duration,
    state: Mutex<State>,
}

/// Shared disk-monitor service
pub struct DiskMonitor {
    shared: Arc<Shared>,
    worker: tokio::sync::Mutex<Worker>,
    stop_timeout: Duration,
}

impl DiskMonitor {
    /// Create an idle monitor sampling every `interval`, ignoring samples
    /// closer than `min_sample` to the previous one
    #[must_use]
    pub fn new(
        control: Arc<dyn ProcessControl>,
        events: Arc<EventBus>,
        interval: Duration,
        min_sample: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                control,
                events,
                interval,
                min_sample,
                state: Mutex::default(),
            }),
            worker: tokio::sync::Mutex::default(),
            stop_timeout,
        }
    }

    /// Start rate-limiting a process, or update its cap in place.
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] for a zero rate; nothing is registered.
    pub async fn register(&self, process: ProcessInfo, limit_mb_per_sec: u64) -> Result<()> {
        if limit_mb_per_sec == 0 {
            return Err(Error::InvalidConfig {
                message: format!("Disk rate for {process} must be greater than zero"),
            });
        }

        let mut worker = self.worker.lock().await;
        let start = {
            let mut state = self.shared.state();
            match state.entries.get_mut(&process.pid) {
                Some(existing) => existing.limit_mb_per_sec = limit_mb_per_sec,
                None => {
                    debug!(
                        pid = process.pid.as_raw(),
                        limit_mb_per_sec, "Rate-limiting disk I/O"
                    );
                    state
                        .entries
                        .insert(process.pid, DiskEntry::new(process, limit_mb_per_sec));
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

    /// Stop rate-limiting a process; removing the last one stops the task.
    ///
    /// # Errors
    /// [`Error::ShutdownTimeout`] if the task did not stop in time.
    pub async fn unregister(&self, pid: ProcessId) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let stop = {
            let mut state = self.shared.state();
            let removed = state.entries.remove(&pid).is_some();
            let stop = removed && state.entries.is_empty() && state.running;
            if stop {
                state.running = false;
            }
            stop
        };

        if stop {
            worker.stop("disk monitor", self.stop_timeout).await?;
        }
        Ok(())
    }

    /// Whether the monitor task is active
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.shared.state().running
    }

    /// Number of rate-limited processes
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state().entries.len()
    }

    /// Whether no process is rate-limited
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state().entries.is_empty()
    }

    /// Whether `pid` is rate-limited
    #[must_use]
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.shared.state().entries.contains_key(&pid)
    }

    /// The entry for `pid`
    #[must_use]
    pub fn entry(&self, pid: ProcessId) -> Option<DiskEntry> {
        self.shared.state().entries.get(&pid).cloned()
    }

    /// Run one sampling pass now, including any suspension it triggers
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
        worker.stop("disk monitor", self.stop_timeout).await
    }
}

impl std::fmt::Debug for DiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskMonitor")
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
        let pids: Vec<ProcessId> = self.state().entries.keys().copied().collect();

        for pid in pids {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                return;
            }
            self.sample(pid).await;
        }
    }

    async fn sample(&self, pid: ProcessId) {
        let Some(previous) = self.state().entries.get(&pid).cloned() else {
            return;
        };

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(previous.last_sample);
        if elapsed < self.min_sample {
            return;
        }

        let counters = match self.control.io_counters(pid).await {
            Ok(counters) => counters,
            Err(e) => {
                if e.is_process_gone() {
                    debug!(pid = pid.as_raw(), "Rate-limited process exited");
                } else {
                    warn!(pid = pid.as_raw(), error = %e, "Cannot sample I/O counters, dropping process");
                }
                self.remove(pid);
                return;
            }
        };

        let throughput = previous
            .last_counters
            .map(|last| throughput_mb_per_sec(counters.delta_since(last), elapsed));

        {
            let mut state = self.state();
            let Some(entry) = state.entries.get_mut(&pid) else {
                return;
            };
            entry.last_sample = now;
            entry.last_counters = Some(counters);
            if let Some(throughput) = throughput {
                entry.throughput_mb = throughput;
            }
        }

        // The first sample only sets the baseline
        let Some(throughput) = throughput else {
            return;
        };

        #[allow(clippy::cast_precision_loss)]
        let cap = previous.limit_mb_per_sec as f64;
        let Some(suspended) = suspend_duration(throughput, cap) else {
            return;
        };

        self.throttle(&previous.process, throughput, suspended).await;
    }

    async fn throttle(&self, process: &ProcessInfo, throughput: f64, suspended: Duration) {
        let pid = process.pid;

        if let Err(e) = self.control.suspend(pid).await {
            if e.is_process_gone() {
                self.remove(pid);
            } else {
                warn!(pid = pid.as_raw(), error = %e, "Failed to suspend process");
            }
            return;
        }

        self.events.publish(GovernorEvent::DiskThrottled {
            pid,
            throughput_mb: throughput,
            suspended,
            timestamp: SystemTime::now(),
        });

        tokio::time::sleep(suspended).await;

        match self.control.resume(pid).await {
            Ok(()) => debug!(pid = pid.as_raw(), process = %process.name, "Process resumed"),
            Err(e) if e.is_process_gone() => self.remove(pid),
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "Failed to resume process"),
        }
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_ms = shared.interval.as_millis(),
        min_sample_ms = shared.min_sample.as_millis(),
        "Disk monitor started"
    );

    loop {
        shared.pass(Some(&shutdown)).await;

        if shared.finish_if_empty() {
            debug!("No processes left to rate-limit");
            break;
        }
        if sleep_or_stop(shared.interval, &mut shutdown).await {
            break;
        }
    }

    info!("Disk monitor stopped");
}
