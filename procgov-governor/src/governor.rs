//! Reconciliation core
//!
//! The governor snapshots the process table on a fixed interval and, when
//! the set of processes changed, rebuilds every resource group and applies
//! limits to the groups that gained members.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use procgov_cgroup::{MockBackend, MockProcessControl};
//! use procgov_core::{GovernorSettings, ResourceLimitConfig, StaticConfigSource};
//! use procgov_governor::Governor;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = Arc::new(StaticConfigSource::new(vec![
//!     ResourceLimitConfig::new("editors").with_path("/usr/bin/vim"),
//! ]));
//! let governor = Governor::new(
//!     Arc::new(MockBackend::new()),
//!     Arc::new(MockProcessControl::new(4)),
//!     source,
//!     GovernorSettings::default(),
//! );
//!
//! governor.request_apply().await;
//! assert_eq!(governor.groups().await.len(), 1);
//! governor.shutdown().await.unwrap();
//! # });
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use procgov_cgroup::{ProcessControl, ResourceBackend};
use procgov_core::{
    ConfigEvent, ConfigSource, GovernorEvent, GovernorSettings, GroupSummary, ProcessId,
    ProcessInfo, ResourceLimitConfig, Result, render_report,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::group::{ResourceGroup, Services};
use crate::monitor::{DiskMonitor, MemoryMonitor, Worker};
use crate::plan::{PriorGroup, plan_groups};

const COMMAND_CAPACITY: usize = 16;

/// Which groups a pass applies limits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyScope {
    /// Groups that gained members or whose config changed
    Changed,
    /// Every enabled group with members
    All,
}

/// Mutable reconciliation state. Holding the lock is what makes passes
/// single-flight.
#[derive(Default)]
struct State {
    configs: Vec<Arc<ResourceLimitConfig>>,
    snapshot: Option<Vec<ProcessInfo>>,
    groups: Vec<ResourceGroup>,
}

/// The process resource governor
pub struct Governor {
    services: Arc<Services>,
    source: Arc<dyn ConfigSource>,
    settings: GovernorSettings,
    state: Mutex<State>,
    worker: Mutex<Worker>,
    commands_tx: mpsc::Sender<ConfigEvent>,
    commands_rx: Mutex<mpsc::Receiver<ConfigEvent>>,
}

impl Governor {
    /// Create a stopped governor with idle monitors and no groups
    #[must_use]
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        control: Arc<dyn ProcessControl>,
        source: Arc<dyn ConfigSource>,
        settings: GovernorSettings,
    ) -> Arc<Self> {
        let services = Arc::new(Services::new(backend, control, &settings));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        info!(
            tick_ms = settings.tick_interval_ms,
            kill_on_close = settings.kill_on_close,
            "Governor created"
        );

        Arc::new(Self {
            services,
            source,
            settings,
            state: Mutex::new(State::default()),
            worker: Mutex::new(Worker::default()),
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
        })
    }

    /// Start the periodic tick. Calling it while running does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_running() {
            return;
        }

        let governor = Arc::clone(self);
        let period = self.settings.tick_interval();
        worker.spawn(move |mut shutdown| async move {
            let mut commands = governor.commands_rx.lock().await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = governor.tick().await {
                            error!(error = %e, "Reconciliation tick failed");
                            governor.publish_error(format!("Reconciliation tick failed: {e}"));
                        }
                    }
                    Some(command) = commands.recv() => governor.handle_command(command).await,
                }
            }

            debug!("Tick task exiting");
        });

        info!(interval_ms = period.as_millis(), "Governor started");
    }

    /// Stop the periodic tick, waiting a bounded time for a running pass
    pub async fn stop(&self) -> Result<()> {
        self.worker
            .lock()
            .await
            .stop("governor", self.settings.stop_timeout())
            .await
    }

    /// Whether the tick task is running
    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_running()
    }

    /// Replace the active configs and reconcile immediately.
    ///
    /// `None` or an empty list leaves everything untouched and returns
    /// false.
    pub async fn update_configs(&self, configs: Option<Vec<ResourceLimitConfig>>) -> bool {
        let Some(configs) = configs.filter(|c| !c.is_empty()) else {
            debug!("Ignoring empty configuration update");
            return false;
        };

        let mut state = self.state.lock().await;
        state.configs = configs.into_iter().map(Arc::new).collect();
        info!(configs = state.configs.len(), "Configuration replaced");

        if state.snapshot.is_none() && !self.take_snapshot(&mut state).await {
            return false;
        }

        let changed = self.rebuild(&mut state, None).await;
        self.apply(&mut state, ApplyScope::Changed, &changed).await
    }

    /// Reload configs from the source and apply every enabled group now
    pub async fn request_apply(&self) -> bool {
        let configs = match self.source.configs() {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "Failed to load configuration");
                self.publish_error(format!("Failed to load configuration: {e}"));
                return false;
            }
        };

        let mut state = self.state.lock().await;
        if configs.is_empty() {
            warn!("Configuration source is empty, keeping current configs");
        } else {
            state.configs = configs.into_iter().map(Arc::new).collect();
        }

        if state.snapshot.is_none() && !self.take_snapshot(&mut state).await {
            return false;
        }

        info!(configs = state.configs.len(), "Applying configuration");
        let changed = self.rebuild(&mut state, None).await;
        self.apply(&mut state, ApplyScope::All, &changed).await
    }

    /// One reconciliation pass.
    ///
    /// The first pass only builds groups. Later passes do nothing unless a
    /// process appeared or exited.
    pub async fn tick(&self) -> Result<()> {
        // Scanning /proc happens before the lock so readers are not held up
        let current = self.services.control.snapshot().await?;
        let mut state = self.state.lock().await;

        let Some(previous) = state.snapshot.take() else {
            debug!(processes = current.len(), "First snapshot");
            state.snapshot = Some(current);
            self.rebuild(&mut state, None).await;
            return Ok(());
        };

        let (added, removed) = diff(&previous, &current);
        if added.is_empty() && removed.is_empty() {
            state.snapshot = Some(previous);
            return Ok(());
        }

        debug!(added = added.len(), removed = removed.len(), "Process set changed");
        let preamble = describe_changes(&added, &removed);
        state.snapshot = Some(current);

        let changed = self.rebuild(&mut state, Some(&preamble)).await;
        self.apply(&mut state, ApplyScope::Changed, &changed).await;
        Ok(())
    }

    /// Summaries of the installed groups
    pub async fn groups(&self) -> Vec<GroupSummary> {
        self.state
            .lock()
            .await
            .groups
            .iter()
            .map(ResourceGroup::summary)
            .collect()
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<GovernorEvent> {
        self.services.events.subscribe(EventBus::DEFAULT_CAPACITY)
    }

    /// Channel for the configuration collaborator
    #[must_use]
    pub fn command_sender(&self) -> mpsc::Sender<ConfigEvent> {
        self.commands_tx.clone()
    }

    /// Memory monitor shared by every group
    #[must_use]
    pub fn memory_monitor(&self) -> &Arc<MemoryMonitor> {
        &self.services.memory
    }

    /// Disk monitor shared by every group
    #[must_use]
    pub fn disk_monitor(&self) -> &Arc<DiskMonitor> {
        &self.services.disk
    }

    /// Stop ticking, dispose every group and stop both monitors.
    ///
    /// Everything is torn down even if a step times out; the first failure
    /// is returned.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down governor");
        let mut result = self.stop().await;

        {
            let mut state = self.state.lock().await;
            for group in &mut state.groups {
                group.dispose().await;
            }
            state.groups.clear();
        }

        for stopped in [
            self.services.memory.shutdown().await,
            self.services.disk.shutdown().await,
        ] {
            if let Err(e) = stopped {
                warn!(error = %e, "Monitor did not shut down cleanly");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    async fn handle_command(&self, command: ConfigEvent) {
        match command {
            ConfigEvent::Changed(configs) => {
                self.update_configs(Some(configs)).await;
            }
            ConfigEvent::ApplyRequested => {
                self.request_apply().await;
            }
        }
    }

    async fn take_snapshot(&self, state: &mut State) -> bool {
        match self.services.control.snapshot().await {
            Ok(snapshot) => {
                state.snapshot = Some(snapshot);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to snapshot processes");
                self.publish_error(format!("Failed to snapshot processes: {e}"));
                false
            }
        }
    }

    /// Replace the group generation; returns the names whose config changed.
    ///
    /// The new generation holds its kernel groups before the old one is
    /// disposed, so groups that survive keep their kernel limits. Processes
    /// the new generation still rate-limits keep their disk samples.
    async fn rebuild(&self, state: &mut State, preamble: Option<&str>) -> HashSet<String> {
        let prior: HashMap<String, PriorGroup> = state
            .groups
            .iter()
            .map(|g| (g.name().to_string(), g.prior()))
            .collect();

        let snapshot = state.snapshot.as_deref().unwrap_or_default();
        let plans = plan_groups(&state.configs, snapshot, &prior);

        let mut changed = HashSet::new();
        let mut next = Vec::with_capacity(plans.len());
        for plan in plans {
            if plan.config_changed {
                changed.insert(plan.config.name.clone());
            }
            next.push(ResourceGroup::from_plan(plan, Arc::clone(&self.services)).await);
        }

        let disk_retained: HashSet<ProcessId> = next
            .iter()
            .flat_map(ResourceGroup::disk_rate_limited)
            .collect();
        for mut old in std::mem::replace(&mut state.groups, next) {
            old.dispose_retaining(&disk_retained).await;
        }

        let summaries: Vec<GroupSummary> =
            state.groups.iter().map(ResourceGroup::summary).collect();
        info!(groups = summaries.len(), "Groups rebuilt");

        let text = render_report(preamble, &summaries);
        self.services.events.publish(GovernorEvent::GroupsChanged {
            groups: summaries,
            timestamp: SystemTime::now(),
        });
        self.services.events.publish(GovernorEvent::Notification {
            text,
            timestamp: SystemTime::now(),
        });

        changed
    }

    /// Apply limits to the groups `scope` selects; the rest only get their
    /// monitor registrations back.
    async fn apply(&self, state: &mut State, scope: ApplyScope, changed: &HashSet<String>) -> bool {
        let mut success = true;
        let mut applied = 0_usize;
        let mut resumed = 0_usize;

        for group in &mut state.groups {
            if !group.config().enabled || group.members().is_empty() {
                continue;
            }

            let due = match scope {
                ApplyScope::All => true,
                ApplyScope::Changed => group.is_new() || changed.contains(group.name()),
            };

            if due {
                success &= group.apply_limits().await;
                applied += 1;
            } else {
                success &= group.resume_monitoring().await;
                resumed += 1;
            }
        }

        debug!(applied, resumed, "Apply pass finished");
        success
    }

    fn publish_error(&self, message: String) {
        self.services.events.publish(GovernorEvent::Error {
            message,
            timestamp: SystemTime::now(),
        });
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("services", &self.services)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Processes only in `current`, and processes only in `previous`, by pid
fn diff(previous: &[ProcessInfo], current: &[ProcessInfo]) -> (Vec<ProcessInfo>, Vec<ProcessInfo>) {
    let before: BTreeSet<_> = previous.iter().map(|p| p.pid).collect();
    let after: BTreeSet<_> = current.iter().map(|p| p.pid).collect();

    let added = current
        .iter()
        .filter(|p| !before.contains(&p.pid))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|p| !after.contains(&p.pid))
        .cloned()
        .collect();

    (added, removed)
}

fn describe_changes(added: &[ProcessInfo], removed: &[ProcessInfo]) -> String {
    let mut out = String::new();
    for process in added {
        let _ = writeln!(out, "[added] {process}");
    }
    for process in removed {
        let _ = writeln!(out, "[removed] {process}");
    }
    out
}
