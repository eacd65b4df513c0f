//! Background enforcement of memory and disk limits
//!
//! Both monitors follow the same lifecycle: the first registration spawns
//! the task, removing the last entry stops it (explicitly through
//! `unregister`, or from inside when a pass drops the last process), and
//! `shutdown` joins it within a bound.

mod disk;
mod memory;

pub use disk::{DiskEntry, DiskMonitor};
pub use memory::{MemoryEntry, MemoryMonitor};

use std::future::Future;
use std::time::Duration;

use procgov_core::{Error, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A background task with a cooperative stop signal
#[derive(Debug, Default)]
pub(crate) struct Worker {
    task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Worker {
    /// Spawn `run`, replacing any previous (already exiting) task
    pub(crate) fn spawn<F, Fut>(&mut self, run: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        self.task = Some(tokio::spawn(run(rx)));
        self.shutdown = Some(tx);
    }

    /// Whether a task is spawned and has not finished
    pub(crate) fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the task and wait up to `timeout` for it to finish.
    ///
    /// A task that does not finish in time is aborted and reported as
    /// [`Error::ShutdownTimeout`].
    pub(crate) async fn stop(&mut self, component: &str, timeout: Duration) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already be gone
            let _ = tx.send(true);
        }

        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {
                debug!(component, "Background task stopped");
                Ok(())
            }
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    component,
                    timeout_ms = timeout.as_millis(),
                    "Background task did not stop in time, aborting"
                );
                task.abort();
                Err(Error::ShutdownTimeout {
                    component: component.to_string(),
                })
            }
        }
    }
}

/// Wait for `period` unless the stop signal fires first; true if stopped
pub(crate) async fn sleep_or_stop(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        () = tokio::time::sleep(period) => false,
    }
}
