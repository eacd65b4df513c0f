//! Governor execution

use std::sync::Arc;

use anyhow::{Context, Result};
use procgov_cgroup::{CGroupBackend, LinuxProcessControl, procfs};
use procgov_core::{ConfigEvent, GovernorEvent};
use procgov_governor::Governor;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::{ConfigFile, FileConfigSource};

pub async fn execute(args: RunArgs) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("Must run as root. Try: sudo procgov run ...");
    }

    let mut file = ConfigFile::load(&args.config)?;
    if let Some(root) = args.cgroup_root {
        file.settings.cgroup_root = root;
    }

    let cores = procfs::online_cores();
    info!(
        config = %args.config.display(),
        groups = file.groups.len(),
        cgroup_root = %file.settings.cgroup_root.display(),
        cores,
        "Starting procgov"
    );

    let governor = Governor::new(
        Arc::new(CGroupBackend::new(&file.settings.cgroup_root, cores)),
        Arc::new(LinuxProcessControl::new()),
        Arc::new(FileConfigSource::new(&args.config)),
        file.settings,
    );

    let mut events = governor.subscribe();
    let commands = governor.command_sender();
    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;

    if !governor.request_apply().await {
        warn!("Some limits could not be applied, see the log above");
    }
    governor.start().await;

    info!("Governor running. Press Ctrl+C to stop, send SIGHUP to reload");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                commands
                    .send(ConfigEvent::ApplyRequested)
                    .await
                    .context("Governor stopped accepting commands")?;
            }
            Some(event) = events.recv() => {
                if let GovernorEvent::Notification { text, .. } = event {
                    println!("{text}");
                }
            }
        }
    }

    info!("Stopping governor");
    governor
        .shutdown()
        .await
        .context("Governor did not shut down cleanly")?;

    info!("Governor stopped");
    Ok(())
}
