//! Dry run: show the groups the configuration would build right now

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use procgov_cgroup::{LinuxProcessControl, ProcessControl};
use procgov_core::{GroupSummary, render_report};
use procgov_governor::plan_groups;

use crate::cli::CheckArgs;
use crate::config::ConfigFile;

pub async fn execute(args: &CheckArgs) -> Result<()> {
    let file = ConfigFile::load(&args.config)?;

    let snapshot = LinuxProcessControl::new()
        .snapshot()
        .await
        .context("Failed to list processes")?;

    let configs: Vec<_> = file.groups.into_iter().map(Arc::new).collect();
    let summaries: Vec<GroupSummary> = plan_groups(&configs, &snapshot, &HashMap::new())
        .into_iter()
        .map(|plan| GroupSummary {
            config: (*plan.config).clone(),
            handle_ready: false,
            is_new: plan.is_new,
            members: plan.members,
        })
        .collect();

    let preamble = format!(
        "{} processes scanned, {} groups configured",
        snapshot.len(),
        summaries.len()
    );
    print!("{}", render_report(Some(&preamble), &summaries));
    Ok(())
}
