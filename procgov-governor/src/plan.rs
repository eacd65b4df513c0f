//! Group planning
//!
//! Deciding which processes belong to which group is a pure function of
//! the configs, the process snapshot and what the previous generation held.
//! Kernel handles are only touched once a plan is turned into groups.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use procgov_core::{ProcessId, ProcessInfo, ResourceLimitConfig};

/// What the previous generation's group of a config name held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorGroup {
    /// Config it was built from
    pub config: Arc<ResourceLimitConfig>,
    /// Its member ids
    pub members: BTreeSet<ProcessId>,
    /// Still waiting for its first `apply_limits`
    pub pending: bool,
}

/// One group of the next generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    /// Config the group is built from
    pub config: Arc<ResourceLimitConfig>,
    /// Matched processes, in snapshot order, without duplicates
    pub members: Vec<ProcessInfo>,
    /// The group gained a process the previous generation did not limit
    pub is_new: bool,
    /// A group of this name existed with a different config
    pub config_changed: bool,
}

/// Processes of `snapshot` whose executable is one of `config`'s paths.
///
/// Disabled configs match nothing; processes without a readable
/// executable path never match.
#[must_use]
pub fn match_members(config: &ResourceLimitConfig, snapshot: &[ProcessInfo]) -> Vec<ProcessInfo> {
    if !config.enabled {
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut members = Vec::new();
    for matcher in &config.paths {
        for process in snapshot.iter().filter(|p| p.matches_path(&matcher.path)) {
            if seen.insert(process.pid) {
                members.push(process.clone());
            }
        }
    }
    members
}

/// Plan one group per config, enabled or not.
///
/// A group is new when it has a member that was not in the previous
/// generation's group of the same name, or when that group was never
/// applied.
#[must_use]
pub fn plan_groups(
    configs: &[Arc<ResourceLimitConfig>],
    snapshot: &[ProcessInfo],
    prior: &HashMap<String, PriorGroup>,
) -> Vec<GroupPlan> {
    configs
        .iter()
        .map(|config| {
            let members = match_members(config, snapshot);
            let previous = prior.get(&config.name);

            let is_new = !members.is_empty()
                && previous.is_none_or(|p| {
                    p.pending || members.iter().any(|m| !p.members.contains(&m.pid))
                });
            let config_changed = previous.is_some_and(|p| *p.config != **config);

            GroupPlan {
                config: Arc::clone(config),
                members,
                is_new,
                config_changed,
            }
        })
        .collect()
}
