//! Governor events with structured tracing

use std::fmt::{self, Write as _};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::{AffinityMode, CpuRateMode, OveruseAction, ResourceLimitConfig};
use crate::{MemorySize, ProcessId, ProcessInfo};

/// Snapshot of one resource group, as shown to UI collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// The config the group was built from
    pub config: ResourceLimitConfig,
    /// Whether a kernel group handle is held
    pub handle_ready: bool,
    /// Whether this generation added a member
    pub is_new: bool,
    /// Matched processes
    pub members: Vec<ProcessInfo>,
}

impl GroupSummary {
    /// Config name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn write_details(&self, out: &mut String) -> fmt::Result {
        let config = &self.config;
        writeln!(out, "[group] {}", config.name)?;
        writeln!(
            out,
            "  - state: {}",
            if config.enabled { "enabled" } else { "disabled" }
        )?;
        writeln!(
            out,
            "  - kernel group: {}",
            if self.handle_ready { "ready" } else { "not created" }
        )?;

        if !config.paths.is_empty() {
            writeln!(out, "  - paths:")?;
            for matcher in &config.paths {
                if matcher.arguments.is_empty() {
                    writeln!(out, "    * {}", matcher.path.display())?;
                } else {
                    writeln!(
                        out,
                        "    * {} {}",
                        matcher.path.display(),
                        matcher.arguments.join(" ")
                    )?;
                }
            }
        }

        if self.members.is_empty() {
            writeln!(out, "  - processes: no matching processes")?;
        } else {
            writeln!(out, "  - processes:")?;
            for member in &self.members {
                writeln!(out, "    * {member}")?;
            }
        }

        for line in describe_limits(config) {
            writeln!(out, "  - {line}")?;
        }

        Ok(())
    }
}

/// Human-readable description of every enabled limit of `config`
#[must_use]
pub fn describe_limits(config: &ResourceLimitConfig) -> Vec<String> {
    let mut lines = Vec::new();

    if config.cpu.enabled {
        let rate = match config.cpu.rate_mode {
            CpuRateMode::None => "no rate control".to_string(),
            CpuRateMode::RelativeWeight(w) => format!("relative weight {w}"),
            CpuRateMode::AbsoluteCap(p) => format!("hard cap {p}%"),
        };
        let affinity = match config.cpu.affinity_mode {
            AffinityMode::None => "any core".to_string(),
            AffinityMode::CoreCount(n) => format!("{n} core(s)"),
            AffinityMode::CoreIndex(i) => format!("core #{i}"),
        };
        lines.push(format!("cpu: {rate}, {affinity}"));
    }

    if config.memory.enabled {
        let memory = &config.memory;
        let action = match memory.overuse_action {
            OveruseAction::TrimWorkingSet => "trim working set",
            OveruseAction::Terminate => "terminate",
        };
        let mut line = format!("memory: cap {} MB, on overuse {action}", memory.cap_mb);
        if memory.enable_monitoring {
            let _ = write!(
                line,
                ", monitored (auto-trim {}, terminate {})",
                on_off(memory.auto_trim_effective()),
                on_off(memory.terminate_effective())
            );
        }
        lines.push(line);
    }

    if config.disk.enabled {
        lines.push(format!(
            "disk: {} MB/s read+write",
            config.disk.rate_limit_mb_per_sec
        ));
    }

    if config.network.enabled {
        let mut line = format!("network: {} KB/s", config.network.max_rate_kb_per_sec);
        if config.network.specify_priority {
            let _ = write!(line, ", DSCP {}", config.network.priority_value);
        }
        lines.push(line);
    }

    if config.priority.enabled {
        lines.push(format!("priority: {}", config.priority.class().label()));
    }

    lines
}

const fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

/// Render the notification text for a group list, with an optional preamble
#[must_use]
pub fn render_report(preamble: Option<&str>, groups: &[GroupSummary]) -> String {
    let mut out = String::new();

    if let Some(preamble) = preamble.filter(|p| !p.is_empty()) {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }

    out.push_str("==================== process groups ====================\n");
    if groups.is_empty() {
        out.push_str("no process groups\n");
    }
    for group in groups {
        // Writing into a String cannot fail.
        let _ = group.write_details(&mut out);
        out.push('\n');
    }
    out.push_str("========================================================\n");

    out
}

/// Events emitted by the governor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GovernorEvent {
    /// A new generation of groups was installed
    GroupsChanged {
        /// Installed groups
        groups: Vec<GroupSummary>,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Human-readable snapshot of every group
    Notification {
        /// Report text
        text: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Limits were applied to a group
    LimitsApplied {
        /// Group name
        group: String,
        /// Whether every throttler succeeded
        success: bool,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A process over its memory cap had its working set trimmed
    MemoryTrimmed {
        /// Process
        pid: ProcessId,
        /// Working set before trimming
        usage: MemorySize,
        /// Cap
        limit: MemorySize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A process over its memory cap was terminated
    ProcessTerminated {
        /// Process
        pid: ProcessId,
        /// Working set at termination
        usage: MemorySize,
        /// Cap
        limit: MemorySize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A process over its disk rate was suspended
    DiskThrottled {
        /// Process
        pid: ProcessId,
        /// Measured throughput in MB/s
        throughput_mb: f64,
        /// How long it was suspended
        #[serde(with = "duration_serde")]
        suspended: Duration,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Error occurred
    Error {
        /// Error message
        message: String,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl GovernorEvent {
    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::GroupsChanged { timestamp, .. }
            | Self::Notification { timestamp, .. }
            | Self::LimitsApplied { timestamp, .. }
            | Self::MemoryTrimmed { timestamp, .. }
            | Self::ProcessTerminated { timestamp, .. }
            | Self::DiskThrottled { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this is a critical event
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ProcessTerminated { .. } | Self::Error { .. }
        )
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::GroupsChanged { groups, .. } => {
                tracing::info!(
                    groups = groups.len(),
                    members = groups.iter().map(|g| g.members.len()).sum::<usize>(),
                    event = "groups_changed",
                    "Process groups changed"
                );
            }
            Self::Notification { text, .. } => {
                tracing::debug!(event = "notification", "{text}");
            }
            Self::LimitsApplied { group, success, .. } => {
                if *success {
                    tracing::info!(group = %group, event = "limits_applied", "Limits applied");
                } else {
                    tracing::warn!(
                        group = %group,
                        event = "limits_applied",
                        "Some limits could not be applied"
                    );
                }
            }
            Self::MemoryTrimmed {
                pid, usage, limit, ..
            } => {
                tracing::info!(
                    pid = pid.as_raw(),
                    usage_mb = usage.as_mb(),
                    limit_mb = limit.as_mb(),
                    event = "memory_trimmed",
                    "Working set trimmed"
                );
            }
            Self::ProcessTerminated {
                pid, usage, limit, ..
            } => {
                tracing::warn!(
                    pid = pid.as_raw(),
                    usage_mb = usage.as_mb(),
                    limit_mb = limit.as_mb(),
                    event = "process_terminated",
                    "Process terminated for exceeding its memory cap"
                );
            }
            Self::DiskThrottled {
                pid,
                throughput_mb,
                suspended,
                ..
            } => {
                tracing::debug!(
                    pid = pid.as_raw(),
                    throughput_mb,
                    suspended_ms = suspended.as_millis(),
                    event = "disk_throttled",
                    "Disk throughput over limit, process suspended"
                );
            }
            Self::Error { message, .. } => {
                tracing::error!(message = %message, event = "error", "Governor error");
            }
        }
    }
}

impl fmt::Display for GovernorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupsChanged { groups, .. } => {
                write!(f, "{} process group(s) installed", groups.len())
            }
            Self::Notification { text, .. } => f.write_str(text),
            Self::LimitsApplied { group, success, .. } => {
                write!(f, "Limits applied to group {group} (success: {success})")
            }
            Self::MemoryTrimmed {
                pid, usage, limit, ..
            } => write!(f, "Process {pid} trimmed at {usage} (cap {limit})"),
            Self::ProcessTerminated {
                pid, usage, limit, ..
            } => write!(f, "Process {pid} terminated at {usage} (cap {limit})"),
            Self::DiskThrottled {
                pid,
                throughput_mb,
                suspended,
                ..
            } => write!(
                f,
                "Process {pid} suspended for {suspended:?} at {throughput_mb:.2} MB/s"
            ),
            Self::Error { message, .. } => write!(f, "Governor error: {message}"),
        }
    }
}

// Custom Duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryLimitSpec, PriorityLimitSpec};

    fn summary(members: Vec<ProcessInfo>) -> GroupSummary {
        let config = ResourceLimitConfig::new("editors")
            .with_path("/usr/bin/vim")
            .with_memory(MemoryLimitSpec {
                enabled: true,
                cap_mb: 100,
                overuse_action: OveruseAction::Terminate,
                ..MemoryLimitSpec::default()
            })
            .with_priority(PriorityLimitSpec {
                enabled: true,
                level: 1,
            });

        GroupSummary {
            config,
            handle_ready: true,
            is_new: true,
            members,
        }
    }

    #[test]
    fn test_report_lists_members_and_limits() {
        let group = summary(vec![ProcessInfo::new(ProcessId::from_raw(42), "vim", None)]);
        let text = render_report(Some("[added]\n- vim (ID: 42)"), &[group]);

        assert!(text.starts_with("[added]"));
        assert!(text.contains("[group] editors"));
        assert!(text.contains("state: enabled"));
        assert!(text.contains("* /usr/bin/vim"));
        assert!(text.contains("* vim (ID: 42)"));
        assert!(text.contains("memory: cap 100 MB, on overuse terminate"));
        assert!(text.contains("priority: BelowNormal"));
    }

    #[test]
    fn test_report_empty_group() {
        let text = render_report(None, &[summary(Vec::new())]);
        assert!(text.contains("no matching processes"));
        assert!(text.starts_with("===="));
    }

    #[test]
    fn test_report_without_groups() {
        let text = render_report(None, &[]);
        assert!(text.contains("no process groups"));
    }

    #[test]
    fn test_event_critical() {
        let event = GovernorEvent::Error {
            message: "test".to_string(),
            timestamp: SystemTime::now(),
        };
        assert!(event.is_critical());

        let event = GovernorEvent::LimitsApplied {
            group: "A".to_string(),
            success: true,
            timestamp: SystemTime::now(),
        };
        assert!(!event.is_critical());
    }

    #[test]
    fn test_event_serde() {
        let event = GovernorEvent::DiskThrottled {
            pid: ProcessId::from_raw(7),
            throughput_mb: 20.0,
            suspended: Duration::from_millis(500),
            timestamp: SystemTime::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"disk_throttled""#));

        let back: GovernorEvent = serde_json::from_str(&json).unwrap();
        match back {
            GovernorEvent::DiskThrottled { pid, suspended, .. } => {
                assert_eq!(pid, ProcessId::from_raw(7));
                assert_eq!(suspended, Duration::from_millis(500));
            }
            other => panic!("unexpected event: {other}"),
        }
    }
}
