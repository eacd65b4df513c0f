//! Core type definitions with strong typing

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        Self(std::process::id() as i32)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        Self::from_raw(pid.0)
    }
}

/// One entry of an OS process snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: ProcessId,
    /// Short process name (`comm`)
    pub name: String,
    /// Resolved executable image path; `None` when it cannot be read
    /// (kernel threads, processes owned by other users without privilege)
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    /// Create a snapshot entry
    #[must_use]
    pub fn new(pid: ProcessId, name: impl Into<String>, exe: Option<PathBuf>) -> Self {
        Self {
            pid,
            name: name.into(),
            exe,
        }
    }

    /// Case-insensitive comparison of the executable image path.
    ///
    /// Processes whose image path is unreadable never match.
    #[must_use]
    pub fn matches_path(&self, path: &Path) -> bool {
        let Some(exe) = self.exe.as_deref() else {
            return false;
        };

        exe.to_string_lossy()
            .to_lowercase()
            .eq(&path.to_string_lossy().to_lowercase())
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ID: {})", self.name, self.pid)
    }
}
