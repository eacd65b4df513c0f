//! CGroup v2 backend and controller

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use procgov_core::{Error, ProcessId, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::backend::{GroupHandle, ResourceBackend};

/// Default mount point of the cgroup v2 hierarchy
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Directory under the root that holds every procgov group
pub const PROCGOV_NAMESPACE: &str = "procgov";

/// Controllers procgov needs enabled for its groups
const NEEDED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "io"];

/// Open handles per cgroup directory
type Leases = Arc<Mutex<HashMap<PathBuf, usize>>>;

/// Production backend creating cgroup v2 groups
///
/// Handles for the same group name share one directory. The directory is
/// released only when the last handle for it is closed, so a governor that
/// acquires a new generation's handle before closing the old one keeps the
/// kernel limits in place.
#[derive(Debug, Clone)]
pub struct CGroupBackend {
    root: PathBuf,
    cores: usize,
    leases: Leases,
}

impl CGroupBackend {
    /// Backend rooted at `root` (usually [`CGROUP_ROOT`]) on a machine with
    /// `cores` logical cores (used to scale hard CPU caps).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, cores: usize) -> Self {
        Self {
            root: root.into(),
            cores: cores.max(1),
            leases: Arc::default(),
        }
    }

    /// Directory a group named `name` lives in
    #[must_use]
    pub fn group_path(&self, name: &str) -> PathBuf {
        self.root.join(PROCGOV_NAMESPACE).join(slug(name))
    }

    /// Number of open handles for `name` (for diagnostics)
    #[must_use]
    pub fn open_handles(&self, name: &str) -> usize {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.get(&self.group_path(name)).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceBackend for CGroupBackend {
    async fn create_group(&self, name: &str) -> Result<Box<dyn GroupHandle>> {
        let controller = CGroupController::new(
            name,
            &self.root,
            self.group_path(name),
            self.cores,
            Arc::clone(&self.leases),
        )
        .await?;
        Ok(Box::new(controller))
    }
}

/// Directory-safe, collision-free name for a group.
///
/// Keeps ASCII alphanumerics, `-` and `_` (lowercased), replaces everything
/// else with `-`, and appends a hash of the full name so names that differ
/// only in replaced characters stay distinct.
#[must_use]
pub fn slug(name: &str) -> String {
    let mut base: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(48)
        .collect();

    if base.trim_matches('-').is_empty() {
        base = "group".to_string();
    }

    format!("{base}-{:08x}", fnv1a(name.as_bytes()))
}

// 32-bit FNV-1a: stable across runs and toolchains.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// One handle on a cgroup v2 directory
///
/// This struct represents a CGroup in the filesystem hierarchy.
/// It provides methods to:
/// - Set resource limits (CPU, memory)
/// - Add processes
/// - Release the group (optionally killing its members) on close
pub struct CGroupController {
    /// Group name as configured
    pub(crate) name: String,

    /// Full path to this group directory
    /// example: /sys/fs/cgroup/procgov/editors-1a2b3c4d
    pub(crate) path: PathBuf,

    /// Logical cores, for hard-cap scaling
    pub(crate) cores: usize,

    /// Kill members when the last handle closes
    pub(crate) kill_on_close: AtomicBool,

    /// Whether this handle has been closed
    pub(crate) closed: AtomicBool,

    leases: Leases,
}

impl CGroupController {
    /// Create (or join) the cgroup directory and take a lease on it
    ///
    /// This will:
    /// 1. Enable the needed controllers at the root
    /// 2. Create the namespace directory and enable controllers in it
    /// 3. Create the group directory
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Not running as root
    /// - CGroup v2 not available
    /// - Directory creation fails
    pub async fn new(
        name: &str,
        root: &Path,
        path: PathBuf,
        cores: usize,
        leases: Leases,
    ) -> Result<Self> {
        debug!(group = name, path = %path.display(), "Creating cgroup");

        Self::create(root, &path).await?;

        *leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_insert(0) += 1;

        Ok(Self {
            name: name.to_string(),
            path,
            cores,
            kill_on_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            leases,
        })
    }

    /// Get the cgroup path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail if this handle was already closed
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CGroup {
                message: format!("CGroup handle for '{}' is closed", self.name),
            });
        }
        Ok(())
    }

    /// Create the cgroup directory structure
    async fn create(root: &Path, path: &Path) -> Result<()> {
        if !root.join("cgroup.controllers").exists() {
            return Err(Error::Unsupported {
                capability: format!("cgroup v2 hierarchy at {}", root.display()),
            });
        }

        Self::enable_controllers(root, true).await?;

        let parent = path.parent().ok_or_else(|| Error::InvalidConfig {
            message: "Invalid cgroup path".to_string(),
        })?;

        if !parent.exists() {
            debug!("Creating parent directory: {}", parent.display());
            fs::create_dir_all(parent)
                .await
                .map_err(|e| permission_or_io("Create parent directory", e))?;
        }

        Self::enable_controllers(parent, false).await?;

        if !path.exists() {
            debug!("Creating cgroup directory: {}", path.display());
            fs::create_dir(path).await.map_err(|e| Error::CGroup {
                message: format!("Failed to create cgroup directory: {e}"),
            })?;
        }

        Ok(())
    }

    /// Enable the needed controllers in `dir`'s `cgroup.subtree_control`.
    ///
    /// At the root a failure is tolerated (the system may manage it); below
    /// it only a permission error is.
    async fn enable_controllers(dir: &Path, tolerate_all: bool) -> Result<()> {
        let control_file = dir.join("cgroup.subtree_control");

        let current = match fs::read_to_string(&control_file).await {
            Ok(content) => content,
            Err(e) => {
                debug!("Could not read {}: {}", control_file.display(), e);
                String::new()
            }
        };

        let missing: Vec<&str> = NEEDED_CONTROLLERS
            .iter()
            .filter(|&&controller| !current.split_whitespace().any(|c| c == controller))
            .copied()
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let to_enable = missing
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");

        debug!("Enabling controllers in {}: {}", dir.display(), to_enable);

        match fs::write(&control_file, &to_enable).await {
            Ok(()) => Ok(()),
            Err(e) if tolerate_all || e.kind() == std::io::ErrorKind::PermissionDenied => {
                debug!(
                    "Could not enable controllers in {} (may be managed higher up): {}",
                    dir.display(),
                    e
                );
                Ok(())
            }
            Err(e) => Err(Error::PermissionDenied {
                operation: format!("Enable controllers in {}: {}", dir.display(), e),
            }),
        }
    }

    /// Drop this handle's lease; true if it was the last one
    fn release_lease(&self) -> bool {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(&self.path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                leases.remove(&self.path);
                true
            }
            None => false,
        }
    }

    /// Tear the directory down after the last lease went away
    async fn release_directory(&self) -> Result<()> {
        if self.kill_on_close.load(Ordering::SeqCst) {
            self.kill_members().await?;
        } else {
            self.remove_cpu_limit().await?;
            self.remove_memory_limit().await?;
        }

        // A populated group cannot be removed; members keep running in it.
        if let Err(e) = fs::remove_dir(&self.path).await {
            debug!(
                group = %self.name,
                "Leaving cgroup directory {} in place: {}",
                self.path.display(),
                e
            );
        }

        Ok(())
    }

    /// Kill every process in the group
    async fn kill_members(&self) -> Result<()> {
        let kill_file = self.path.join("cgroup.kill");

        if kill_file.exists() {
            debug!(group = %self.name, "Killing cgroup members via cgroup.kill");
            return fs::write(&kill_file, "1")
                .await
                .map_err(|e| permission_or_io("Kill cgroup members", e));
        }

        // Kernels before 5.14 have no cgroup.kill
        let procs = fs::read_to_string(self.path.join("cgroup.procs")).await?;
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                debug!(group = %self.name, pid, "Could not kill member: {}", e);
            }
        }
        Ok(())
    }

    pub(crate) async fn close_handle(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.release_lease() {
            debug!(group = %self.name, "Last handle closed, releasing cgroup");
            self.release_directory().await?;
        }

        Ok(())
    }

    pub(crate) async fn assign(&self, pid: ProcessId) -> Result<()> {
        self.ensure_open()?;

        let procs_file = self.path.join("cgroup.procs");

        debug!(group = %self.name, pid = pid.as_raw(), "Adding process to cgroup");

        fs::write(&procs_file, pid.as_raw().to_string())
            .await
            .map_err(|e| match e.raw_os_error() {
                Some(nix::libc::ESRCH) => Error::ProcessGone { pid },
                _ => permission_or_io("Add process to cgroup", e),
            })
    }
}

/// Map an I/O error to `PermissionDenied` when that is what it is
pub(crate) fn permission_or_io(operation: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::PermissionDenied {
            operation: format!("{operation}: {e}"),
        }
    } else {
        Error::Io(e)
    }
}

impl std::fmt::Debug for CGroupController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CGroupController")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for CGroupController {
    /// Fallback (if explicit close wasn't called): give the lease back so
    /// the count stays right. The directory itself is left alone.
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        warn!(group = %self.name, "CGroup handle not explicitly closed, using Drop fallback");
        self.release_lease();
    }
}
