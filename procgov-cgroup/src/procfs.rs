//! Linux per-process controls over procfs and syscalls
//!
//! This module reads process state from `/proc`:
//! - `/proc/<pid>/status` (resident set, `VmRSS`)
//! - `/proc/<pid>/io` (cumulative storage I/O)
//! - `/proc/<pid>/maps` (address ranges for working-set trimming)
//! - `/proc/<pid>/task` (threads, for affinity and priority)

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, SysconfVar, sysconf};
use procgov_core::{
    AffinityMask, Error, IoCounters, MemorySize, PriorityClass, ProcessId, ProcessInfo, Result,
};
use tokio::fs;
use tracing::{debug, trace};

use crate::process::ProcessControl;

/// Default procfs mount point
pub const PROC_ROOT: &str = "/proc";

/// iovecs per `process_madvise` call (well below `UIO_MAXIOV`)
const MADVISE_BATCH: usize = 512;

/// Online logical cores, clamped to `1..=64`
#[must_use]
pub fn online_cores() -> usize {
    let n = sysconf(SysconfVar::_NPROCESSORS_ONLN)
        .ok()
        .flatten()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(1);
    n.clamp(1, AffinityMask::MAX_CORES)
}

/// System page size (4 KiB if it cannot be queried)
#[must_use]
pub fn system_page_size() -> MemorySize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|n| u64::try_from(n).ok())
        .map_or(MemorySize::from_kb(4), MemorySize::from_bytes)
}

/// Nice value used for each priority class
#[must_use]
pub const fn nice_value(class: PriorityClass) -> i32 {
    match class {
        PriorityClass::Idle => 19,
        PriorityClass::BelowNormal => 10,
        PriorityClass::Normal => 0,
        PriorityClass::AboveNormal => -5,
        PriorityClass::High => -10,
        PriorityClass::RealTime => -20,
    }
}

/// Parse the `VmRSS` line of `/proc/<pid>/status`
///
/// Format:
/// ```text
/// VmRSS:	   12345 kB
/// ```
#[must_use]
pub fn parse_vm_rss(status: &str) -> Option<MemorySize> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("VmRSS:")?;
        let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(MemorySize::from_kb(kb))
    })
}

/// Parse `/proc/<pid>/io`
///
/// Format:
/// ```text
/// rchar: 323934931
/// wchar: 323929600
/// read_bytes: 4096
/// write_bytes: 323932160
/// ```
#[must_use]
pub fn parse_io(content: &str) -> Option<IoCounters> {
    let mut read = None;
    let mut write = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u64>().ok();
        match key.trim() {
            "read_bytes" => read = value,
            "write_bytes" => write = value,
            _ => {}
        }
    }

    Some(IoCounters::new(read?, write?))
}

/// Address ranges of `/proc/<pid>/maps` that can be paged out
///
/// Format:
/// ```text
/// 55d0c5a00000-55d0c5a21000 rw-p 00000000 00:00 0    [heap]
/// ```
#[must_use]
pub fn parse_maps(content: &str) -> Vec<(usize, usize)> {
    content
        .lines()
        .filter(|line| !line.ends_with("[vsyscall]") && !line.ends_with("[vvar]"))
        .filter_map(|line| {
            let range = line.split_whitespace().next()?;
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (end > start).then_some((start, end))
        })
        .collect()
}

/// [`ProcessControl`] for Linux
#[derive(Debug, Clone)]
pub struct LinuxProcessControl {
    proc_root: PathBuf,
    cores: usize,
    page_size: MemorySize,
}

impl Default for LinuxProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxProcessControl {
    /// Control over the live system
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(PROC_ROOT)
    }

    /// Read process state from another procfs-shaped tree
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cores: online_cores(),
            page_size: system_page_size(),
        }
    }

    fn pid_dir(&self, pid: ProcessId) -> PathBuf {
        self.proc_root.join(pid.as_raw().to_string())
    }

    async fn read_proc_file(&self, pid: ProcessId, file: &str) -> Result<String> {
        fs::read_to_string(self.pid_dir(pid).join(file))
            .await
            .map_err(|e| map_io(pid, &format!("Read /proc/{pid}/{file}"), e))
    }

    /// Thread ids of `pid`
    async fn threads(&self, pid: ProcessId) -> Result<Vec<Pid>> {
        let task_dir = self.pid_dir(pid).join("task");
        let mut entries = fs::read_dir(&task_dir)
            .await
            .map_err(|e| map_io(pid, "List threads", e))?;

        let mut tids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                tids.push(Pid::from_raw(tid));
            }
        }
        Ok(tids)
    }

    /// Run `op` on every thread of `pid`.
    ///
    /// Threads that exit meanwhile are skipped; the first other error is
    /// returned after every thread was tried.
    async fn for_each_thread(
        &self,
        pid: ProcessId,
        operation: &str,
        op: impl Fn(Pid) -> std::result::Result<(), Errno>,
    ) -> Result<()> {
        let tids = self.threads(pid).await?;
        let mut first_error = None;
        let mut touched = 0usize;

        for tid in tids {
            match op(tid) {
                Ok(()) => touched += 1,
                Err(Errno::ESRCH) => trace!(pid = pid.as_raw(), tid = tid.as_raw(), "Thread exited"),
                Err(errno) => {
                    debug!(pid = pid.as_raw(), tid = tid.as_raw(), "{} failed: {}", operation, errno);
                    first_error.get_or_insert(errno);
                }
            }
        }

        match first_error {
            Some(errno) => Err(map_errno(pid, operation, errno)),
            None if touched == 0 => Err(Error::ProcessGone { pid }),
            None => Ok(()),
        }
    }

    async fn read_info(&self, pid: ProcessId) -> Option<ProcessInfo> {
        let dir = self.pid_dir(pid);
        let comm = fs::read_to_string(dir.join("comm")).await.ok()?;
        let exe = fs::read_link(dir.join("exe")).await.ok();

        let name = exe
            .as_deref()
            .and_then(Path::file_name)
            .map_or_else(|| comm.trim().to_string(), |n| n.to_string_lossy().into_owned());

        Some(ProcessInfo::new(pid, name, exe))
    }

    fn signal(pid: ProcessId, signal: Signal) -> Result<()> {
        kill(pid.as_nix_pid(), signal).map_err(|e| map_errno(pid, "Signal process", e))
    }
}

#[async_trait]
impl ProcessControl for LinuxProcessControl {
    async fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
        let mut entries = fs::read_dir(&self.proc_root).await?;
        let mut processes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Exited between listing and reading
            if let Some(info) = self.read_info(ProcessId::from_raw(pid)).await {
                processes.push(info);
            }
        }

        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }

    fn page_size(&self) -> MemorySize {
        self.page_size
    }

    async fn set_affinity(&self, pid: ProcessId, mask: AffinityMask) -> Result<()> {
        let mut set = CpuSet::new();
        for core in mask.cores() {
            set.set(core).map_err(|e| map_errno(pid, "Build CPU set", e))?;
        }

        debug!(pid = pid.as_raw(), mask = %mask, "Setting affinity");
        self.for_each_thread(pid, "Set affinity", |tid| sched_setaffinity(tid, &set))
            .await
    }

    async fn set_priority(&self, pid: ProcessId, class: PriorityClass) -> Result<()> {
        let nice = nice_value(class);

        debug!(pid = pid.as_raw(), class = class.label(), nice, "Setting priority");
        self.for_each_thread(pid, "Set priority", |tid| {
            // Thread ids read from /proc are positive
            #[allow(clippy::cast_sign_loss)]
            let who = tid.as_raw() as libc::id_t;
            // SAFETY: plain syscall on integer arguments.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, who, nice) };
            if rc == 0 { Ok(()) } else { Err(Errno::last()) }
        })
        .await
    }

    async fn set_working_set_bounds(
        &self,
        pid: ProcessId,
        _min: MemorySize,
        max: MemorySize,
    ) -> Result<()> {
        let limit = libc::rlimit {
            rlim_cur: max.as_bytes(),
            rlim_max: max.as_bytes(),
        };

        debug!(pid = pid.as_raw(), max = %max, "Setting RSS limit");
        // SAFETY: `limit` outlives the call; old-limit pointer may be null.
        let rc = unsafe {
            libc::prlimit(pid.as_raw(), libc::RLIMIT_RSS, &raw const limit, std::ptr::null_mut())
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(map_errno(pid, "Set RSS limit", Errno::last()))
        }
    }

    async fn working_set(&self, pid: ProcessId) -> Result<MemorySize> {
        let status = self.read_proc_file(pid, "status").await?;
        // Kernel threads have no VmRSS line
        Ok(parse_vm_rss(&status).unwrap_or(MemorySize::ZERO))
    }

    async fn trim_working_set(&self, pid: ProcessId) -> Result<()> {
        let maps = self.read_proc_file(pid, "maps").await?;
        let ranges = parse_maps(&maps);

        debug!(pid = pid.as_raw(), ranges = ranges.len(), "Paging out working set");
        tokio::task::spawn_blocking(move || page_out(pid, &ranges)).await?
    }

    async fn terminate(&self, pid: ProcessId) -> Result<()> {
        debug!(pid = pid.as_raw(), "Killing process");
        Self::signal(pid, Signal::SIGKILL)
    }

    async fn io_counters(&self, pid: ProcessId) -> Result<IoCounters> {
        let content = self.read_proc_file(pid, "io").await?;
        parse_io(&content).ok_or_else(|| Error::Unsupported {
            capability: "per-process I/O accounting".to_string(),
        })
    }

    async fn suspend(&self, pid: ProcessId) -> Result<()> {
        Self::signal(pid, Signal::SIGSTOP)
    }

    async fn resume(&self, pid: ProcessId) -> Result<()> {
        Self::signal(pid, Signal::SIGCONT)
    }
}

fn pidfd_open(pid: ProcessId) -> Result<OwnedFd> {
    // SAFETY: syscall invocation; returns -1 and sets errno on failure.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(map_errno(pid, "Open pidfd", Errno::last()));
    }
    let fd = RawFd::try_from(fd).map_err(|_| Error::Io(io::Error::other("pidfd out of range")))?;
    // SAFETY: fd was just returned by pidfd_open and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Ask the kernel to reclaim every range of `pid`. Individual ranges that
/// cannot be paged out (locked, special mappings) are skipped.
fn page_out(pid: ProcessId, ranges: &[(usize, usize)]) -> Result<()> {
    use std::os::fd::AsRawFd;

    let pidfd = pidfd_open(pid)?;

    for batch in ranges.chunks(MADVISE_BATCH) {
        let iov: Vec<libc::iovec> = batch
            .iter()
            .map(|&(start, end)| libc::iovec {
                iov_base: start as *mut libc::c_void,
                iov_len: end - start,
            })
            .collect();

        // SAFETY: iov points to `iov.len()` valid iovec structs; the ranges
        // address the target process, not ours.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_process_madvise,
                pidfd.as_raw_fd(),
                iov.as_ptr(),
                iov.len(),
                libc::MADV_PAGEOUT,
                0,
            )
        };

        if rc < 0 {
            match Errno::last() {
                Errno::ENOSYS => {
                    return Err(Error::Unsupported {
                        capability: "process_madvise".to_string(),
                    });
                }
                Errno::ESRCH => return Err(Error::ProcessGone { pid }),
                errno => trace!(pid = pid.as_raw(), "Skipping ranges: {}", errno),
            }
        }
    }

    Ok(())
}

fn map_io(pid: ProcessId, operation: &str, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::ProcessGone { pid },
        io::ErrorKind::PermissionDenied => Error::PermissionDenied {
            operation: format!("{operation}: {e}"),
        },
        _ => Error::Io(e),
    }
}

fn map_errno(pid: ProcessId, operation: &str, errno: Errno) -> Error {
    match errno {
        Errno::ESRCH => Error::ProcessGone { pid },
        Errno::EPERM | Errno::EACCES => Error::PermissionDenied {
            operation: format!("{operation}: {errno}"),
        },
        errno => Error::System(errno),
    }
}
