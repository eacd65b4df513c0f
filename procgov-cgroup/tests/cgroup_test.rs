use std::path::Path;

use procgov_cgroup::{CGROUP_ROOT, CGroupBackend, CpuRateControl, ResourceBackend};
use procgov_core::{MemorySize, ProcessId};

/// Check if running as root on a cgroup v2 host
fn can_manage_cgroups() -> bool {
    (unsafe { libc::getuid() == 0 }) && Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

#[tokio::test]
async fn test_group_limits_written() {
    if !can_manage_cgroups() {
        println!("Skipping test (need root and cgroup v2)");
        return;
    }

    let backend = CGroupBackend::new(CGROUP_ROOT, 2);
    let path = backend.group_path("procgov-test-limits");
    let group = backend.create_group("procgov-test-limits").await.unwrap();

    group.set_cpu_rate(CpuRateControl::HardCap(5_000)).await.unwrap();
    let cpu_max = std::fs::read_to_string(path.join("cpu.max")).unwrap();
    assert_eq!(cpu_max.trim(), "100000 100000");

    group.set_cpu_rate(CpuRateControl::Weight(2)).await.unwrap();
    let weight = std::fs::read_to_string(path.join("cpu.weight")).unwrap();
    assert_eq!(weight.trim(), "40");

    group.set_memory_limit(MemorySize::from_mb(256)).await.unwrap();
    let memory_max = std::fs::read_to_string(path.join("memory.max")).unwrap();
    assert_eq!(memory_max.trim(), "268435456");

    group.set_kill_on_close(false).await.unwrap();
    group.close().await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_handles_share_directory() {
    if !can_manage_cgroups() {
        println!("Skipping test (need root and cgroup v2)");
        return;
    }

    let backend = CGroupBackend::new(CGROUP_ROOT, 1);
    let path = backend.group_path("procgov-test-shared");

    let old = backend.create_group("procgov-test-shared").await.unwrap();
    let new = backend.create_group("procgov-test-shared").await.unwrap();
    assert_eq!(backend.open_handles("procgov-test-shared"), 2);

    old.set_kill_on_close(false).await.unwrap();
    old.close().await.unwrap();
    assert!(path.exists());

    new.set_kill_on_close(false).await.unwrap();
    new.close().await.unwrap();
    assert_eq!(backend.open_handles("procgov-test-shared"), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_add_missing_process() {
    if !can_manage_cgroups() {
        println!("Skipping test (need root and cgroup v2)");
        return;
    }

    let backend = CGroupBackend::new(CGROUP_ROOT, 1);
    let group = backend.create_group("procgov-test-missing").await.unwrap();

    // PIDs are capped well below i32::MAX
    let err = group.add_process(ProcessId::from_raw(i32::MAX - 1)).await.unwrap_err();
    assert!(err.is_process_gone() || matches!(err, procgov_core::Error::Io(_)));

    group.set_kill_on_close(false).await.unwrap();
    group.close().await.unwrap();
}
