//! End-to-end reconciliation tests against the mock kernel layer

use std::sync::Arc;
use std::time::Duration;

use procgov_cgroup::{MockBackend, MockProcessControl};
use procgov_core::{
    BYTES_PER_MB, ConfigEvent, DiskLimitSpec, GovernorEvent, GovernorSettings, IoCounters,
    MemoryLimitSpec, MemorySize, PriorityClass, PriorityLimitSpec, ProcessId, ProcessInfo,
    ResourceLimitConfig, StaticConfigSource,
};
use procgov_governor::Governor;

struct Harness {
    backend: MockBackend,
    control: Arc<MockProcessControl>,
    source: Arc<StaticConfigSource>,
    governor: Arc<Governor>,
}

fn harness(configs: Vec<ResourceLimitConfig>) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("procgov=debug")
        .try_init();

    let backend = MockBackend::new();
    let control = Arc::new(MockProcessControl::new(4));
    let source = Arc::new(StaticConfigSource::new(configs));
    let governor = Governor::new(
        Arc::new(backend.clone()),
        control.clone(),
        source.clone(),
        GovernorSettings::default(),
    );
    Harness {
        backend,
        control,
        source,
        governor,
    }
}

fn process(pid: i32, exe: &str) -> ProcessInfo {
    let name = exe.rsplit('/').next().unwrap_or(exe);
    ProcessInfo::new(ProcessId::from_raw(pid), name, Some(exe.into()))
}

fn priority_config(name: &str, path: &str) -> ResourceLimitConfig {
    ResourceLimitConfig::new(name)
        .with_path(path)
        .with_priority(PriorityLimitSpec {
            enabled: true,
            level: 1,
        })
}

fn memory_config(name: &str, path: &str, cap_mb: u64) -> ResourceLimitConfig {
    ResourceLimitConfig::new(name)
        .with_path(path)
        .with_memory(MemoryLimitSpec {
            enabled: true,
            cap_mb,
            enable_monitoring: true,
            terminate_on_exceed: true,
            ..MemoryLimitSpec::default()
        })
}

#[tokio::test(start_paused = true)]
async fn test_memory_overuse_terminates_process() {
    let config = memory_config("A", "/bin/x", 100);
    let h = harness(vec![config.clone()]);
    h.control.spawn(process(42, "/bin/x")).await;

    h.governor.tick().await.unwrap();
    let groups = h.governor.groups().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members, vec![process(42, "/bin/x")]);
    assert!(groups[0].is_new);

    assert!(h.governor.update_configs(Some(vec![config])).await);
    let monitor = h.governor.memory_monitor();
    let entry = monitor.entry(ProcessId::from_raw(42)).unwrap();
    assert_eq!(entry.limit, MemorySize::from_mb(100));

    h.control
        .set_working_set(ProcessId::from_raw(42), MemorySize::from_mb(150))
        .await;
    monitor.poll_once().await;

    assert_eq!(h.control.terminated().await, vec![ProcessId::from_raw(42)]);
    assert!(!monitor.contains(ProcessId::from_raw(42)));

    h.governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_first_tick_builds_without_applying() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;

    h.governor.tick().await.unwrap();

    assert_eq!(h.governor.groups().await[0].members.len(), 1);
    assert_eq!(h.control.call_count().await, 0);
    assert_eq!(h.control.process(ProcessId::from_raw(1)).await.unwrap().priority, None);
}

#[tokio::test]
async fn test_empty_config_update_is_noop() {
    let h = harness(vec![memory_config("A", "/bin/x", 100)]);
    h.control.spawn(process(1, "/bin/x")).await;
    assert!(h.governor.request_apply().await);

    let groups = h.governor.groups().await;
    let backend_calls = h.backend.call_count().await;

    assert!(!h.governor.update_configs(None).await);
    assert!(!h.governor.update_configs(Some(Vec::new())).await);

    assert_eq!(h.governor.groups().await, groups);
    assert_eq!(h.backend.call_count().await, backend_calls);
    assert!(h.governor.memory_monitor().contains(ProcessId::from_raw(1)));
    assert_eq!(h.backend.group("A").await.unwrap().open_handles, 1);

    h.governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unchanged_tick_makes_no_kernel_calls() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.tick().await.unwrap();
    assert!(h.governor.request_apply().await);

    let mut events = h.governor.subscribe();
    let backend_calls = h.backend.call_count().await;
    let control_calls = h.control.call_count().await;

    h.governor.tick().await.unwrap();
    h.governor.tick().await.unwrap();

    assert_eq!(h.backend.call_count().await, backend_calls);
    assert_eq!(h.control.call_count().await, control_calls);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_only_groups_with_new_members_are_throttled() {
    let h = harness(vec![
        priority_config("A", "/bin/x"),
        priority_config("B", "/bin/y"),
    ]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.tick().await.unwrap();
    assert!(h.governor.request_apply().await);
    let control_calls = h.control.call_count().await;

    h.control.spawn(process(2, "/bin/y")).await;
    h.governor.tick().await.unwrap();

    // Only B's new member got a priority call
    assert_eq!(h.control.call_count().await, control_calls + 1);
    assert_eq!(
        h.control.process(ProcessId::from_raw(2)).await.unwrap().priority,
        Some(PriorityClass::BelowNormal)
    );
    let groups = h.governor.groups().await;
    assert!(groups.iter().all(|g| !g.is_new));
}

#[tokio::test]
async fn test_unrelated_churn_keeps_kernel_group_and_monitors() {
    let h = harness(vec![memory_config("A", "/bin/x", 100)]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.tick().await.unwrap();
    assert!(h.governor.request_apply().await);

    h.control.spawn(process(99, "/usr/bin/other")).await;
    h.governor.tick().await.unwrap();
    h.control.exit(ProcessId::from_raw(99)).await;
    h.governor.tick().await.unwrap();

    let group = h.backend.group("A").await.unwrap();
    assert_eq!(group.open_handles, 1);
    assert_eq!(group.memory_limit, Some(MemorySize::from_mb(100)));
    assert!(h.control.terminated().await.is_empty());
    assert!(h.governor.memory_monitor().contains(ProcessId::from_raw(1)));

    h.governor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disk_limit_holds_under_unrelated_churn() {
    let h = harness(vec![ResourceLimitConfig::new("A").with_path("/bin/cp").with_disk(
        DiskLimitSpec {
            enabled: true,
            rate_limit_mb_per_sec: 10,
        },
    )]);
    let writer = ProcessId::from_raw(42);
    h.control.spawn(process(42, "/bin/cp")).await;
    h.governor.tick().await.unwrap();
    assert!(h.governor.request_apply().await);

    // 100 MB/s against a 10 MB/s cap, with a new shell every step
    let mut written = 0;
    for step in 0..20 {
        written += 50 * BYTES_PER_MB;
        h.control.set_io(writer, IoCounters::new(0, written)).await;
        h.control.spawn(process(1000 + step, "/bin/sh")).await;
        h.governor.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    assert!(h.control.process(writer).await.unwrap().suspend_count > 0);
    let entry = h.governor.disk_monitor().entry(writer).unwrap();
    assert!(entry.last_counters.is_some());
    assert!(h.governor.disk_monitor().is_monitoring());

    // Leaving the group still drops the registration
    h.control.exit(writer).await;
    h.governor.tick().await.unwrap();
    assert!(!h.governor.disk_monitor().contains(writer));

    h.governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_changed_config_is_reapplied() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.tick().await.unwrap();
    assert!(h.governor.request_apply().await);

    let mut config = priority_config("A", "/bin/x");
    config.priority.level = 4;
    assert!(h.governor.update_configs(Some(vec![config])).await);

    assert_eq!(
        h.control.process(ProcessId::from_raw(1)).await.unwrap().priority,
        Some(PriorityClass::High)
    );
}

#[tokio::test]
async fn test_change_notification_lists_added_and_removed() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.tick().await.unwrap();

    let mut events = h.governor.subscribe();
    h.control.exit(ProcessId::from_raw(1)).await;
    h.control.spawn(process(2, "/bin/x")).await;
    h.governor.tick().await.unwrap();

    match events.recv().await.unwrap() {
        GovernorEvent::GroupsChanged { groups, .. } => {
            assert_eq!(groups[0].members, vec![process(2, "/bin/x")]);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match events.recv().await.unwrap() {
        GovernorEvent::Notification { text, .. } => {
            assert!(text.contains("[added] x (ID: 2)"));
            assert!(text.contains("[removed] x (ID: 1)"));
            assert!(text.contains("[group] A"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        GovernorEvent::LimitsApplied { success: true, .. }
    ));
}

#[tokio::test]
async fn test_request_apply_reloads_source() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/y")).await;
    assert!(h.governor.request_apply().await);
    assert!(h.governor.groups().await[0].members.is_empty());

    h.source.set(vec![priority_config("A", "/bin/y")]);
    assert!(h.governor.request_apply().await);

    assert_eq!(h.governor.groups().await[0].members.len(), 1);
    assert_eq!(
        h.control.process(ProcessId::from_raw(1)).await.unwrap().priority,
        Some(PriorityClass::BelowNormal)
    );
}

#[tokio::test]
async fn test_disabled_config_gets_no_kernel_group() {
    let mut config = priority_config("A", "/bin/x");
    config.enabled = false;
    let h = harness(vec![config]);
    h.control.spawn(process(1, "/bin/x")).await;

    assert!(h.governor.request_apply().await);

    let groups = h.governor.groups().await;
    assert_eq!(groups.len(), 1);
    assert!(!groups[0].handle_ready);
    assert!(groups[0].members.is_empty());
    assert!(h.backend.group("A").await.is_none());
}

#[tokio::test]
async fn test_degraded_group_still_monitors_memory() {
    let h = harness(vec![memory_config("A", "/bin/x", 100)]);
    h.backend.set_fail_create(true).await;
    h.control.spawn(process(1, "/bin/x")).await;

    assert!(!h.governor.request_apply().await);

    assert!(!h.governor.groups().await[0].handle_ready);
    assert!(h.governor.memory_monitor().contains(ProcessId::from_raw(1)));
    h.governor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_disposes_everything() {
    let h = harness(vec![
        memory_config("A", "/bin/x", 100).with_disk(DiskLimitSpec {
            enabled: true,
            rate_limit_mb_per_sec: 10,
        }),
    ]);
    h.control.spawn(process(1, "/bin/x")).await;
    h.governor.start().await;
    assert!(h.governor.request_apply().await);
    assert!(h.governor.memory_monitor().is_monitoring());
    assert!(h.governor.disk_monitor().is_monitoring());

    h.governor.shutdown().await.unwrap();

    assert!(!h.governor.is_running().await);
    assert!(h.governor.groups().await.is_empty());
    assert!(!h.governor.memory_monitor().is_monitoring());
    assert!(!h.governor.disk_monitor().is_monitoring());
    assert!(h.governor.memory_monitor().is_empty());
    let group = h.backend.group("A").await.unwrap();
    assert_eq!(group.open_handles, 0);
    assert!(group.kill_on_close);
}

#[tokio::test]
async fn test_snapshot_failure_is_reported() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.fail_snapshots(1).await;

    assert!(h.governor.tick().await.is_err());
    assert!(h.governor.tick().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_slow_snapshot_does_not_block_readers() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;
    assert!(h.governor.request_apply().await);
    let before = h.governor.groups().await;

    h.control.delay_snapshots(Duration::from_secs(10)).await;
    h.control.spawn(process(2, "/bin/x")).await;
    let governor = Arc::clone(&h.governor);
    let tick = tokio::spawn(async move { governor.tick().await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The tick is still scanning; readers see the current generation
    let groups = tokio::time::timeout(Duration::from_millis(100), h.governor.groups())
        .await
        .expect("groups() waited on the process scan");
    assert_eq!(groups, before);

    tick.await.unwrap().unwrap();
    assert_eq!(h.governor.groups().await[0].members.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_tick_task_follows_process_table() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/x")).await;
    assert!(h.governor.request_apply().await);
    h.governor.start().await;
    assert!(h.governor.is_running().await);

    h.control.spawn(process(2, "/bin/x")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.governor.groups().await[0].members.len(), 2);
    assert_eq!(
        h.control.process(ProcessId::from_raw(2)).await.unwrap().priority,
        Some(PriorityClass::BelowNormal)
    );

    h.governor.stop().await.unwrap();
    assert!(!h.governor.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_config_commands_are_handled_by_tick_task() {
    let h = harness(vec![priority_config("A", "/bin/x")]);
    h.control.spawn(process(1, "/bin/y")).await;
    h.governor.start().await;

    h.governor
        .command_sender()
        .send(ConfigEvent::Changed(vec![priority_config("B", "/bin/y")]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let groups = h.governor.groups().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name(), "B");
    assert_eq!(
        h.control.process(ProcessId::from_raw(1)).await.unwrap().priority,
        Some(PriorityClass::BelowNormal)
    );

    h.governor.shutdown().await.unwrap();
}
