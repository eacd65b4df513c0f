use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use procgov_core::*;

fn sample_config() -> ResourceLimitConfig {
    ResourceLimitConfig::new("browsers")
        .with_path("/usr/bin/firefox")
        .with_cpu(CpuLimitSpec {
            enabled: true,
            rate_mode: CpuRateMode::AbsoluteCap(25),
            affinity_mode: AffinityMode::CoreCount(2),
        })
        .with_memory(MemoryLimitSpec {
            enabled: true,
            cap_mb: 2048,
            ..MemoryLimitSpec::default()
        })
        .with_priority(PriorityLimitSpec {
            enabled: true,
            level: 0,
        })
}

#[test]
fn test_config_json_round_trip() {
    let config = sample_config();

    let json = serde_json::to_string(&config).unwrap();
    let parsed: ResourceLimitConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_config_cpu_mode_wire_format() {
    let json = serde_json::to_value(sample_config()).unwrap();
    assert_eq!(json["cpu"]["rate_mode"]["mode"], "absolute_cap");
    assert_eq!(json["cpu"]["rate_mode"]["value"], 25);
    assert_eq!(json["cpu"]["affinity_mode"]["mode"], "core_count");
}

#[test]
fn test_empty_object_is_disabled_config() {
    let config: ResourceLimitConfig = serde_json::from_str("{}").unwrap();
    assert!(!config.enabled);
    assert!(config.paths.is_empty());
    assert!(!config.memory.enabled);
}

#[test]
fn test_settings_from_partial_json() {
    let settings: GovernorSettings =
        serde_json::from_str(r#"{ "tick_interval_ms": 1000, "kill_on_close": false }"#).unwrap();

    assert_eq!(settings.tick_interval(), Duration::from_secs(1));
    assert_eq!(settings.memory_interval(), Duration::from_secs(2));
    assert_eq!(settings.disk_min_sample(), Duration::from_millis(100));
    assert_eq!(settings.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
    assert!(!settings.kill_on_close);
}

#[test]
fn test_path_match_ignores_case() {
    let process = ProcessInfo::new(
        ProcessId::from_raw(7),
        "Firefox",
        Some("/usr/bin/Firefox".into()),
    );

    assert!(process.matches_path(Path::new("/usr/bin/firefox")));
    assert!(!process.matches_path(Path::new("/usr/bin/firefox-esr")));

    let hidden = ProcessInfo::new(ProcessId::from_raw(8), "kthreadd", None);
    assert!(!hidden.matches_path(Path::new("")));
}

#[test]
fn test_process_display() {
    let process = ProcessInfo::new(ProcessId::from_raw(42), "x", Some("/bin/x".into()));
    assert_eq!(process.to_string(), "x (ID: 42)");
}

#[test]
fn test_memory_size_units() {
    assert_eq!(MemorySize::from_mb(512).as_bytes(), 536_870_912);
    assert_eq!(MemorySize::from_kb(2048), MemorySize::from_mb(2));
    assert_eq!(MemorySize::from_mb(150).as_mb(), 150.0);
    assert!(MemorySize::ZERO.is_zero());
    assert!(MemorySize::from_mb(150) > MemorySize::from_mb(100));
}

#[test]
fn test_memory_size_display() {
    assert_eq!(MemorySize::from_mb(100).to_string(), "100.00 MB");
    assert_eq!(MemorySize::from_kb(4).to_string(), "4.00 KB");
    assert_eq!(MemorySize::from_bytes(12).to_string(), "12 bytes");
}

#[test]
fn test_io_counters_delta() {
    let before = IoCounters::new(1_000, 500);
    let after = IoCounters::new(3_000, 1_500);

    assert_eq!(after.delta_since(before), 3_000);
    assert_eq!(before.delta_since(after), 0);
}

#[test]
fn test_affinity_mask_cores() {
    let mask = AffinityMask::from_bits(0b1010);
    assert_eq!(mask.count(), 2);
    assert_eq!(mask.cores().collect::<Vec<_>>(), vec![1, 3]);
    assert!(AffinityMask::default().is_empty());
}

#[test]
fn test_error_classification() {
    let gone = Error::ProcessGone {
        pid: ProcessId::from_raw(1),
    };
    assert!(gone.is_process_gone());
    assert!(!gone.is_soft_fail());

    let unsupported = Error::Unsupported {
        capability: "network rate control".to_string(),
    };
    assert!(unsupported.is_soft_fail());
    assert!(!unsupported.is_process_gone());

    let missing: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
    assert!(missing.is_process_gone());
}

#[test]
fn test_event_serialization() {
    let event = GovernorEvent::ProcessTerminated {
        pid: ProcessId::from_raw(42),
        usage: MemorySize::from_mb(150),
        limit: MemorySize::from_mb(100),
        timestamp: SystemTime::now(),
    };

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "process_terminated");
    assert_eq!(json["pid"], 42);

    let parsed: GovernorEvent = serde_json::from_value(json).unwrap();
    assert!(matches!(parsed, GovernorEvent::ProcessTerminated { pid, .. } if pid.as_raw() == 42));
}

#[test]
fn test_report_lists_groups() {
    let summary = GroupSummary {
        config: sample_config(),
        handle_ready: true,
        is_new: false,
        members: vec![ProcessInfo::new(
            ProcessId::from_raw(5),
            "firefox",
            Some("/usr/bin/firefox".into()),
        )],
    };

    let report = render_report(Some("[added] firefox (ID: 5)\n"), &[summary]);

    assert!(report.starts_with("[added] firefox (ID: 5)\n\n"));
    assert!(report.contains("[group] browsers"));
    assert!(report.contains("kernel group: ready"));
    assert!(report.contains("* firefox (ID: 5)"));
    assert!(report.contains("cpu: hard cap 25%, 2 core(s)"));
    assert!(report.contains("memory: cap 2048 MB"));
    assert!(report.contains("priority: Idle"));
}

#[test]
fn test_report_without_groups() {
    let report = render_report(None, &[]);
    assert!(report.contains("no process groups"));
}
