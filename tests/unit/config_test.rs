//! Tests for configuration validation

use prometheus_operations::config::{OperationsConfig, SchedulerConfig};

#[test]
fn test_scheduler_config_validation() {
    let valid = SchedulerConfig::new("coordinators")
        .with_worker_count(4)
        .with_max_queue_depth(64);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_worker_count() {
    let invalid = SchedulerConfig::new("coordinators").with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_queue_depth() {
    let invalid = SchedulerConfig::new("coordinators").with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_name() {
    let invalid = SchedulerConfig::new("  ");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_operations_config_validation() {
    let json = r#"{
        "schedulers": {
            "coordinators": { "worker_count": 2, "max_queue_depth": 32 },
            "sync": { "worker_count": 1 }
        }
    }"#;
    let cfg = OperationsConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.schedulers.len(), 2);
    assert_eq!(cfg.schedulers["coordinators"].max_queue_depth, 32);
}

#[test]
fn test_operations_config_empty_is_invalid() {
    let err = OperationsConfig::from_json_str(r#"{ "schedulers": {} }"#).unwrap_err();
    assert!(err.contains("at least one scheduler"));
}

#[test]
fn test_operations_config_names_invalid_scheduler() {
    let json = r#"{ "schedulers": { "broken": { "worker_count": 0 } } }"#;
    let err = OperationsConfig::from_json_str(json).unwrap_err();
    assert!(err.contains("broken"));
}
