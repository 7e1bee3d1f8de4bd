//! Tests for builder modules

use std::sync::Arc;

use prometheus_operations::builders::{SchedulerBuilder, build_schedulers};
use prometheus_operations::config::OperationsConfig;
use prometheus_operations::core::{IdentityRegistry, SchedulerError};

#[test]
fn test_scheduler_builder_defaults() {
    let builder = SchedulerBuilder::new("coordinators")
        .worker_count(2)
        .max_queue_depth(8);
    assert_eq!(builder.name(), "coordinators");
    assert_eq!(builder.config().worker_count, 2);
    assert_eq!(builder.config().max_queue_depth, 8);
}

#[test]
fn test_scheduler_builder_shares_registry() {
    let registry = Arc::new(IdentityRegistry::new());
    let scheduler = SchedulerBuilder::new("shared")
        .worker_count(1)
        .with_registry(Arc::clone(&registry))
        .build()
        .unwrap();
    assert!(Arc::ptr_eq(scheduler.registry(), &registry));
    scheduler.shutdown();
}

#[test]
fn test_scheduler_builder_rejects_invalid_config() {
    let result = SchedulerBuilder::new("broken").worker_count(0).build();
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
}

#[test]
fn test_build_schedulers_share_one_registry() {
    let json = r#"{
        "schedulers": {
            "coordinators": { "worker_count": 1 },
            "sync": { "worker_count": 1 }
        }
    }"#;
    let cfg = OperationsConfig::from_json_str(json).unwrap();
    let schedulers = build_schedulers(&cfg).unwrap();

    let coordinators = &schedulers["coordinators"];
    let sync = &schedulers["sync"];
    assert_eq!(coordinators.name(), "coordinators");
    assert!(Arc::ptr_eq(coordinators.registry(), sync.registry()));

    for scheduler in schedulers.values() {
        scheduler.shutdown();
    }
}
