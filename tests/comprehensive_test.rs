//! End-to-end scenarios and testable properties from the polling engine
//! and change-detection pipeline spec (§8): scalar deadband, heartbeat,
//! array batch/sparse planning, quality transitions, and group splitting.

use cip_poll_worker::batch_planner::{plan_reads, PlanEntry};
use cip_poll_worker::change_filter::{should_publish, ChangeConfig, DeadbandMode, LastValue, Quality};
use cip_poll_worker::config::{ArrayMode, WorkerConfig};
use cip_poll_worker::driver::{
    CipDriver, ConnectInfo, ConnectionStatus, RackConfiguration, TagDescriptor,
};
use cip_poll_worker::error::Result;
use cip_poll_worker::poll_group::DriverFactory;
use cip_poll_worker::subscription::{GroupRequest, SubscriptionManager, TagInstall};
use cip_poll_worker::telemetry::TelemetryEmitter;
use cip_poll_worker::value::TagValue;
use std::sync::Arc;

struct NoopDriver;

#[async_trait::async_trait]
impl CipDriver for NoopDriver {
    async fn connect(&mut self, _host: &str, _slot: u8) -> Result<ConnectInfo> {
        Ok(ConnectInfo {
            plc_info: "noop".to_string(),
        })
    }
    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
    async fn read(&mut self, _tag_expr: &str) -> Result<TagValue> {
        Ok(TagValue::Int(0))
    }
    async fn read_many(&mut self, _tag_expr: &str, count: u32) -> Result<Vec<TagValue>> {
        Ok(vec![TagValue::Int(0); count as usize])
    }
    async fn write(&mut self, _tag_expr: &str, _value: TagValue) -> Result<()> {
        Ok(())
    }
    async fn list_tags(&mut self) -> Result<Vec<TagDescriptor>> {
        Ok(Vec::new())
    }
    async fn get_connection_status(&mut self) -> Result<ConnectionStatus> {
        Ok(ConnectionStatus {
            query_supported: false,
            used_buffers: None,
            total_buffers: None,
            usage_percent: None,
            status: "unknown".to_string(),
        })
    }
    async fn get_rack_configuration(&mut self) -> Result<RackConfiguration> {
        Ok(RackConfiguration::Single {
            info: "noop".to_string(),
        })
    }
}

fn noop_manager(max_tags_per_group: usize, max_concurrent_connections: usize) -> SubscriptionManager {
    let factory: DriverFactory = Arc::new(|| Box::new(NoopDriver));
    SubscriptionManager::new(
        TelemetryEmitter::new(),
        factory,
        max_tags_per_group,
        max_concurrent_connections,
        ArrayMode::Batch,
    )
}

fn tag_install(id: u64, name: &str) -> TagInstall {
    TagInstall {
        tag_id: id,
        tag_name: name.to_string(),
        data_type: None,
        array_size: None,
        change_config: ChangeConfig::default(),
    }
}

/// §8 scenario 1: scalar deadband, values 10.0, 10.2, 10.6, 10.6, 10.6 with
/// absolute deadband 0.5 publish the 1st and 3rd samples only.
#[test]
fn scenario_scalar_deadband() {
    let config = ChangeConfig {
        on_change_enabled: true,
        deadband: 0.5,
        deadband_mode: DeadbandMode::Absolute,
        heartbeat_ms: 0,
    };
    let samples = [10.0, 10.2, 10.6, 10.6, 10.6];
    let mut last: Option<LastValue> = None;
    let mut publish_count = 0;

    for (i, &v) in samples.iter().enumerate() {
        let value = TagValue::Float(v);
        let now = (i as u64) * 100;
        if should_publish(&config, last.as_ref(), &value, Quality::Good, now) {
            publish_count += 1;
            last = Some(LastValue {
                value,
                quality: Quality::Good,
                timestamp_ms: now,
            });
        }
    }

    assert_eq!(publish_count, 2);
}

/// §8 scenario 2: heartbeat forces re-publish of an unchanging value every
/// 500ms even with deadband disabled, polled at 100ms.
#[test]
fn scenario_heartbeat_forces_republish() {
    let config = ChangeConfig {
        on_change_enabled: true,
        deadband: 0.0,
        deadband_mode: DeadbandMode::Absolute,
        heartbeat_ms: 500,
    };

    let mut last: Option<LastValue> = None;
    let mut publish_count = 0;
    let value = TagValue::Float(10.0);

    for poll in 0..=12 {
        let now = poll * 100;
        if should_publish(&config, last.as_ref(), &value, Quality::Good, now) {
            publish_count += 1;
            last = Some(LastValue {
                value: value.clone(),
                quality: Quality::Good,
                timestamp_ms: now,
            });
        }
    }

    // Publishes at t=0, t=500, t=1000 -> 3 total over 1.2s.
    assert_eq!(publish_count, 3);
}

/// §8 scenario 3: 15 subscribed elements of a 1000-length array trigger a
/// single full-array read.
#[test]
fn scenario_array_batch_threshold() {
    let tags: Vec<(u64, String)> = (0..15).map(|i| (i as u64, format!("A[{i}]"))).collect();
    let plan = plan_reads(&tags, ArrayMode::Batch);
    assert_eq!(plan.entries.len(), 1);
    match &plan.entries[0] {
        PlanEntry::FullArray { extent, members, .. } => {
            assert_eq!(*extent, 15);
            assert_eq!(members.len(), 15);
        }
        other => panic!("expected a single FullArray entry, got {other:?}"),
    }
}

/// §8 scenario 4: 3 subscribed elements out of a 1000-length array stay
/// sparse rather than pulling the whole array.
#[test]
fn scenario_sparse_array_fallback() {
    let tags = vec![
        (1, "A[3]".to_string()),
        (2, "A[501]".to_string()),
        (3, "A[999]".to_string()),
    ];
    let plan = plan_reads(&tags, ArrayMode::Batch);
    assert_eq!(plan.entries.len(), 1);
    match &plan.entries[0] {
        PlanEntry::SparseElements { members } => assert_eq!(members.len(), 3),
        other => panic!("expected SparseElements, got {other:?}"),
    }
}

/// §8 scenario 5: OK, OK, ERROR, OK with deadband 0 produces three frames —
/// the quality transitions (good->bad, bad->good) force publication even
/// though surrounding values repeat.
#[test]
fn scenario_quality_transition_forces_publish() {
    let config = ChangeConfig {
        on_change_enabled: true,
        deadband: 0.0,
        deadband_mode: DeadbandMode::Absolute,
        heartbeat_ms: 0,
    };
    let samples = [
        (TagValue::Float(5.0), Quality::Good),
        (TagValue::Float(5.0), Quality::Good),
        (TagValue::Null, Quality::Bad),
        (TagValue::Float(5.0), Quality::Good),
    ];

    let mut last: Option<LastValue> = None;
    let mut publish_count = 0;
    for (i, (value, quality)) in samples.into_iter().enumerate() {
        let now = i as u64 * 100;
        if should_publish(&config, last.as_ref(), &value, quality, now) {
            publish_count += 1;
            last = Some(LastValue {
                value,
                quality,
                timestamp_ms: now,
            });
        }
    }

    assert_eq!(publish_count, 3);
}

/// §8 scenario 6 / boundary test: a 750-tag group with max_tags_per_group
/// 500 splits into groups of 500 and 250 sharing the same rate_ms, and the
/// install response reports group_count=2.
#[tokio::test]
async fn scenario_group_split_preserves_rate() {
    let manager = noop_manager(500, 8);
    let tags: Vec<TagInstall> = (0..750u64).map(|i| tag_install(i, &format!("T{i}"))).collect();
    let group = GroupRequest {
        group_id: 1,
        rate_ms: 250,
        tag_ids: (0..750u64).collect(),
    };

    let result = manager.install("10.0.0.1", 0, tags, vec![group]).await.unwrap();

    assert_eq!(result.tag_count, 750);
    assert_eq!(result.group_count, 2);
    assert!(result.warnings.is_empty());

    manager.teardown().await;
}

/// §8 boundary test: exceeding max_concurrent_connections is a warning, not
/// an error — install still succeeds.
#[tokio::test]
async fn exceeding_max_concurrent_connections_is_a_soft_warning() {
    let manager = noop_manager(10, 2);
    let tags: Vec<TagInstall> = (0..30u64).map(|i| tag_install(i, &format!("T{i}"))).collect();
    let groups: Vec<GroupRequest> = (1..=3u64)
        .map(|gid| GroupRequest {
            group_id: gid,
            rate_ms: 100,
            tag_ids: ((gid - 1) * 10..gid * 10).collect(),
        })
        .collect();

    let result = manager.install("10.0.0.1", 0, tags, groups).await.unwrap();

    assert_eq!(result.group_count, 3);
    assert!(!result.warnings.is_empty());

    manager.teardown().await;
}

/// NaN/Infinite sanitizer law: a non-finite numeric reading always emits
/// (null, good) — sanitization is independent of change-detection config.
#[test]
fn law_sanitizer_nulls_non_finite_floats() {
    assert_eq!(TagValue::Float(f64::NAN).sanitize(), TagValue::Null);
    assert_eq!(TagValue::Float(f64::INFINITY).sanitize(), TagValue::Null);
    assert_eq!(TagValue::Float(f64::NEG_INFINITY).sanitize(), TagValue::Null);
    assert_eq!(TagValue::Float(1.0).sanitize(), TagValue::Float(1.0));
}

/// Config-layer law: PYCOMM3_ARRAY_MODE is consumed by the worker config,
/// overriding the batch default, but only for recognized values.
#[test]
fn array_mode_config_defaults_to_batch() {
    let config = WorkerConfig::default();
    assert_eq!(config.array_mode, ArrayMode::Batch);
    assert_eq!(config.max_tags_per_group, 500);
    assert_eq!(config.max_concurrent_connections, 8);
}
