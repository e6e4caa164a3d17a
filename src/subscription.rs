//! Subscription Manager: the aggregate root for the live poll subscription
//! (§3 "Subscription", §4.4). Owns the tag-descriptor map, the per-tag
//! change-detection config map, and the group map; spawns and tears down one
//! [`PollGroupRunner`] task per group.

use crate::change_filter::ChangeConfig;
use crate::config::ArrayMode;
use crate::error::Result;
use crate::poll_group::{DriverFactory, GroupSpec, LastValueCache, PollGroupRunner};
use crate::telemetry::TelemetryEmitter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Tag metadata tracked by the subscription, independent of any one group.
#[derive(Debug, Clone)]
pub struct TagDescriptor {
    pub tag_id: u64,
    pub tag_name: String,
    pub data_type: Option<String>,
    pub poll_group_id: u64,
    pub array_size: Option<u32>,
}

/// One tag as supplied to `install`.
#[derive(Debug, Clone)]
pub struct TagInstall {
    pub tag_id: u64,
    pub tag_name: String,
    pub data_type: Option<String>,
    pub array_size: Option<u32>,
    pub change_config: ChangeConfig,
}

/// One requested group as supplied to `install`, before any splitting.
#[derive(Debug, Clone)]
pub struct GroupRequest {
    pub group_id: u64,
    pub rate_ms: u64,
    pub tag_ids: Vec<u64>,
}

/// Result of a successful `install` call.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub tag_count: usize,
    pub group_count: usize,
    pub warnings: Vec<String>,
}

struct ActiveGroup {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SubscriptionState {
    tags: HashMap<u64, TagDescriptor>,
    configs: HashMap<u64, ChangeConfig>,
    groups: HashMap<u64, ActiveGroup>,
}

/// Owns the live subscription and the Runners it spawns.
pub struct SubscriptionManager {
    state: Mutex<SubscriptionState>,
    last_values: LastValueCache,
    telemetry: TelemetryEmitter,
    driver_factory: DriverFactory,
    max_tags_per_group: usize,
    max_concurrent_connections: usize,
    array_mode: ArrayMode,
}

impl SubscriptionManager {
    pub fn new(
        telemetry: TelemetryEmitter,
        driver_factory: DriverFactory,
        max_tags_per_group: usize,
        max_concurrent_connections: usize,
        array_mode: ArrayMode,
    ) -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
            last_values: Arc::new(Mutex::new(HashMap::new())),
            telemetry,
            driver_factory,
            max_tags_per_group,
            max_concurrent_connections,
            array_mode,
        }
    }

    /// Installs a new subscription, tearing down any previous one first
    /// (§4.4 step 1). Splits oversized groups preserving `rate_ms`, assigning
    /// fresh group ids strictly above every group id named in this request.
    pub async fn install(
        &self,
        host: &str,
        slot: u8,
        tags: Vec<TagInstall>,
        groups: Vec<GroupRequest>,
    ) -> Result<InstallResult> {
        self.teardown().await;

        let mut state = self.state.lock().await;

        let tag_count = tags.len();
        for tag in tags {
            state.configs.insert(tag.tag_id, tag.change_config);
            state.tags.insert(
                tag.tag_id,
                TagDescriptor {
                    tag_id: tag.tag_id,
                    tag_name: tag.tag_name,
                    data_type: tag.data_type,
                    poll_group_id: 0,
                    array_size: tag.array_size,
                },
            );
        }

        let mut next_group_id = groups.iter().map(|g| g.group_id).max().unwrap_or(0) + 1;
        let mut final_groups: Vec<(u64, u64, Vec<u64>)> = Vec::new();

        for group in groups {
            if group.tag_ids.len() <= self.max_tags_per_group {
                final_groups.push((group.group_id, group.rate_ms, group.tag_ids));
            } else {
                let mut chunks = group.tag_ids.chunks(self.max_tags_per_group);
                if let Some(first) = chunks.next() {
                    final_groups.push((group.group_id, group.rate_ms, first.to_vec()));
                }
                for chunk in chunks {
                    let group_id = next_group_id;
                    next_group_id += 1;
                    final_groups.push((group_id, group.rate_ms, chunk.to_vec()));
                }
            }
        }

        let mut warnings = Vec::new();
        if final_groups.len() > self.max_concurrent_connections {
            warnings.push(format!(
                "{} poll groups exceeds max_concurrent_connections ({}); proceeding anyway",
                final_groups.len(),
                self.max_concurrent_connections
            ));
        }

        let group_count = final_groups.len();

        for (group_id, rate_ms, tag_ids) in final_groups {
            let group_tags: Vec<(u64, String)> = tag_ids
                .iter()
                .filter_map(|tag_id| {
                    state
                        .tags
                        .get(tag_id)
                        .map(|descriptor| (*tag_id, descriptor.tag_name.clone()))
                })
                .collect();
            let group_configs: HashMap<u64, ChangeConfig> = tag_ids
                .iter()
                .filter_map(|tag_id| state.configs.get(tag_id).cloned().map(|c| (*tag_id, c)))
                .collect();

            for tag_id in &tag_ids {
                if let Some(descriptor) = state.tags.get_mut(tag_id) {
                    descriptor.poll_group_id = group_id;
                }
            }

            let spec = GroupSpec {
                group_id,
                host: host.to_string(),
                slot,
                rate_ms,
                tags: group_tags,
                configs: group_configs,
                array_mode: self.array_mode,
            };

            let (runner, cancel_tx) = PollGroupRunner::new(
                spec,
                self.telemetry.clone(),
                self.last_values.clone(),
                self.driver_factory.clone(),
            );
            let handle = tokio::spawn(runner.run());
            state.groups.insert(
                group_id,
                ActiveGroup {
                    cancel: cancel_tx,
                    handle,
                },
            );
        }

        Ok(InstallResult {
            tag_count,
            group_count,
            warnings,
        })
    }

    /// Cancels and joins every Runner, then clears all subscription state
    /// and the last-value cache (§4.4 `teardown`, reused as `install` step 1).
    pub async fn teardown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            let groups = std::mem::take(&mut state.groups);
            state.tags.clear();
            state.configs.clear();
            groups
                .into_values()
                .map(|group| {
                    let _ = group.cancel.send(true);
                    group.handle
                })
                .collect()
        };

        for handle in handles {
            let _ = handle.await;
        }

        self.last_values.lock().await.clear();
    }

    pub async fn tag_descriptors(&self) -> Vec<TagDescriptor> {
        self.state.lock().await.tags.values().cloned().collect()
    }

    pub async fn is_active(&self) -> bool {
        !self.state.lock().await.groups.is_empty()
    }
}
