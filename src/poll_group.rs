//! One Runner per poll group: owns a dedicated CIP session, drives the
//! rate-stabilized poll loop, and feeds sampled values through the Change
//! Filter onto the Telemetry Emitter (§4.3).

use crate::batch_planner::{plan_reads, PlanEntry, ReadPlan};
use crate::change_filter::{should_publish, ChangeConfig, LastValue, Quality};
use crate::config::ArrayMode;
use crate::driver::CipDriver;
use crate::error::{Result, WorkerError};
use crate::telemetry::{now_iso8601, TelemetryEmitter};
use crate::value::TagValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Shared last-value cache, partitioned by `tag_id` so groups never contend
/// on each other's entries (§5 "guarded by a lock keyed on tag_id").
pub type LastValueCache = Arc<Mutex<HashMap<u64, LastValue>>>;

/// Builds a fresh, unconnected driver instance for a group (re)connect.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn CipDriver> + Send + Sync>;

/// Static configuration for one poll group, set at `install` time.
pub struct GroupSpec {
    pub group_id: u64,
    pub host: String,
    pub slot: u8,
    pub rate_ms: u64,
    pub tags: Vec<(u64, String)>,
    pub configs: HashMap<u64, ChangeConfig>,
    pub array_mode: ArrayMode,
}

/// Owns the poll loop for one group. Consumed by [`PollGroupRunner::run`].
pub struct PollGroupRunner {
    spec: GroupSpec,
    telemetry: TelemetryEmitter,
    last_values: LastValueCache,
    driver_factory: DriverFactory,
    cancel: watch::Receiver<bool>,
}

impl PollGroupRunner {
    pub fn new(
        spec: GroupSpec,
        telemetry: TelemetryEmitter,
        last_values: LastValueCache,
        driver_factory: DriverFactory,
    ) -> (Self, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            Self {
                spec,
                telemetry,
                last_values,
                driver_factory,
                cancel: cancel_rx,
            },
            cancel_tx,
        )
    }

    pub fn group_id(&self) -> u64 {
        self.spec.group_id
    }

    /// Runs the group's poll loop until cancelled or a fatal connect/session
    /// failure. Never panics the caller's task on a driver error.
    pub async fn run(mut self) {
        let mut driver = match self.connect_with_retry().await {
            Some(driver) => driver,
            None => return,
        };

        let period = Duration::from_millis(self.spec.rate_ms.max(1));
        let mut next_deadline = Instant::now() + period;

        loop {
            if *self.cancel.borrow() {
                break;
            }

            let plan = plan_reads(&self.spec.tags, self.spec.array_mode);
            if plan.entries.is_empty() {
                if self.sleep_or_cancel(period).await {
                    break;
                }
                continue;
            }

            let ts = now_iso8601();
            match execute_plan(driver.as_mut(), &plan).await {
                Ok(results) => {
                    self.publish(results, &ts).await;
                }
                Err(err) if err.is_recoverable_session_error() => {
                    log::warn!(
                        "poll group {}: recoverable session error, reopening: {err}",
                        self.spec.group_id
                    );
                    let _ = driver.disconnect().await;
                    if self.sleep_or_cancel(Duration::from_secs(2)).await {
                        break;
                    }
                    match self.reconnect_once().await {
                        Ok(fresh) => driver = fresh,
                        Err(err) => {
                            log::error!(
                                "poll group {}: failed to reopen session: {err}",
                                self.spec.group_id
                            );
                            return;
                        }
                    }
                    continue;
                }
                Err(err) => {
                    log::error!("poll group {}: poll failed: {err}", self.spec.group_id);
                    if self.sleep_or_cancel(period).await {
                        break;
                    }
                    continue;
                }
            }

            next_deadline += period;
            let now = Instant::now();
            if next_deadline < now {
                next_deadline = now + period;
            }
            let sleep_for = next_deadline.saturating_duration_since(Instant::now());
            if self.sleep_or_cancel(sleep_for).await {
                break;
            }
        }

        if let Err(err) = driver.disconnect().await {
            if err.is_recoverable_session_error() {
                log::debug!(
                    "poll group {}: recoverable error closing session on stop: {err}",
                    self.spec.group_id
                );
            } else {
                log::warn!(
                    "poll group {}: error closing session on stop: {err}",
                    self.spec.group_id
                );
            }
        }
    }

    async fn connect_with_retry(&self) -> Option<Box<dyn CipDriver>> {
        for attempt in 1u32..=3 {
            let mut driver = (self.driver_factory)();
            match driver.connect(&self.spec.host, self.spec.slot).await {
                Ok(_) => return Some(driver),
                Err(err) => {
                    log::warn!(
                        "poll group {}: connect attempt {attempt}/3 failed: {err}",
                        self.spec.group_id
                    );
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs_f64(attempt as f64)).await;
                    }
                }
            }
        }
        log::error!(
            "poll group {}: giving up after 3 connect attempts",
            self.spec.group_id
        );
        None
    }

    async fn reconnect_once(&self) -> Result<Box<dyn CipDriver>> {
        let mut driver = (self.driver_factory)();
        driver.connect(&self.spec.host, self.spec.slot).await?;
        Ok(driver)
    }

    async fn sleep_or_cancel(&mut self, duration: Duration) -> bool {
        if *self.cancel.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.cancel.changed() => changed.is_err() || *self.cancel.borrow(),
        }
    }

    async fn publish(&self, results: Vec<(u64, TagValue, Quality)>, ts: &str) {
        let now_ms = current_millis();
        let mut last_values = self.last_values.lock().await;
        for (tag_id, value, quality) in results {
            let config = self
                .spec
                .configs
                .get(&tag_id)
                .cloned()
                .unwrap_or_default();
            let last = last_values.get(&tag_id);
            if should_publish(&config, last, &value, quality, now_ms) {
                self.telemetry.emit(tag_id, &value, quality, ts).await;
                last_values.insert(
                    tag_id,
                    LastValue {
                        value,
                        quality,
                        timestamp_ms: now_ms,
                    },
                );
            }
        }
    }
}

async fn execute_plan(
    driver: &mut dyn CipDriver,
    plan: &ReadPlan,
) -> Result<Vec<(u64, TagValue, Quality)>> {
    let mut out = Vec::new();

    for entry in &plan.entries {
        match entry {
            PlanEntry::Scalar { tag_id, tag_name } => {
                match driver.read(tag_name).await {
                    Ok(value) => out.push((*tag_id, value.sanitize(), Quality::Good)),
                    Err(err) if err.is_recoverable_session_error() => return Err(err),
                    Err(err) => {
                        log::debug!("tag {tag_name} read failed: {err}");
                        out.push((*tag_id, TagValue::Null, Quality::Bad));
                    }
                }
            }
            PlanEntry::FullArray {
                base,
                extent,
                members,
            } => match driver.read_many(base, *extent).await {
                Ok(values) => {
                    for (tag_id, index) in members {
                        let value = values
                            .get(*index as usize)
                            .cloned()
                            .map(TagValue::sanitize)
                            .unwrap_or(TagValue::Null);
                        out.push((*tag_id, value, Quality::Good));
                    }
                }
                Err(err) if err.is_recoverable_session_error() => return Err(err),
                Err(err) => {
                    log::debug!("array base {base} read failed: {err}");
                    for (tag_id, _) in members {
                        out.push((*tag_id, TagValue::Null, Quality::Bad));
                    }
                }
            },
            PlanEntry::SparseElements { members } => {
                for (tag_id, tag_name, _index) in members {
                    match driver.read(tag_name).await {
                        Ok(value) => out.push((*tag_id, value.sanitize(), Quality::Good)),
                        Err(err) if err.is_recoverable_session_error() => return Err(err),
                        Err(err) => {
                            log::debug!("tag {tag_name} read failed: {err}");
                            out.push((*tag_id, TagValue::Null, Quality::Bad));
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

fn current_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
