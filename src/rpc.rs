//! RPC Dispatcher (§4.6, §6.1): reads one JSON-RPC request at a time,
//! routes it to a handler, and returns the response envelope to write back.
//!
//! `subscribe_polling` is the one method that reaches into the
//! [`SubscriptionManager`]; every other method opens (or reuses) the
//! worker's synchronous "default" session and never touches poll-group
//! state, matching the ownership split in §9 Design Notes.

use crate::change_filter::{ChangeConfig, DeadbandMode};
use crate::config::WorkerConfig;
use crate::driver::{self, CipDriver, EipDriver};
use crate::error::{WorkerError, RPC_HANDLER_ERROR, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR};
use crate::poll_group::DriverFactory;
use crate::subscription::{GroupRequest, SubscriptionManager, TagInstall};
use crate::telemetry::TelemetryEmitter;
use crate::value::TagValue;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Mutable state a live worker process holds across RPC calls: the
/// synchronous "default" session (read/write/list_tags/…) and the
/// Subscription Manager driving poll groups. Never shared with Runners.
pub struct WorkerState {
    config: WorkerConfig,
    default_driver: Mutex<Option<Box<dyn CipDriver>>>,
    host: Mutex<Option<String>>,
    slot: Mutex<u8>,
    subscription: SubscriptionManager,
    telemetry: TelemetryEmitter,
}

impl WorkerState {
    pub fn new(config: WorkerConfig) -> Self {
        let timeout = Duration::from_millis(config.session_timeout_ms);
        let driver_factory: DriverFactory =
            Arc::new(move || Box::new(EipDriver::new(timeout)) as Box<dyn CipDriver>);
        let telemetry = TelemetryEmitter::new();
        let subscription = SubscriptionManager::new(
            telemetry.clone(),
            driver_factory,
            config.max_tags_per_group,
            config.max_concurrent_connections,
            config.array_mode,
        );
        Self {
            config,
            default_driver: Mutex::new(None),
            host: Mutex::new(None),
            slot: Mutex::new(0),
            subscription,
            telemetry,
        }
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.config.session_timeout_ms)
    }

    /// The same mutex-guarded stdout handle the Poll Group Runners' telemetry
    /// frames write through. RPC responses are written here too (§4.6,
    /// §5 "concurrent writers must serialize whole lines") rather than
    /// through an independent stdout handle, so a response can never
    /// interleave with a telemetry frame mid-line.
    pub fn telemetry(&self) -> &TelemetryEmitter {
        &self.telemetry
    }

    /// Cleanly shuts the worker down: tears down polling, then drops the
    /// default session. Called on stdin EOF / Ctrl-C (§1 EXPANSION).
    pub async fn shutdown(&self) {
        self.subscription.teardown().await;
        if let Some(mut driver) = self.default_driver.lock().await.take() {
            let _ = driver.disconnect().await;
        }
    }
}

/// Parses one line of input into a JSON-RPC request, dispatches it, and
/// returns the serialized response line (always present — parse errors get
/// their own envelope with `id: null`, per §7).
pub async fn handle_line(state: &WorkerState, line: &str) -> String {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            log::error!("invalid JSON-RPC request: {err}");
            return error_response(Value::Null, RPC_PARSE_ERROR, "Parse error: invalid JSON");
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));

    let result = dispatch(state, method, params).await;
    match result {
        Ok(value) => success_response(id, value),
        Err(DispatchError::MethodNotFound) => {
            error_response(id, RPC_METHOD_NOT_FOUND, &format!("Method not found: {method}"))
        }
        Err(DispatchError::Handler(err)) => {
            log::error!("error handling {method}: {err}");
            error_response(id, RPC_HANDLER_ERROR, &err.to_string())
        }
    }
}

enum DispatchError {
    MethodNotFound,
    Handler(WorkerError),
}

impl From<WorkerError> for DispatchError {
    fn from(err: WorkerError) -> Self {
        DispatchError::Handler(err)
    }
}

async fn dispatch(state: &WorkerState, method: &str, params: Value) -> Result<Value, DispatchError> {
    match method {
        "connect" => connect(state, params).await,
        "disconnect" => disconnect(state).await,
        "read_tag" => read_tag(state, params).await,
        "read_tags" => read_tags(state, params).await,
        "write_tag" => write_tag(state, params).await,
        "list_tags" => list_tags(state).await,
        "subscribe_polling" => subscribe_polling(state, params).await,
        "stop_polling" => stop_polling(state).await,
        "discover" => discover(params).await,
        "list_identity" => list_identity(params).await,
        "browse_tags" => browse_tags(state, params).await,
        "resolve_types" => resolve_types(state, params).await,
        "get_connection_status" => get_connection_status(state).await,
        "get_rack_configuration" => get_rack_configuration(state).await,
        _ => Err(DispatchError::MethodNotFound),
    }
}

fn require_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, DispatchError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| WorkerError::InvalidRequest(format!("missing required field: {field}")).into())
}

/// Resolves `connect`'s `host`/`slot` params, falling back to
/// `config.default_host`/`default_slot` when the caller omits them (§6.4
/// EXPANSION) so the worker can be parameterized without requiring every
/// field on every `connect` call.
fn resolve_connect_target(params: &Value, config: &WorkerConfig) -> Result<(String, u8), WorkerError> {
    let host = match params.get("host").and_then(Value::as_str) {
        Some(host) => host.to_string(),
        None => config
            .default_host
            .clone()
            .ok_or_else(|| WorkerError::InvalidRequest("missing required field: host".to_string()))?,
    };
    let slot = params
        .get("slot")
        .and_then(Value::as_u64)
        .map(|s| s as u8)
        .unwrap_or(config.default_slot);
    Ok((host, slot))
}

async fn connect(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    let (host, slot) = resolve_connect_target(&params, &state.config)?;

    let mut driver = Box::new(EipDriver::new(state.session_timeout())) as Box<dyn CipDriver>;
    let info = driver.connect(&host, slot).await?;

    *state.default_driver.lock().await = Some(driver);
    *state.host.lock().await = Some(host);
    *state.slot.lock().await = slot;

    Ok(json!({ "success": true, "plc_info": info.plc_info }))
}

async fn disconnect(state: &WorkerState) -> Result<Value, DispatchError> {
    state.subscription.teardown().await;
    if let Some(mut driver) = state.default_driver.lock().await.take() {
        driver.disconnect().await?;
    }
    *state.host.lock().await = None;
    Ok(json!({ "success": true }))
}

async fn default_driver_guard(
    state: &WorkerState,
) -> Result<tokio::sync::MutexGuard<'_, Option<Box<dyn CipDriver>>>, DispatchError> {
    let guard = state.default_driver.lock().await;
    if guard.is_none() {
        return Err(WorkerError::Connection("not connected".to_string()).into());
    }
    Ok(guard)
}

async fn read_tag(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    let tag_name = require_str(&params, "tag_name")?.to_string();
    let result = async {
        let mut guard = default_driver_guard(state).await?;
        let driver = guard.as_mut().unwrap();
        driver.read(&tag_name).await.map_err(DispatchError::from)
    }
    .await;
    Ok(match result {
        Ok(value) => {
            let type_field = type_name(&value);
            json!({
                "tag_name": tag_name,
                "value": value.sanitize(),
                "type": type_field,
                "error": Value::Null,
            })
        }
        Err(DispatchError::Handler(err)) => json!({
            "tag_name": tag_name,
            "value": Value::Null,
            "type": Value::Null,
            "error": err.to_string(),
        }),
        Err(other) => return Err(other),
    })
}

async fn read_tags(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    let names = params
        .get("tag_names")
        .and_then(Value::as_array)
        .ok_or_else(|| WorkerError::InvalidRequest("missing required field: tag_names".to_string()))?;

    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let tag_name = name
            .as_str()
            .ok_or_else(|| WorkerError::InvalidRequest("tag_names must be strings".to_string()))?
            .to_string();
        let entry = read_tag(state, json!({ "tag_name": tag_name })).await?;
        results.push(entry);
    }
    Ok(json!({ "results": results }))
}

async fn write_tag(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    let tag_name = require_str(&params, "tag_name")?.to_string();
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| WorkerError::InvalidRequest("missing required field: value".to_string()))?;
    let tag_value = json_to_tag_value(&value)?;

    let result = async {
        let mut guard = default_driver_guard(state).await?;
        let driver = guard.as_mut().unwrap();
        driver.write(&tag_name, tag_value).await.map_err(DispatchError::from)
    }
    .await;
    Ok(match result {
        Ok(()) => json!({ "tag_name": tag_name, "success": true, "error": Value::Null }),
        Err(DispatchError::Handler(err)) => {
            json!({ "tag_name": tag_name, "success": false, "error": err.to_string() })
        }
        Err(other) => return Err(other),
    })
}

async fn list_tags(state: &WorkerState) -> Result<Value, DispatchError> {
    let mut guard = default_driver_guard(state).await?;
    let tags = guard.as_mut().unwrap().list_tags().await?;
    let tags: Vec<Value> = tags
        .into_iter()
        .map(|t| {
            json!({
                "tag_name": t.name,
                "data_type": t.data_type,
                "array": t.is_array,
                "dimensions": t.array_length,
            })
        })
        .collect();
    Ok(json!({ "tags": tags }))
}

async fn subscribe_polling(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    let host = state
        .host
        .lock()
        .await
        .clone()
        .ok_or_else(|| WorkerError::Connection("not connected".to_string()))?;
    let slot = *state.slot.lock().await;

    let tags_json = params
        .get("tags")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut tags = Vec::with_capacity(tags_json.len());
    for tag in &tags_json {
        tags.push(parse_tag_install(tag)?);
    }

    let groups_json = params
        .get("poll_groups")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let mut groups = Vec::with_capacity(groups_json.len());
    for (gid, info) in &groups_json {
        let group_id: u64 = gid
            .parse()
            .map_err(|_| WorkerError::InvalidRequest(format!("invalid poll_group id: {gid}")))?;
        let rate_ms = info
            .get("rate_ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| WorkerError::InvalidRequest("poll_groups entry missing rate_ms".to_string()))?;
        let tag_ids = info
            .get("tag_ids")
            .and_then(Value::as_array)
            .ok_or_else(|| WorkerError::InvalidRequest("poll_groups entry missing tag_ids".to_string()))?
            .iter()
            .map(|v| v.as_u64().ok_or_else(|| WorkerError::InvalidRequest("tag_ids must be integers".to_string())))
            .collect::<Result<Vec<u64>, WorkerError>>()?;
        groups.push(GroupRequest { group_id, rate_ms, tag_ids });
    }

    let result = state.subscription.install(&host, slot, tags, groups).await?;
    let mut out = json!({
        "success": true,
        "tag_count": result.tag_count,
        "group_count": result.group_count,
    });
    if !result.warnings.is_empty() {
        out["warnings"] = json!(result.warnings);
    }
    Ok(out)
}

async fn stop_polling(state: &WorkerState) -> Result<Value, DispatchError> {
    state.subscription.teardown().await;
    Ok(json!({ "success": true }))
}

async fn discover(params: Value) -> Result<Value, DispatchError> {
    let _broadcast = params
        .get("broadcast_address")
        .and_then(Value::as_str)
        .unwrap_or("255.255.255.255");
    let devices = driver::discover(Duration::from_secs(3)).await?;
    let devices: Vec<Value> = devices
        .into_iter()
        .map(|d| {
            json!({
                "address": d.address,
                "vendor_id": d.vendor_id,
                "device_type": d.device_type,
                "product_code": d.product_code,
                "revision": d.revision,
                "serial_number": d.serial_number,
                "product_name": d.product_name,
            })
        })
        .collect();
    Ok(json!({ "devices": devices }))
}

async fn list_identity(params: Value) -> Result<Value, DispatchError> {
    let ip = require_str(&params, "ip_address")?;
    let identity = driver::list_identity(ip, Duration::from_secs(3)).await?;
    Ok(json!({
        "address": identity.address,
        "vendor_id": identity.vendor_id,
        "device_type": identity.device_type,
        "product_code": identity.product_code,
        "revision": identity.revision,
        "serial_number": identity.serial_number,
        "product_name": identity.product_name,
    }))
}

async fn browse_tags(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    // `ip_address` is validated but otherwise dropped: browsing always uses the
    // default session from `connect`, per §4.6 EXPANSION's ownership split.
    let _ip = require_str(&params, "ip_address")?;
    let mut guard = default_driver_guard(state).await?;
    let tags = guard.as_mut().unwrap().list_tags().await?;
    let tags: Vec<Value> = tags
        .into_iter()
        .map(|t| {
            json!({
                "tag_name": t.name,
                "data_type": t.data_type,
                "array": t.is_array,
                "dimensions": t.array_length,
            })
        })
        .collect();
    Ok(json!({ "tags": tags, "programs": Value::Array(vec![]), "modules": Value::Array(vec![]) }))
}

async fn resolve_types(state: &WorkerState, params: Value) -> Result<Value, DispatchError> {
    // Same ownership split as `browse_tags`: `ip_address` is validated but
    // otherwise dropped, since type resolution reuses the default session.
    let _ip = require_str(&params, "ip_address")?;
    let names = params
        .get("tag_names")
        .and_then(Value::as_array)
        .ok_or_else(|| WorkerError::InvalidRequest("missing required field: tag_names".to_string()))?;

    let tags = {
        let mut guard = default_driver_guard(state).await?;
        guard.as_mut().unwrap().list_tags().await?
    };
    let by_name: HashMap<String, u16> = tags.into_iter().map(|t| (t.name, t.data_type)).collect();

    let mut types = serde_json::Map::new();
    for name in names {
        let name = name
            .as_str()
            .ok_or_else(|| WorkerError::InvalidRequest("tag_names must be strings".to_string()))?;
        let type_name = by_name
            .get(name)
            .map(|dt| format!("TYPE_0x{dt:04X}"))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        types.insert(name.to_string(), json!(type_name));
    }
    Ok(json!({ "types": Value::Object(types) }))
}

async fn get_connection_status(state: &WorkerState) -> Result<Value, DispatchError> {
    let mut guard = default_driver_guard(state).await?;
    let status = guard.as_mut().unwrap().get_connection_status().await?;
    Ok(json!({
        "query_supported": status.query_supported,
        "used_buffers": status.used_buffers,
        "total_buffers": status.total_buffers,
        "usage_percent": status.usage_percent,
        "status": status.status,
    }))
}

async fn get_rack_configuration(state: &WorkerState) -> Result<Value, DispatchError> {
    let mut guard = default_driver_guard(state).await?;
    let rack = guard.as_mut().unwrap().get_rack_configuration().await?;
    Ok(match rack {
        driver::RackConfiguration::Rack { modules } => {
            let modules: Vec<Value> = modules
                .into_iter()
                .map(|m| json!({ "slot": m.slot, "info": m.info }))
                .collect();
            json!({ "modules": modules })
        }
        driver::RackConfiguration::Single { info } => json!({ "info": info }),
    })
}

fn parse_tag_install(tag: &Value) -> Result<TagInstall, DispatchError> {
    let tag_id = tag
        .get("tag_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| WorkerError::InvalidRequest("tag missing tag_id".to_string()))?;
    let tag_name = tag
        .get("tag_name")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkerError::InvalidRequest("tag missing tag_name".to_string()))?
        .to_string();
    let data_type = tag.get("data_type").and_then(Value::as_str).map(|s| s.to_string());
    let array_size = tag.get("array_size").and_then(Value::as_u64).map(|v| v as u32);

    let deadband_mode = match tag.get("on_change_deadband_type").and_then(Value::as_str) {
        Some("percent") => DeadbandMode::Percent,
        _ => DeadbandMode::Absolute,
    };
    let change_config = ChangeConfig {
        on_change_enabled: tag.get("on_change_enabled").and_then(Value::as_bool).unwrap_or(false),
        deadband: tag.get("on_change_deadband").and_then(Value::as_f64).unwrap_or(0.0),
        deadband_mode,
        heartbeat_ms: tag.get("on_change_heartbeat_ms").and_then(Value::as_u64).unwrap_or(0),
    };

    Ok(TagInstall {
        tag_id,
        tag_name,
        data_type,
        array_size,
        change_config,
    })
}

fn json_to_tag_value(value: &Value) -> Result<TagValue, DispatchError> {
    Ok(match value {
        Value::Null => TagValue::Null,
        Value::Bool(b) => TagValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TagValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                TagValue::Float(f)
            } else {
                return Err(WorkerError::InvalidRequest("unsupported numeric value".to_string()).into());
            }
        }
        Value::String(s) => TagValue::String(s.clone()),
        other => return Err(WorkerError::InvalidRequest(format!("unsupported value shape: {other}")).into()),
    })
}

fn type_name(value: &TagValue) -> Value {
    match value {
        TagValue::Null => Value::Null,
        TagValue::Bool(_) => json!("BOOL"),
        TagValue::Int(_) => json!("DINT"),
        TagValue::Float(_) => json!("REAL"),
        TagValue::String(_) => json!("STRING"),
    }
}

fn success_response(id: Value, result: Value) -> String {
    serde_json::to_string(&json!({ "jsonrpc": "2.0", "result": result, "id": id }))
        .unwrap_or_else(|_| "{}".to_string())
}

fn error_response(id: Value, code: i64, message: &str) -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    }))
    .unwrap_or_else(|_| "{}".to_string())
}
