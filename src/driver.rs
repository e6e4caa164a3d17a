//! CIP Driver Facade (§2 component 1): the async-trait boundary the rest of
//! the worker programs against, and `EipDriver`, its concrete
//! EtherNet/IP-backed implementation built on `protocol`.
//!
//! Keeping this behind a trait lets the Poll Group Runner, Batch Planner,
//! and RPC Dispatcher tests run against a fake driver instead of real PLC
//! hardware (§8).

use crate::error::{Result, WorkerError};
use crate::protocol::{self, CipSession, CipValue};
use crate::tag_manager::TagManager;
use crate::tag_path::TagPath;
use crate::value::TagValue;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Result of a successful `connect` call.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub plc_info: String,
}

/// One entry from a tag catalog listing.
#[derive(Debug, Clone)]
pub struct TagDescriptor {
    pub name: String,
    pub data_type: u16,
    pub is_array: bool,
    pub array_length: Option<u32>,
}

/// Result of `get_connection_status` (§6.3).
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub query_supported: bool,
    pub used_buffers: Option<u32>,
    pub total_buffers: Option<u32>,
    pub usage_percent: Option<f64>,
    pub status: String,
}

/// One module slot in a rack-style configuration.
#[derive(Debug, Clone)]
pub struct RackModule {
    pub slot: u8,
    pub info: String,
}

/// Result of `get_rack_configuration` (§6.1, §9 Open Question resolution).
#[derive(Debug, Clone)]
pub enum RackConfiguration {
    Rack { modules: Vec<RackModule> },
    Single { info: String },
}

/// A device identity as returned by a broadcast or unicast List Identity
/// query (§6.1 `discover` / `list_identity`).
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub address: String,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: String,
    pub serial_number: u32,
    pub product_name: String,
}

/// The CIP Driver Facade: every operation the rest of the worker needs
/// against a single open PLC session.
#[async_trait]
pub trait CipDriver: Send {
    async fn connect(&mut self, host: &str, slot: u8) -> Result<ConnectInfo>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn read(&mut self, tag_expr: &str) -> Result<TagValue>;
    /// Reads `count` contiguous elements starting at `tag_expr`'s base
    /// (the Batch Planner's full-array `BASE{N}` read, §4.2).
    async fn read_many(&mut self, tag_expr: &str, count: u32) -> Result<Vec<TagValue>>;
    async fn write(&mut self, tag_expr: &str, value: TagValue) -> Result<()>;
    async fn list_tags(&mut self) -> Result<Vec<TagDescriptor>>;
    async fn get_connection_status(&mut self) -> Result<ConnectionStatus>;
    async fn get_rack_configuration(&mut self) -> Result<RackConfiguration>;
}

/// Concrete `CipDriver` talking real EtherNet/IP over TCP.
pub struct EipDriver {
    session: Option<CipSession>,
    tag_manager: TagManager,
    host: Option<String>,
    request_timeout: Duration,
}

impl EipDriver {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            session: None,
            tag_manager: TagManager::new(),
            host: None,
            request_timeout,
        }
    }

    fn session_mut(&mut self) -> Result<&mut CipSession> {
        self.session
            .as_mut()
            .ok_or_else(|| WorkerError::Connection("not connected".to_string()))
    }

    fn tag_cip_path(tag_expr: &str) -> Result<Vec<u8>> {
        TagPath::parse(tag_expr)?.to_cip_path()
    }
}

#[async_trait]
impl CipDriver for EipDriver {
    async fn connect(&mut self, host: &str, slot: u8) -> Result<ConnectInfo> {
        let addr = format!("{host}:44818");
        let session = CipSession::open(&addr, self.request_timeout).await?;
        self.session = Some(session);
        self.host = Some(host.to_string());

        Ok(ConnectInfo {
            plc_info: format!("connected to {host} (backplane slot {slot})"),
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.close().await?;
        }
        self.tag_manager.clear_cache().await;
        self.host = None;
        Ok(())
    }

    async fn read(&mut self, tag_expr: &str) -> Result<TagValue> {
        let path = Self::tag_cip_path(tag_expr)?;
        let session = self.session_mut()?;
        let request = protocol::build_read_request(&path, 1);
        let response = session.send_cip_request(&request).await?;
        let value = protocol::parse_read_response(&response)?;
        Ok(value.into_tag_value())
    }

    async fn read_many(&mut self, tag_expr: &str, count: u32) -> Result<Vec<TagValue>> {
        let path = Self::tag_cip_path(tag_expr)?;
        let session = self.session_mut()?;
        let request = protocol::build_read_request(&path, count as u16);
        let response = session.send_cip_request(&request).await?;
        let values = protocol::parse_read_response_many(&response, count as u16)?;
        Ok(values.into_iter().map(CipValue::into_tag_value).collect())
    }

    async fn write(&mut self, tag_expr: &str, value: TagValue) -> Result<()> {
        let cip_value = CipValue::from_tag_value(&value)?;
        let path = Self::tag_cip_path(tag_expr)?;
        let session = self.session_mut()?;
        let request = protocol::build_write_request(&path, &cip_value);
        let response = session.send_cip_request(&request).await?;
        protocol::parse_write_response(&response)
    }

    async fn list_tags(&mut self) -> Result<Vec<TagDescriptor>> {
        let request = protocol::build_list_tags_request(1);
        let response = self.session_mut()?.send_cip_request(&request).await?;
        let payload = protocol::parse_cip_status(&response)?;
        let count = self.tag_manager.ingest_tag_list(payload)?;
        log::debug!("discovered {count} tags");

        let cache = self.tag_manager.cache.read().unwrap();
        Ok(cache
            .iter()
            .map(|(name, metadata)| TagDescriptor {
                name: name.clone(),
                data_type: metadata.data_type,
                is_array: metadata.is_array,
                array_length: metadata.array_info.as_ref().map(|a| a.element_count),
            })
            .collect())
    }

    async fn get_connection_status(&mut self) -> Result<ConnectionStatus> {
        // Unconnected Message Manager: class 0x02B, instance 1, attribute 0.
        let umm_request = protocol::build_get_attribute_single_request(0x02B, 1, 0);
        if let Ok(response) = self.session_mut()?.send_cip_request(&umm_request).await {
            if let Ok(payload) = protocol::parse_cip_status(&response) {
                if payload.len() >= 2 {
                    let free_buffers = u16::from_le_bytes([payload[0], payload[1]]) as u32;
                    let total_buffers = 40u32;
                    let used = total_buffers.saturating_sub(free_buffers);
                    return Ok(connection_status_from_usage(used, total_buffers));
                }
            }
        }

        // Fall back to the Connection Manager (class 0x06, instance 1):
        // attribute 5 (max connections), attribute 6 (current connections).
        let max_request = protocol::build_get_attribute_single_request(0x06, 1, 5);
        let current_request = protocol::build_get_attribute_single_request(0x06, 1, 6);

        let max_response = self.session_mut()?.send_cip_request(&max_request).await;
        let current_response = self.session_mut()?.send_cip_request(&current_request).await;

        if let (Ok(max_resp), Ok(cur_resp)) = (max_response, current_response) {
            if let (Ok(max_payload), Ok(cur_payload)) = (
                protocol::parse_cip_status(&max_resp),
                protocol::parse_cip_status(&cur_resp),
            ) {
                if max_payload.len() >= 2 && cur_payload.len() >= 2 {
                    let total = u16::from_le_bytes([max_payload[0], max_payload[1]]) as u32;
                    let used = u16::from_le_bytes([cur_payload[0], cur_payload[1]]) as u32;
                    return Ok(connection_status_from_usage(used, total));
                }
            }
        }

        Ok(ConnectionStatus {
            query_supported: false,
            used_buffers: None,
            total_buffers: None,
            usage_percent: None,
            status: "unknown".to_string(),
        })
    }

    async fn get_rack_configuration(&mut self) -> Result<RackConfiguration> {
        // ControlLogix-style racks expose per-slot module info; everything
        // else (CompactLogix etc.) reports a single processor entry.
        // Slots 0..=16, any per-slot query failure means "slot empty"
        // (§9 Open Question resolution).
        let mut modules = Vec::new();
        for slot in 0u8..=16 {
            let request = protocol::build_get_attribute_single_request(0x01, (slot + 1) as u16, 1);
            match self.session_mut()?.send_cip_request(&request).await {
                Ok(response) => {
                    if let Ok(payload) = protocol::parse_cip_status(&response) {
                        modules.push(RackModule {
                            slot,
                            info: format!("{} bytes", payload.len()),
                        });
                    }
                }
                Err(_) => continue,
            }
        }

        if modules.is_empty() {
            let host = self.host.clone().unwrap_or_default();
            Ok(RackConfiguration::Single {
                info: format!("processor at {host}"),
            })
        } else {
            Ok(RackConfiguration::Rack { modules })
        }
    }
}

fn connection_status_from_usage(used: u32, total: u32) -> ConnectionStatus {
    let usage_percent = if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    let status = if usage_percent >= 90.0 {
        "critical"
    } else if usage_percent >= 80.0 {
        "warning"
    } else {
        "healthy"
    };
    ConnectionStatus {
        query_supported: true,
        used_buffers: Some(used),
        total_buffers: Some(total),
        usage_percent: Some(usage_percent),
        status: status.to_string(),
    }
}

/// Sends a broadcast List Identity request and collects every reply that
/// arrives within `wait`. This is stateless — it never touches a
/// `CipDriver` session (§4.6 EXPANSION).
pub async fn discover(wait: Duration) -> Result<Vec<DeviceIdentity>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let request = protocol::build_list_identity_request();
    socket.send_to(&request, "255.255.255.255:44818").await?;

    let mut devices = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                if let Ok(identities) = protocol::parse_list_identity_response(&buf[..n]) {
                    for id in identities {
                        devices.push(to_device_identity(from.to_string(), id));
                    }
                }
            }
            _ => break,
        }
    }

    Ok(devices)
}

/// Sends a unicast List Identity request to one host (§6.1 `list_identity`).
pub async fn list_identity(host: &str, request_timeout: Duration) -> Result<DeviceIdentity> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let addr = format!("{host}:44818");
    let request = protocol::build_list_identity_request();
    socket.send_to(&request, &addr).await?;

    let mut buf = [0u8; 1024];
    let (n, from) = timeout(request_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| WorkerError::Timeout(request_timeout))??;

    let identities = protocol::parse_list_identity_response(&buf[..n])?;
    identities
        .into_iter()
        .next()
        .map(|id| to_device_identity(from.to_string(), id))
        .ok_or_else(|| WorkerError::InvalidResponse("no identity in response".to_string()))
}

fn to_device_identity(address: String, id: protocol::Identity) -> DeviceIdentity {
    DeviceIdentity {
        address,
        vendor_id: id.vendor_id,
        device_type: id.device_type,
        product_code: id.product_code,
        revision: format!("{}.{}", id.revision_major, id.revision_minor),
        serial_number: id.serial_number,
        product_name: id.product_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_status_thresholds_match_original_worker() {
        let healthy = connection_status_from_usage(10, 40);
        assert_eq!(healthy.status, "healthy");

        let warning = connection_status_from_usage(33, 40); // 82.5%
        assert_eq!(warning.status, "warning");

        let critical = connection_status_from_usage(37, 40); // 92.5%
        assert_eq!(critical.status, "critical");
    }

    #[tokio::test]
    async fn operations_fail_cleanly_before_connect() {
        let mut driver = EipDriver::new(Duration::from_secs(1));
        let err = driver.read("Tag1").await.unwrap_err();
        assert!(matches!(err, WorkerError::Connection(_)));
    }
}
