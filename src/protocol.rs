//! EtherNet/IP encapsulation and CIP wire encode/decode.
//!
//! This is the low-level half of the CIP Driver Facade (§2): session
//! registration, SendRRData framing, CPF parsing, and the handful of CIP
//! services this worker needs (Read Tag, Write Tag, Get_Attribute_Single,
//! Get_Attribute_List). `driver.rs` builds the public-facing `CipDriver`
//! trait on top of the primitives here; nothing in this module knows about
//! tag subscriptions, polling, or the RPC surface.

use crate::error::{Result, WorkerError};
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// CIP scalar data types this worker round-trips. `TagValue` (the wire
/// union exposed to RPC callers) carries no CIP type tag, so the driver
/// needs this richer representation to know how to serialize a write and
/// how to interpret a raw read.
#[derive(Debug, Clone, PartialEq)]
pub enum CipValue {
    Bool(bool),
    Dint(i32),
    Real(f32),
    String(String),
}

impl CipValue {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            CipValue::Bool(v) => vec![if *v { 0xFF } else { 0x00 }],
            CipValue::Dint(v) => v.to_le_bytes().to_vec(),
            CipValue::Real(v) => v.to_le_bytes().to_vec(),
            CipValue::String(v) => {
                let mut bytes = vec![v.len() as u8];
                bytes.extend_from_slice(v.as_bytes());
                bytes
            }
        }
    }

    pub fn data_type(&self) -> u16 {
        match self {
            CipValue::Bool(_) => 0x00C1,
            CipValue::Dint(_) => 0x00C4,
            CipValue::Real(_) => 0x00CA,
            CipValue::String(_) => 0x00D0,
        }
    }

    /// Converts into the wire-level scalar union the rest of the worker
    /// deals in (§3 EXPANSION).
    pub fn into_tag_value(self) -> crate::value::TagValue {
        use crate::value::TagValue;
        match self {
            CipValue::Bool(v) => TagValue::Bool(v),
            CipValue::Dint(v) => TagValue::Int(v as i64),
            CipValue::Real(v) => TagValue::Float(v as f64),
            CipValue::String(v) => TagValue::String(v),
        }
    }

    /// Converts a wire-level value into the CIP type to send for a write.
    /// There is no tag metadata lookup here (matching §1's "out of scope"
    /// carve-out for a full UDT-aware type model) — floats become REAL,
    /// integers become DINT, booleans BOOL, strings STRING.
    pub fn from_tag_value(value: &crate::value::TagValue) -> Result<CipValue> {
        use crate::value::TagValue;
        match value {
            TagValue::Bool(v) => Ok(CipValue::Bool(*v)),
            TagValue::Int(v) => Ok(CipValue::Dint(*v as i32)),
            TagValue::Float(v) => Ok(CipValue::Real(*v as f32)),
            TagValue::String(v) => Ok(CipValue::String(v.clone())),
            TagValue::Null => Err(WorkerError::InvalidRequest(
                "cannot write a null tag value".to_string(),
            )),
        }
    }
}

const REGISTER_SESSION: u16 = 0x0065;
const UNREGISTER_SESSION: u16 = 0x0066;
const SEND_RR_DATA: u16 = 0x006F;
const LIST_IDENTITY: u16 = 0x0063;

/// Device identity as returned by a List Identity reply, used by `discover`
/// and `list_identity` (§6.1).
#[derive(Debug, Clone)]
pub struct Identity {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision_major: u8,
    pub revision_minor: u8,
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
}

/// Builds a bare List Identity encapsulation request (no CIP payload).
pub fn build_list_identity_request() -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(24);
    packet.put_u16_le(LIST_IDENTITY);
    packet.put_u16_le(0); // length
    packet.put_u32_le(0); // session handle
    packet.put_u32_le(0); // status
    packet.put_u64(0); // sender context
    packet.put_u32_le(0); // options
    packet.to_vec()
}

/// Parses one or more List Identity CPF items out of a response datagram.
pub fn parse_list_identity_response(response: &[u8]) -> Result<Vec<Identity>> {
    if response.len() < 26 {
        return Err(WorkerError::Protocol(
            "list identity response too short".to_string(),
        ));
    }

    let item_count = u16::from_le_bytes([response[24], response[25]]);
    let mut pos = 26;
    let mut identities = Vec::new();

    for _ in 0..item_count {
        if pos + 4 > response.len() {
            break;
        }
        let item_type = u16::from_le_bytes([response[pos], response[pos + 1]]);
        let item_length = u16::from_le_bytes([response[pos + 2], response[pos + 3]]) as usize;
        pos += 4;

        if pos + item_length > response.len() {
            break;
        }

        if item_type == 0x000C {
            if let Some(identity) = parse_identity_item(&response[pos..pos + item_length]) {
                identities.push(identity);
            }
        }

        pos += item_length;
    }

    Ok(identities)
}

/// Identity item layout: protocol version(2) + 16-byte sockaddr + vendor(2)
/// + device type(2) + product code(2) + revision(2) + status(2) +
/// serial(4) + name length(1) + name + state(1).
fn parse_identity_item(item: &[u8]) -> Option<Identity> {
    let mut pos = 2 + 16; // skip protocol version + sockaddr
    if item.len() < pos + 14 {
        return None;
    }

    let vendor_id = u16::from_le_bytes([item[pos], item[pos + 1]]);
    pos += 2;
    let device_type = u16::from_le_bytes([item[pos], item[pos + 1]]);
    pos += 2;
    let product_code = u16::from_le_bytes([item[pos], item[pos + 1]]);
    pos += 2;
    let revision_major = item[pos];
    let revision_minor = item[pos + 1];
    pos += 2;
    let status = u16::from_le_bytes([item[pos], item[pos + 1]]);
    pos += 2;
    let serial_number = u32::from_le_bytes([item[pos], item[pos + 1], item[pos + 2], item[pos + 3]]);
    pos += 4;

    if pos >= item.len() {
        return None;
    }
    let name_len = item[pos] as usize;
    pos += 1;

    let product_name = item
        .get(pos..pos + name_len)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();

    Some(Identity {
        vendor_id,
        device_type,
        product_code,
        revision_major,
        revision_minor,
        status,
        serial_number,
        product_name,
    })
}

/// An open EtherNet/IP session over one TCP connection. Every Poll Group
/// Runner and every one-shot RPC handler that needs a session owns its own
/// `CipSession` (§5, §9 Design Notes — no pooling across groups).
#[derive(Debug)]
pub struct CipSession {
    stream: TcpStream,
    session_handle: u32,
    request_timeout: Duration,
}

impl CipSession {
    /// Opens a TCP connection and registers an EtherNet/IP session.
    pub async fn open(addr: &str, request_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut session = Self {
            stream,
            session_handle: 0,
            request_timeout,
        };
        session.register_session().await?;
        Ok(session)
    }

    async fn register_session(&mut self) -> Result<()> {
        let mut packet = BytesMut::with_capacity(28);
        packet.put_u16_le(REGISTER_SESSION);
        packet.put_u16_le(4); // length of registration data
        packet.put_u32_le(0); // session handle (unset)
        packet.put_u32_le(0); // status
        packet.put_u64(0); // sender context
        packet.put_u32_le(0); // options
        packet.put_u16_le(1); // protocol version
        packet.put_u16_le(0); // option flags

        self.stream.write_all(&packet).await?;

        let mut buf = [0u8; 1024];
        let n = read_with_timeout(&mut self.stream, &mut buf, self.request_timeout).await?;

        if n < 12 {
            return Err(WorkerError::Protocol(
                "invalid registration response length".to_string(),
            ));
        }

        self.session_handle = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let status = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if status != 0 || self.session_handle == 0 {
            return Err(WorkerError::Protocol(format!(
                "PLC rejected registration (status: 0x{status:08X})"
            )));
        }

        Ok(())
    }

    /// Wraps a raw CIP request in a SendRRData packet, sends it, and
    /// returns the raw CIP response bytes extracted from the CPF reply.
    pub async fn send_cip_request(&mut self, cip_request: &[u8]) -> Result<Vec<u8>> {
        let cip_len = cip_request.len();
        let total_data_len = 4 + 2 + 2 + 8 + cip_len;

        let mut packet = BytesMut::with_capacity(24 + total_data_len);
        packet.put_u16_le(SEND_RR_DATA);
        packet.put_u16_le(total_data_len as u16);
        packet.put_u32_le(self.session_handle);
        packet.put_u32_le(0); // status
        packet.put_u64(0); // sender context
        packet.put_u32_le(0); // options

        packet.put_u32_le(0); // interface handle
        packet.put_u16_le(5); // timeout (seconds, informational)
        packet.put_u16_le(2); // item count

        packet.put_u16_le(0x0000); // null address item type
        packet.put_u16_le(0); // null address item length

        packet.put_u16_le(0x00B2); // unconnected data item type
        packet.put_u16_le(cip_len as u16);
        packet.put_slice(cip_request);

        self.stream.write_all(&packet).await?;

        let mut buf = vec![0u8; 4096];
        let n = read_with_timeout(&mut self.stream, &mut buf, self.request_timeout).await?;

        if n < 24 {
            return Err(WorkerError::Protocol("response too short".to_string()));
        }

        let cmd_status = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if cmd_status != 0 {
            return Err(WorkerError::Protocol(format!(
                "EtherNet/IP command failed (status: 0x{cmd_status:08X})"
            )));
        }

        extract_cip_from_response(&buf[..n])
    }

    /// Sends UnRegister Session. PLCs commonly don't reply; the caller
    /// doesn't wait for one.
    pub async fn close(&mut self) -> Result<()> {
        let session_bytes = self.session_handle.to_le_bytes();
        let mut packet = BytesMut::with_capacity(24);
        packet.put_u16_le(UNREGISTER_SESSION);
        packet.put_u16_le(0);
        packet.put_slice(&session_bytes);
        packet.put_u32_le(0); // status
        packet.put_u64(0); // sender context
        packet.put_u32_le(0); // options

        self.stream.write_all(&packet).await?;
        Ok(())
    }
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    request_timeout: Duration,
) -> Result<usize> {
    match timeout(request_timeout, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(WorkerError::Io(e)),
        Err(_) => Err(WorkerError::Timeout(request_timeout)),
    }
}

/// Parses the CPF (Common Packet Format) section of an EtherNet/IP
/// response and returns the Unconnected Data Item's payload (the raw CIP
/// response).
fn extract_cip_from_response(response: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 24; // EtherNet/IP header
    pos += 4; // interface handle
    pos += 2; // timeout

    if pos + 2 > response.len() {
        return Err(WorkerError::Protocol(
            "response too short for CPF header".to_string(),
        ));
    }

    let item_count = u16::from_le_bytes([response[pos], response[pos + 1]]);
    pos += 2;

    for _ in 0..item_count {
        if pos + 4 > response.len() {
            return Err(WorkerError::Protocol(
                "response truncated in CPF items".to_string(),
            ));
        }

        let item_type = u16::from_le_bytes([response[pos], response[pos + 1]]);
        pos += 2;
        let item_length = u16::from_le_bytes([response[pos], response[pos + 1]]);
        pos += 2;

        if item_type == 0x00B2 && item_length > 0 {
            if pos + item_length as usize <= response.len() {
                return Ok(response[pos..pos + item_length as usize].to_vec());
            }
            return Err(WorkerError::Protocol(
                "data item extends beyond response".to_string(),
            ));
        }

        pos += item_length as usize;
    }

    Err(WorkerError::Protocol(
        "no CIP response data found in CPF items".to_string(),
    ))
}

/// Builds a Read Tag Service (0x4C) request against a pre-built symbolic
/// CIP path (see `tag_path::TagPath::to_cip_path`), requesting `count`
/// contiguous elements (1 for a scalar read, N for a full-array read per
/// the Batch Planner's `BASE{N}` heuristic, §4.2).
pub fn build_read_request(cip_path: &[u8], count: u16) -> Vec<u8> {
    let mut request = BytesMut::with_capacity(4 + cip_path.len() + 2);
    request.put_u8(0x4C);
    request.put_u8((cip_path.len() / 2) as u8);
    request.put_slice(cip_path);
    request.put_u16_le(count);
    request.to_vec()
}

/// Builds a Write Tag Service (0x4D) request.
pub fn build_write_request(cip_path: &[u8], value: &CipValue) -> Vec<u8> {
    let value_bytes = value.to_bytes();
    let data_type = value.data_type();

    let mut request = BytesMut::with_capacity(4 + cip_path.len() + 4 + value_bytes.len());
    request.put_u8(0x4D);
    request.put_u8((cip_path.len() / 2) as u8);
    request.put_slice(cip_path);
    request.put_u16_le(data_type);
    request.put_u16_le(1); // element count
    request.put_slice(&value_bytes);
    request.to_vec()
}

/// Builds a Get_Attribute_List request against the Symbol Object (class
/// 0x6B), requesting Name / Type / Array Info for the given instance.
pub fn build_list_tags_request(instance: u16) -> Vec<u8> {
    let mut req = BytesMut::with_capacity(9);
    req.put_u8(0x03); // Get_Attribute_List
    req.put_u8(0x20);
    req.put_u8(0x6B); // class: Symbol Object
    req.put_u8(0x24);
    req.put_u16_le(instance);
    req.put_u16_le(3); // attribute count
    req.put_u8(1);
    req.put_u8(2);
    req.put_u8(3);
    req.to_vec()
}

/// Builds a Get_Attribute_Single (0x0E) request against an arbitrary
/// class/instance/attribute, used by `get_connection_status` and
/// `get_rack_configuration` (§6.3, §9).
pub fn build_get_attribute_single_request(class: u16, instance: u16, attribute: u16) -> Vec<u8> {
    let mut req = BytesMut::with_capacity(9);
    req.put_u8(0x0E);
    req.put_u8(0x20);
    req.put_u8(class as u8);
    req.put_u8(0x24);
    req.put_u8(instance as u8);
    req.put_u8(0x30);
    req.put_u8(attribute as u8);
    req.to_vec()
}

/// Validates a CIP response's general status and, on success, returns the
/// service-specific payload that follows the status header.
pub fn parse_cip_status(cip_response: &[u8]) -> Result<&[u8]> {
    if cip_response.len() < 4 {
        return Err(WorkerError::Protocol("CIP response too short".to_string()));
    }

    let general_status = cip_response[2];
    let additional_status_size = cip_response[3];

    if general_status != 0x00 {
        return Err(WorkerError::Protocol(format!(
            "CIP error 0x{general_status:02X}: {}",
            cip_error_message(general_status)
        )));
    }

    let data_start = 4 + (additional_status_size as usize * 2);
    if data_start > cip_response.len() {
        return Err(WorkerError::Protocol(
            "response too short for payload".to_string(),
        ));
    }

    Ok(&cip_response[data_start..])
}

/// Parses a Read Tag Service response into a typed `CipValue`, decoding
/// only the first element (use `parse_read_response_many` for a batch
/// array read).
pub fn parse_read_response(cip_response: &[u8]) -> Result<CipValue> {
    Ok(parse_read_response_many(cip_response, 1)?
        .into_iter()
        .next()
        .expect("count=1 always yields exactly one element"))
}

/// Parses a Read Tag Service response containing `count` contiguous
/// elements of the same data type, as returned by a full-array
/// `BASE{N}`-style read (§4.2).
pub fn parse_read_response_many(cip_response: &[u8], count: u16) -> Result<Vec<CipValue>> {
    if cip_response.len() < 4 {
        return Err(WorkerError::Protocol("CIP response too short".to_string()));
    }
    let service_reply = cip_response[0];
    if service_reply != 0xCC {
        parse_cip_status(cip_response)?;
        return Err(WorkerError::Protocol(format!(
            "unexpected service reply: 0x{service_reply:02X}"
        )));
    }

    let payload = parse_cip_status(cip_response)?;
    if payload.len() < 2 {
        return Err(WorkerError::Protocol(
            "response too short for data type".to_string(),
        ));
    }

    let data_type = u16::from_le_bytes([payload[0], payload[1]]);
    let mut value_data = &payload[2..];
    let mut values = Vec::with_capacity(count as usize);

    for _ in 0..count.max(1) {
        match data_type {
            0x00C1 => {
                if value_data.is_empty() {
                    return Err(WorkerError::Protocol("no data for BOOL value".to_string()));
                }
                values.push(CipValue::Bool(value_data[0] != 0));
                value_data = &value_data[1..];
            }
            0x00C4 => {
                if value_data.len() < 4 {
                    return Err(WorkerError::Protocol(
                        "insufficient data for DINT value".to_string(),
                    ));
                }
                values.push(CipValue::Dint(i32::from_le_bytes([
                    value_data[0],
                    value_data[1],
                    value_data[2],
                    value_data[3],
                ])));
                value_data = &value_data[4..];
            }
            0x00CA => {
                if value_data.len() < 4 {
                    return Err(WorkerError::Protocol(
                        "insufficient data for REAL value".to_string(),
                    ));
                }
                values.push(CipValue::Real(f32::from_le_bytes([
                    value_data[0],
                    value_data[1],
                    value_data[2],
                    value_data[3],
                ])));
                value_data = &value_data[4..];
            }
            0x00D0 | 0x00DA => {
                if value_data.is_empty() {
                    values.push(CipValue::String(String::new()));
                    continue;
                }
                let len = value_data[0] as usize;
                let text = value_data
                    .get(1..1 + len)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                let advance = (1 + len).min(value_data.len());
                value_data = &value_data[advance..];
                values.push(CipValue::String(text));
            }
            other => {
                return Err(WorkerError::Protocol(format!(
                    "unsupported data type: 0x{other:04X}"
                )))
            }
        }
    }

    Ok(values)
}

/// Validates a Write Tag Service response (no payload to extract on
/// success).
pub fn parse_write_response(cip_response: &[u8]) -> Result<()> {
    parse_cip_status(cip_response)?;
    Ok(())
}

fn cip_error_message(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x23 => "Buffer overflow",
        0x24 => "Invalid message format",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        0x2A => "Group 2 only server general failure",
        0x2B => "Unknown Modbus error",
        0x2C => "Attribute not gettable",
        _ => "Unknown CIP error",
    }
}
