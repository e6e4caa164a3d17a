//! Publishes sampled tag values as newline-delimited JSON frames on stdout
//! (§4.5, §6.2).
//!
//! Frames are written atomically (one `write_all` per line, guarded by a
//! mutex) so interleaved group tasks never tear a line in half.

use crate::change_filter::Quality;
use crate::value::TagValue;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
struct Frame<'a> {
    tag_id: u64,
    v: &'a TagValue,
    q: u8,
    ts: &'a str,
}

/// Serializes and writes telemetry frames to stdout, one line per sample.
#[derive(Clone)]
pub struct TelemetryEmitter {
    stdout: Arc<Mutex<Stdout>>,
}

impl TelemetryEmitter {
    pub fn new() -> Self {
        Self {
            stdout: Arc::new(Mutex::new(tokio::io::stdout())),
        }
    }

    /// Emits one telemetry frame: `{"tag_id": ..., "v": ..., "q": 0|1, "ts": "..."}`.
    pub async fn emit(&self, tag_id: u64, value: &TagValue, quality: Quality, ts: &str) {
        let frame = Frame {
            tag_id,
            v: value,
            q: quality.code(),
            ts,
        };
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(err) => {
                log::error!("failed to serialize telemetry frame for tag {tag_id}: {err}");
                return;
            }
        };
        self.write_line(&line).await;
    }

    /// Writes one already-serialized line to stdout through the same
    /// mutex-guarded handle telemetry frames use, so RPC responses and
    /// telemetry frames never interleave mid-line (§5).
    pub async fn write_line(&self, line: &str) {
        let mut stdout = self.stdout.lock().await;
        if let Err(err) = stdout.write_all(line.as_bytes()).await {
            log::error!("failed to write line to stdout: {err}");
            return;
        }
        if let Err(err) = stdout.write_all(b"\n").await {
            log::error!("failed to write line newline: {err}");
            return;
        }
        if let Err(err) = stdout.flush().await {
            log::error!("failed to flush stdout: {err}");
        }
    }
}

impl Default for TelemetryEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Current UTC instant formatted as ISO-8601 with a trailing `Z`, matching
/// the frame shape's `ts` field.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_serializes_with_expected_keys() {
        let value = TagValue::Float(10.5);
        let frame = Frame {
            tag_id: 7,
            v: &value,
            q: Quality::Good.code(),
            ts: "2026-07-28T00:00:00.000Z",
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"tag_id\":7"));
        assert!(json.contains("\"v\":10.5"));
        assert!(json.contains("\"q\":0"));
        assert!(json.contains("\"ts\":\"2026-07-28T00:00:00.000Z\""));
    }

    #[test]
    fn null_value_serializes_as_json_null() {
        let value = TagValue::Null;
        let frame = Frame {
            tag_id: 1,
            v: &value,
            q: Quality::Bad.code(),
            ts: "2026-07-28T00:00:00.000Z",
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"v\":null"));
        assert!(json.contains("\"q\":1"));
    }

    #[test]
    fn iso8601_timestamp_ends_with_z() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
