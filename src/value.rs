//! Wire-level tag value representation and sanitization (§3, §9 Design Notes).
//!
//! Values cross the JSON-RPC boundary as a heterogeneous scalar union. This
//! is deliberately looser than the CIP driver's own typed representation
//! (BOOL/DINT/REAL/STRING/...) — the Change Filter and Telemetry Emitter
//! never need to know which concrete PLC type produced a sample, only
//! whether it's null, boolean, numeric, or text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A tag sample as it travels through the Change Filter and onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl TagValue {
    /// Replaces NaN/Infinite floats with the null sentinel (§4.3 Sanitizer).
    /// Every other value, including finite floats, passes through unchanged.
    pub fn sanitize(self) -> TagValue {
        match self {
            TagValue::Float(f) if !f.is_finite() => TagValue::Null,
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TagValue::Null)
    }

    /// Numeric value as `f64`, promoting integers, for deadband math (§9).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Int(i) => Some(*i as f64),
            TagValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, TagValue::Int(_) | TagValue::Float(_))
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Null => write!(f, "null"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::String(s) => write!(f, "{s}"),
        }
    }
}
