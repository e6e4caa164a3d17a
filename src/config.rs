//! Process-wide worker configuration (§1 EXPANSION, §6.4).
//!
//! Defaults are overridable by an optional TOML file named by the
//! `CIP_WORKER_CONFIG` environment variable, and by the array-mode switch
//! (`PYCOMM3_ARRAY_MODE`) the original worker exposes directly as an env var
//! rather than a config field. Both layers coexist: the file sets defaults
//! for values a `connect` call doesn't override, the env var always wins for
//! array mode since that's how the reference worker wires it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the Batch Planner decides between one full-array read and several
/// sparse element reads (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayMode {
    /// Apply the 10-element / 10%-of-extent heuristic (default).
    Batch,
    /// Always expand to individual element reads.
    Individual,
}

impl ArrayMode {
    fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "individual" => ArrayMode::Individual,
            _ => ArrayMode::Batch,
        }
    }
}

impl Default for ArrayMode {
    fn default() -> Self {
        ArrayMode::Batch
    }
}

/// Worker-wide configuration assembled from defaults, an optional config
/// file, and environment overrides (§1 EXPANSION, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Default host used when a `connect` call omits one.
    pub default_host: Option<String>,
    /// Default processor slot (ControlLogix backplane slot; 0 for
    /// CompactLogix).
    pub default_slot: u8,
    /// Batch-vs-individual array read heuristic switch.
    pub array_mode: ArrayMode,
    /// Soft limit on tags per poll group before the Subscription Manager
    /// splits an install into multiple groups (§4.4).
    pub max_tags_per_group: usize,
    /// Soft cap on concurrently-open poll group sessions; exceeding it
    /// produces a warning, not a hard failure (§4.4).
    pub max_concurrent_connections: usize,
    /// CIP session registration / request timeout.
    pub session_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_host: None,
            default_slot: 0,
            array_mode: ArrayMode::Batch,
            max_tags_per_group: 500,
            max_concurrent_connections: 8,
            session_timeout_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    /// Loads a config file named by `TOML` content, falling back to defaults
    /// field-by-field (`#[serde(default)]` on every field means a partial
    /// file is fine).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config: WorkerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Builds the effective configuration: defaults, optionally overridden
    /// by `CIP_WORKER_CONFIG`'s file, then by `PYCOMM3_ARRAY_MODE` (the env
    /// var always wins, matching the original worker's direct `os.getenv`
    /// read with no file-based override for this one field).
    pub fn load() -> Self {
        let mut config = match std::env::var("CIP_WORKER_CONFIG") {
            Ok(path) => Self::from_file(&path).unwrap_or_else(|err| {
                log::warn!("failed to read CIP_WORKER_CONFIG at {path}: {err}");
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(mode) = std::env::var("PYCOMM3_ARRAY_MODE") {
            config.array_mode = ArrayMode::from_env_str(&mode);
        }

        config
    }

    /// Validates the configuration, returning every violation found rather
    /// than failing fast on the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_tags_per_group == 0 {
            errors.push("max_tags_per_group must be greater than 0".to_string());
        }
        if self.max_concurrent_connections == 0 {
            errors.push("max_concurrent_connections must be greater than 0".to_string());
        }
        if self.session_timeout_ms == 0 {
            errors.push("session_timeout_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
