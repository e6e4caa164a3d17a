// cip-poll-worker
// ================
//
// An EtherNet/IP (CIP) tag-polling worker for Allen-Bradley Logix-family
// PLCs. It maintains one CIP session per poll group, polls each group's
// tags at a rate-stabilized period, runs samples through a per-tag
// deadband/heartbeat change filter, and streams telemetry frames as
// line-delimited JSON on stdout. Control (connect, read/write, subscribe,
// discovery, ...) arrives as line-delimited JSON-RPC on stdin.
//
// ## Module map
//
// - [`value`] — the wire-level tag value union and its sanitizer.
// - [`change_filter`] — per-tag deadband/heartbeat publish decision.
// - [`batch_planner`] — partitions a group's tags into scalar / full-array /
//   sparse-element read requests.
// - [`tag_path`] — symbolic tag path parsing and CIP path generation.
// - [`tag_manager`] — discovered tag metadata cache.
// - [`protocol`] — EtherNet/IP encapsulation and CIP request/response
//   encode/decode.
// - [`driver`] — the `CipDriver` trait (CIP Driver Facade) plus its
//   EtherNet/IP-backed implementation.
// - [`poll_group`] — the per-group poll loop (Poll Group Runner).
// - [`subscription`] — the Subscription Manager: install/teardown, group
//   splitting, Runner lifecycle.
// - [`telemetry`] — serializes and writes telemetry frames to stdout.
// - [`rpc`] — the JSON-RPC dispatcher and worker-wide mutable state.
// - [`config`] — process-wide configuration (env vars, optional TOML file).
// - [`error`] — the crate-wide error type and JSON-RPC error code mapping.

pub mod batch_planner;
pub mod change_filter;
pub mod config;
pub mod driver;
pub mod error;
pub mod poll_group;
pub mod protocol;
pub mod rpc;
pub mod subscription;
pub mod tag_manager;
pub mod tag_path;
pub mod telemetry;
pub mod value;
pub mod version;

pub use error::{Result, WorkerError};
