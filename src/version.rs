//! Worker version metadata, reported in `connect`'s `plc_info` and on
//! startup log lines.

/// Current version of the worker, from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version string in format "v0.1.0".
pub const VERSION_STRING: &str = concat!("v", env!("CARGO_PKG_VERSION"));
