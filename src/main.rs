//! Worker process entry point: wires stdin to the RPC dispatcher, writes
//! telemetry and RPC responses to stdout, and logs exclusively to stderr
//! (§1 EXPANSION, §4.6).

use cip_poll_worker::config::WorkerConfig;
use cip_poll_worker::rpc::{handle_line, WorkerState};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = WorkerConfig::load();
    if let Err(errors) = config.validate() {
        for error in &errors {
            log::error!("invalid configuration: {error}");
        }
        std::process::exit(1);
    }

    log::info!(
        "cip-poll-worker {} starting (array_mode={:?}, max_tags_per_group={}, max_concurrent_connections={})",
        cip_poll_worker::version::VERSION_STRING,
        config.array_mode,
        config.max_tags_per_group,
        config.max_concurrent_connections,
    );

    let state = Arc::new(WorkerState::new(config));

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let shutdown_state = state.clone();
    let ctrl_c = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("received interrupt signal");
        shutdown_state.shutdown().await;
        std::process::exit(0);
    });

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("stdin closed, shutting down");
                break;
            }
            Err(err) => {
                log::error!("error reading stdin: {err}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handle_line(&state, line).await;
        state.telemetry().write_line(&response).await;
    }

    ctrl_c.abort();
    state.shutdown().await;
    log::info!("cip-poll-worker stopped");
}
