//! RPC Dispatcher integration tests: envelope shapes, error codes, and
//! preconditions a caller depends on before a real PLC is ever reached
//! (§4.6, §6.1, §7).

use cip_poll_worker::config::WorkerConfig;
use cip_poll_worker::rpc::{handle_line, WorkerState};
use serde_json::Value;

fn parse(line: &str) -> Value {
    serde_json::from_str(line).expect("dispatcher must always emit valid JSON")
}

#[tokio::test]
async fn malformed_request_yields_parse_error_with_null_id() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(&state, "{not valid json").await;
    let value = parse(&response);
    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["error"]["code"], -32700);
    assert!(value["id"].is_null());
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(
        &state,
        r#"{"jsonrpc":"2.0","method":"frobnicate","params":{},"id":42}"#,
    )
    .await;
    let value = parse(&response);
    assert_eq!(value["error"]["code"], -32601);
    assert_eq!(value["id"], 42);
}

#[tokio::test]
async fn read_tag_before_connect_is_a_precondition_error_not_a_crash() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(
        &state,
        r#"{"jsonrpc":"2.0","method":"read_tag","params":{"tag_name":"Tag1"},"id":1}"#,
    )
    .await;
    let value = parse(&response);
    assert_eq!(value["error"]["code"], -32000);
}

#[tokio::test]
async fn write_tag_missing_value_field_is_invalid_request() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(
        &state,
        r#"{"jsonrpc":"2.0","method":"write_tag","params":{"tag_name":"Tag1"},"id":2}"#,
    )
    .await;
    let value = parse(&response);
    assert_eq!(value["error"]["code"], -32000);
}

#[tokio::test]
async fn stop_polling_is_idempotent_on_an_empty_subscription() {
    // §8 boundary test: empty subscription, stop_polling idempotent.
    let state = WorkerState::new(WorkerConfig::default());
    for id in [1, 2] {
        let response = handle_line(
            &state,
            &format!(r#"{{"jsonrpc":"2.0","method":"stop_polling","id":{id}}}"#),
        )
        .await;
        let value = parse(&response);
        assert_eq!(value["result"]["success"], true);
    }
}

#[tokio::test]
async fn subscribe_polling_without_a_connection_is_rejected() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(
        &state,
        r#"{"jsonrpc":"2.0","method":"subscribe_polling","params":{"tags":[],"poll_groups":{}},"id":3}"#,
    )
    .await;
    let value = parse(&response);
    assert_eq!(value["error"]["code"], -32000);
}

#[tokio::test]
async fn requests_with_no_id_still_get_a_well_formed_response() {
    let state = WorkerState::new(WorkerConfig::default());
    let response = handle_line(&state, r#"{"jsonrpc":"2.0","method":"stop_polling"}"#).await;
    let value = parse(&response);
    assert_eq!(value["result"]["success"], true);
    assert!(value["id"].is_null());
}
