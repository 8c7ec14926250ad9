//! NDJSON bridge: event parsing, framing, and the reader/writer tasks.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use agent_conductor::models::event::AgentEventKind;
use agent_conductor::runtime::codec::{NdjsonCodec, MAX_LINE_BYTES};
use agent_conductor::runtime::ndjson::{
    parse_event_line, run_reader, run_writer, NdjsonRuntime, RuntimeCommand,
};
use agent_conductor::runtime::AgentRuntime;
use agent_conductor::AppError;

#[test]
fn parses_tool_start_event() {
    let line = r#"{"session_id":"w1","timestamp":"2026-01-01T00:00:00Z","type":"tool_start","tool_name":"bash"}"#;
    let event = parse_event_line(line).expect("valid").expect("not blank");
    assert_eq!(event.session_id, "w1");
    assert_eq!(
        event.kind,
        AgentEventKind::ToolStart {
            tool_call_id: None,
            tool_name: "bash".into()
        }
    );
}

#[test]
fn missing_timestamp_and_success_default() {
    let event = parse_event_line(r#"{"session_id":"w1","type":"tool_end"}"#)
        .expect("valid")
        .expect("not blank");
    assert_eq!(
        event.kind,
        AgentEventKind::ToolEnd {
            tool_call_id: None,
            success: true
        }
    );
}

#[test]
fn blank_line_is_skipped() {
    assert!(parse_event_line("   ").expect("blank is fine").is_none());
}

#[test]
fn unknown_event_type_is_protocol_error() {
    let result = parse_event_line(r#"{"session_id":"w1","type":"teleport"}"#);
    assert!(matches!(result, Err(AppError::Protocol(_))));
}

#[test]
fn codec_rejects_oversized_line() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_BYTES + 1].as_slice());
    let result = codec.decode(&mut buf);
    assert!(matches!(result, Err(AppError::Protocol(msg)) if msg.contains("line too long")));
}

#[test]
fn commands_serialize_with_command_tag() {
    let json = serde_json::to_string(&RuntimeCommand::SendPrompt {
        session_id: "w1".into(),
        prompt: "hi".into(),
    })
    .expect("serialize");
    assert_eq!(json, r#"{"command":"send_prompt","session_id":"w1","prompt":"hi"}"#);
}

#[tokio::test]
async fn reader_forwards_events_and_skips_garbage() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (event_tx, mut event_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader(server, event_tx, cancel.clone()));

    client
        .write_all(
            b"not json\n\
              {\"session_id\":\"w1\",\"type\":\"assistant_message_delta\",\"content\":\"hi\"}\n\
              \n\
              {\"session_id\":\"w1\",\"type\":\"session_idle\"}\n",
        )
        .await
        .expect("write");
    drop(client);

    let first = event_rx.recv().await.expect("delta");
    assert_eq!(
        first.kind,
        AgentEventKind::AssistantMessageDelta {
            content: "hi".into()
        }
    );
    let second = event_rx.recv().await.expect("idle");
    assert_eq!(second.kind, AgentEventKind::SessionIdle);

    reader.await.expect("join").expect("reader ok");
}

#[tokio::test]
async fn runtime_commands_reach_the_writer_output() {
    let (command_tx, command_rx) = mpsc::channel(8);
    let (output, mut sink) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let writer = tokio::spawn(run_writer(output, command_rx, cancel.clone()));

    let runtime = NdjsonRuntime::new(command_tx);
    runtime.send_prompt("w1", "do it").await.expect("send");
    runtime.abort("w1").await.expect("abort");
    drop(runtime);

    writer.await.expect("join").expect("writer ok");

    let mut written = String::new();
    sink.read_to_string(&mut written).await.expect("read");
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"send_prompt\""));
    assert_eq!(lines[1], r#"{"command":"abort","session_id":"w1"}"#);
}

#[tokio::test]
async fn runtime_reports_closed_bridge() {
    let (command_tx, command_rx) = mpsc::channel(1);
    drop(command_rx);
    let runtime = NdjsonRuntime::new(command_tx);
    let result = runtime.reconnect("w1").await;
    assert!(matches!(result, Err(AppError::Runtime(_))));
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (_client, server) = tokio::io::duplex(64);
    let (event_tx, _event_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader(server, event_tx, cancel.clone()));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader exits")
        .expect("join")
        .expect("reader ok");
}
