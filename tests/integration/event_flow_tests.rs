//! Event-delivery path over a full turn.

use agent_conductor::history::HistoryStore;
use agent_conductor::models::event::AgentEventKind;
use agent_conductor::models::history::MessageRole;
use agent_conductor::models::session::{ProcessingPhase, SessionHost};

use super::test_helpers::{deliver, harness, silent};

#[tokio::test]
async fn full_turn_updates_phase_counters_and_history() {
    let h = harness(silent());
    h.coordinator
        .open_session("s1", SessionHost::Local)
        .expect("open");
    h.coordinator.send_prompt("s1", "fix the bug").await.expect("send");
    let phase = |h: &super::test_helpers::Harness| {
        h.coordinator
            .snapshot("s1")
            .expect("snapshot")
            .processing_phase
    };

    deliver(&h, "s1", AgentEventKind::TurnStart);
    assert_eq!(phase(&h), ProcessingPhase::Thinking);

    deliver(
        &h,
        "s1",
        AgentEventKind::AssistantMessageDelta {
            content: "Let me ".into(),
        },
    );
    deliver(
        &h,
        "s1",
        AgentEventKind::AssistantMessageDelta {
            content: "check".into(),
        },
    );
    assert_eq!(phase(&h), ProcessingPhase::Streaming);
    assert_eq!(
        h.coordinator.snapshot("s1").expect("snapshot").current_response,
        "Let me check"
    );

    deliver(
        &h,
        "s1",
        AgentEventKind::ToolStart {
            tool_call_id: Some("c1".into()),
            tool_name: "bash".into(),
        },
    );
    let snapshot = h.coordinator.snapshot("s1").expect("snapshot");
    assert_eq!(snapshot.processing_phase, ProcessingPhase::RunningTools);
    assert_eq!(snapshot.active_tool_call_count, 1);
    assert_eq!(snapshot.tool_call_count, 1);
    assert!(snapshot.has_used_tools_this_turn);
    assert!(snapshot.current_response.is_empty());

    deliver(
        &h,
        "s1",
        AgentEventKind::ToolEnd {
            tool_call_id: Some("c1".into()),
            success: true,
        },
    );
    assert_eq!(
        h.coordinator
            .snapshot("s1")
            .expect("snapshot")
            .active_tool_call_count,
        0
    );

    deliver(&h, "s1", AgentEventKind::TurnEnd);
    deliver(&h, "s1", AgentEventKind::TurnStart);
    deliver(
        &h,
        "s1",
        AgentEventKind::AssistantMessageDelta {
            content: "Fixed.".into(),
        },
    );
    deliver(&h, "s1", AgentEventKind::SessionIdle);

    let snapshot = h.coordinator.snapshot("s1").expect("snapshot");
    assert!(!snapshot.is_processing);
    assert_eq!(snapshot.processing_phase, ProcessingPhase::Idle);

    let entries: Vec<(MessageRole, String)> = h
        .history
        .messages("s1")
        .into_iter()
        .map(|m| (m.role, m.content))
        .collect();
    assert_eq!(
        entries,
        vec![
            (MessageRole::User, "fix the bug".to_owned()),
            (MessageRole::Assistant, "Let me check".to_owned()),
            (MessageRole::Tool, "bash".to_owned()),
            (MessageRole::Assistant, "Fixed.".to_owned()),
        ]
    );
}

#[tokio::test]
async fn turn_start_resets_active_tools_but_not_sticky_flag() {
    let h = harness(silent());
    h.coordinator
        .open_session("s1", SessionHost::Local)
        .expect("open");
    h.coordinator.send_prompt("s1", "build").await.expect("send");

    deliver(
        &h,
        "s1",
        AgentEventKind::ToolStart {
            tool_call_id: None,
            tool_name: "cargo".into(),
        },
    );
    // The round ends without a matching tool_end.
    deliver(&h, "s1", AgentEventKind::TurnStart);

    let snapshot = h.coordinator.snapshot("s1").expect("snapshot");
    assert_eq!(snapshot.active_tool_call_count, 0);
    assert!(snapshot.has_used_tools_this_turn);

    // A late tool_end does not underflow.
    deliver(
        &h,
        "s1",
        AgentEventKind::ToolEnd {
            tool_call_id: None,
            success: false,
        },
    );
    assert_eq!(
        h.coordinator
            .snapshot("s1")
            .expect("snapshot")
            .active_tool_call_count,
        0
    );
}

#[tokio::test]
async fn session_error_flushes_partial_output() {
    let h = harness(silent());
    h.coordinator
        .open_session("s1", SessionHost::Local)
        .expect("open");
    h.coordinator.send_prompt("s1", "go").await.expect("send");

    deliver(
        &h,
        "s1",
        AgentEventKind::AssistantMessageDelta {
            content: "half an answer".into(),
        },
    );
    deliver(
        &h,
        "s1",
        AgentEventKind::SessionError {
            message: "rate limited".into(),
        },
    );

    assert!(!h.coordinator.snapshot("s1").expect("snapshot").is_processing);
    assert_eq!(
        h.coordinator.last_response("s1").as_deref(),
        Some("half an answer")
    );
    let ended = h
        .diagnostics
        .of_kind(agent_conductor::diagnostics::DiagnosticKind::TurnEnded);
    assert_eq!(ended[0].trigger.as_deref(), Some("agent_error"));
    assert_eq!(ended[0].detail.as_deref(), Some("rate limited"));
}

#[tokio::test]
async fn applied_events_feed_session_metrics() {
    let h = harness(silent());
    h.coordinator
        .open_session("s1", SessionHost::Local)
        .expect("open");

    // Ignored while idle.
    deliver(&h, "s1", AgentEventKind::TurnEnd);
    assert!(h.coordinator.session_metrics("s1").is_none());

    h.coordinator.send_prompt("s1", "build it").await.expect("send");
    deliver(&h, "s1", AgentEventKind::TurnStart);
    deliver(
        &h,
        "s1",
        AgentEventKind::ToolStart {
            tool_call_id: Some("c1".into()),
            tool_name: "bash".into(),
        },
    );
    deliver(
        &h,
        "s1",
        AgentEventKind::ToolEnd {
            tool_call_id: Some("c1".into()),
            success: false,
        },
    );
    deliver(&h, "s1", AgentEventKind::TurnEnd);
    deliver(
        &h,
        "s1",
        AgentEventKind::SessionError {
            message: "model overloaded".into(),
        },
    );

    let metrics = h.coordinator.session_metrics("s1").expect("metrics");
    assert_eq!(metrics.turns, 1);
    assert_eq!(metrics.turns_by_trigger.get("agent_error"), Some(&1));
    assert_eq!(metrics.reasoning_rounds, 1);
    assert_eq!(metrics.tool_calls_by_name.get("bash"), Some(&1));
    assert_eq!(metrics.tool_failures, 1);
    assert_eq!(metrics.errors.len(), 1);
    assert_eq!(metrics.errors[0].message, "model overloaded");

    h.coordinator.close_session("s1").expect("close");
    assert_eq!(
        h.coordinator.session_metrics("s1").map(|m| m.turns),
        Some(1)
    );
}
