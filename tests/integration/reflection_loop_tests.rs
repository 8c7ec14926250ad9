//! Reflection loop end-to-end over scripted sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_conductor::config::ReflectionConfig;
use agent_conductor::diagnostics::DiagnosticKind;
use agent_conductor::models::reflection::{
    QualityTrend, ReflectionOutcome, ReflectionPhase, ReflectionState, ReflectionSummary,
};
use agent_conductor::models::session::SessionHost;
use agent_conductor::orchestrator::{ReflectionGroups, ReflectionRequest};
use agent_conductor::AppError;

use super::test_helpers::{harness, Harness, Responder};

/// Orchestrator plans one task per worker; workers answer `worker_reply`;
/// the evaluator walks through `verdicts`, repeating the last one.
fn scripted(
    worker_reply: impl Fn(&str, usize) -> String + Send + Sync + 'static,
    verdicts: Vec<&'static str>,
) -> Responder {
    let worker_calls = AtomicUsize::new(0);
    let evaluations = AtomicUsize::new(0);
    Arc::new(move |session, prompt| {
        if prompt.starts_with("You coordinate") {
            Some("@w1: build the parser\n@w2: write the tests".into())
        } else if prompt.starts_with("You are evaluating") {
            let i = evaluations.fetch_add(1, Ordering::SeqCst);
            let verdict = verdicts.get(i).or(verdicts.last()).copied().unwrap_or("");
            Some(verdict.to_owned())
        } else {
            let n = worker_calls.fetch_add(1, Ordering::SeqCst);
            Some(worker_reply(session, n))
        }
    })
}

fn varying(session: &str, n: usize) -> String {
    format!("{session} finished pass {n}")
}

fn setup(responder: Responder, evaluator: bool) -> (Harness, ReflectionGroups) {
    setup_with(responder, evaluator, ReflectionConfig::default())
}

fn setup_with(
    responder: Responder,
    evaluator: bool,
    config: ReflectionConfig,
) -> (Harness, ReflectionGroups) {
    let h = harness(responder);
    let mut ids = vec!["orch", "w1", "w2"];
    if evaluator {
        ids.push("eval");
    }
    for id in ids {
        h.coordinator
            .open_session(id, SessionHost::Local)
            .expect("open");
    }
    let groups = ReflectionGroups::new(Arc::clone(&h.coordinator), config);
    (h, groups)
}

fn request(max_iterations: Option<u32>, evaluator: bool) -> ReflectionRequest {
    ReflectionRequest {
        goal: "ship a working parser".into(),
        max_iterations,
        orchestrator: "orch".into(),
        workers: vec!["w1".into(), "w2".into()],
        evaluator: evaluator.then(|| "eval".to_owned()),
    }
}

async fn finish(groups: &ReflectionGroups, group_id: &str) -> ReflectionSummary {
    tokio::time::timeout(Duration::from_secs(10), groups.await_reflection(group_id))
        .await
        .expect("loop finishes")
        .expect("summary")
}

#[tokio::test]
async fn completes_when_evaluator_reports_goal_met() {
    let responder = scripted(
        varying,
        vec![
            "SCORE: 0.5\nGOAL_MET: no\nRATIONALE: tests missing",
            "SCORE: 0.95\nGOAL_MET: yes\nRATIONALE: all done",
        ],
    );
    let (h, groups) = setup(responder, true);

    let group_id = groups.start_reflection(request(None, true)).expect("start");
    let summary = finish(&groups, &group_id).await;

    assert_eq!(summary.outcome, ReflectionOutcome::Completed);
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.final_score, Some(0.95));
    assert_eq!(summary.trend, QualityTrend::Improving);
    assert_eq!(summary.evaluations[0].evaluator, "eval");
    assert_eq!(summary.evaluations[1].iteration, 2);

    let state = groups.reflection_state(&group_id).expect("state");
    assert_eq!(state.phase, ReflectionPhase::Completed);
    assert!(state.goal_met);
    assert!(!state.is_active);

    assert_eq!(
        h.diagnostics.of_kind(DiagnosticKind::ReflectionIteration).len(),
        2
    );
    assert_eq!(
        h.diagnostics.of_kind(DiagnosticKind::ReflectionFinished).len(),
        1
    );
}

#[tokio::test]
async fn repeated_synthesis_stalls_the_loop() {
    let responder = scripted(
        |session, _| format!("{session}: nothing left to change"),
        vec!["SCORE: 0.4\nGOAL_MET: no\nRATIONALE: same as before"],
    );
    let (_h, groups) = setup(responder, true);

    let group_id = groups
        .start_reflection(request(Some(10), true))
        .expect("start");
    let summary = finish(&groups, &group_id).await;

    // Iteration 3's synthesis is the second consecutive repeat.
    assert_eq!(summary.outcome, ReflectionOutcome::Stalled);
    assert_eq!(summary.iterations, 2);
    let state = groups.reflection_state(&group_id).expect("state");
    assert!(state.is_stalled);
    assert_eq!(state.consecutive_stalls, 2);
    assert_eq!(state.phase, ReflectionPhase::Stalled);
}

#[tokio::test]
async fn iteration_cap_exhausts_the_loop() {
    let responder = scripted(
        varying,
        vec!["SCORE: 0.6\nGOAL_MET: no\nRATIONALE: close", "SCORE: 0.3\nGOAL_MET: no\nRATIONALE: regressed"],
    );
    let (_h, groups) = setup(responder, true);

    let group_id = groups
        .start_reflection(request(Some(2), true))
        .expect("start");
    let summary = finish(&groups, &group_id).await;

    assert_eq!(summary.outcome, ReflectionOutcome::Exhausted);
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.trend, QualityTrend::Degrading);
}

#[tokio::test]
async fn orchestrator_evaluates_without_dedicated_evaluator() {
    let responder = scripted(varying, vec!["SCORE: 9/10"]);
    let (_h, groups) = setup(responder, false);

    let group_id = groups.start_reflection(request(None, false)).expect("start");
    let summary = finish(&groups, &group_id).await;

    assert_eq!(summary.outcome, ReflectionOutcome::Completed);
    assert_eq!(summary.evaluations[0].evaluator, "orch");
    assert!((summary.evaluations[0].score - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn unparseable_verdict_scores_zero_and_continues() {
    let responder = scripted(varying, vec!["looks good to me"]);
    let (_h, groups) = setup(responder, true);

    let group_id = groups
        .start_reflection(request(Some(2), true))
        .expect("start");
    let summary = finish(&groups, &group_id).await;

    assert_eq!(summary.outcome, ReflectionOutcome::Exhausted);
    assert!(summary.evaluations.iter().all(|e| e.score == 0.0));
    assert!(summary.evaluations[0]
        .rationale
        .starts_with("evaluator response could not be parsed"));
}

#[tokio::test]
async fn workers_receive_their_addressed_tasks() {
    let seen: Arc<std::sync::Mutex<Vec<(String, String)>>> = Arc::default();
    let log = Arc::clone(&seen);
    let inner = scripted(varying, vec!["SCORE: 1.0\nGOAL_MET: yes"]);
    let responder: Responder = Arc::new(move |session, prompt| {
        log.lock()
            .expect("log lock")
            .push((session.to_owned(), prompt.to_owned()));
        inner(session, prompt)
    });
    let (h, groups) = setup(responder, true);

    let group_id = groups.start_reflection(request(None, true)).expect("start");
    finish(&groups, &group_id).await;

    let seen = seen.lock().expect("log lock").clone();
    let w1 = seen.iter().find(|(s, _)| s == "w1").expect("w1 prompted");
    let w2 = seen.iter().find(|(s, _)| s == "w2").expect("w2 prompted");
    assert!(w1.1.contains("build the parser"));
    assert!(w2.1.contains("write the tests"));
    let eval = seen.iter().find(|(s, _)| s == "eval").expect("eval prompted");
    assert!(eval.1.contains("### @w1\nw1 finished pass"));

    // Every session is idle again once the loop ends.
    for id in ["orch", "w1", "w2", "eval"] {
        assert!(!h.coordinator.snapshot(id).expect("snapshot").is_processing);
    }
}

#[tokio::test]
async fn pause_holds_loop_until_resumed() {
    let responder = scripted(varying, vec!["SCORE: 0.92"]);
    let (_h, groups) = setup(responder, true);

    let group_id = groups.start_reflection(request(None, true)).expect("start");
    groups.pause_reflection(&group_id).expect("pause");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = groups.reflection_state(&group_id).expect("state");
    assert!(state.is_paused);
    assert_eq!(state.current_iteration, 0);
    assert!(!state.phase.is_terminal());

    groups.resume_reflection(&group_id).expect("resume");
    let summary = finish(&groups, &group_id).await;
    assert_eq!(summary.outcome, ReflectionOutcome::Completed);
    assert!(!groups.reflection_state(&group_id).expect("state").is_paused);
}

#[tokio::test]
async fn stop_cancels_a_paused_loop() {
    let responder = scripted(varying, vec!["SCORE: 0.1"]);
    let (_h, groups) = setup(responder, true);

    let group_id = groups.start_reflection(request(None, true)).expect("start");
    groups.pause_reflection(&group_id).expect("pause");
    tokio::time::sleep(Duration::from_millis(20)).await;
    groups.stop_reflection(&group_id).expect("stop");

    let summary = finish(&groups, &group_id).await;
    assert_eq!(summary.outcome, ReflectionOutcome::Cancelled);
    assert_eq!(summary.iterations, 0);
    assert!(summary.final_score.is_none());
    assert_eq!(
        groups.reflection_state(&group_id).expect("state").phase,
        ReflectionPhase::Cancelled
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (_h, groups) = setup(scripted(varying, vec![]), true);

    let mut no_workers = request(None, true);
    no_workers.workers.clear();
    assert!(matches!(
        groups.start_reflection(no_workers),
        Err(AppError::Orchestration(_))
    ));

    let mut self_worker = request(None, true);
    self_worker.workers.push("orch".into());
    assert!(matches!(
        groups.start_reflection(self_worker),
        Err(AppError::Orchestration(_))
    ));

    let mut unknown = request(None, true);
    unknown.workers.push("w9".into());
    assert!(matches!(
        groups.start_reflection(unknown),
        Err(AppError::NotFound(_))
    ));

    assert!(matches!(
        groups.start_reflection(request(Some(0), true)),
        Err(AppError::Orchestration(_))
    ));

    assert!(matches!(
        groups.pause_reflection("missing"),
        Err(AppError::NotFound(_))
    ));
    assert!(groups.group_ids().is_empty());
}

#[tokio::test]
async fn sessions_cannot_join_two_active_groups() {
    let (_h, groups) = setup(scripted(varying, vec!["SCORE: 0.1"]), true);

    let first = groups.start_reflection(request(None, true)).expect("start");
    groups.pause_reflection(&first).expect("pause");

    let second = groups.start_reflection(request(None, false));
    assert!(matches!(second, Err(AppError::Busy(_))));

    groups.stop_reflection(&first).expect("stop");
    finish(&groups, &first).await;

    // A finished group releases its sessions.
    let third = groups.start_reflection(request(Some(1), true)).expect("start");
    finish(&groups, &third).await;
    assert_eq!(groups.group_ids().len(), 2);
}

#[tokio::test]
async fn final_state_snapshot_is_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ReflectionConfig {
        snapshot_dir: Some(dir.path().join("snapshots")),
        ..ReflectionConfig::default()
    };
    let (_h, groups) = setup_with(scripted(varying, vec!["SCORE: 1.0"]), true, config);

    let group_id = groups.start_reflection(request(None, true)).expect("start");
    finish(&groups, &group_id).await;

    let path = dir.path().join("snapshots").join(format!("{group_id}.json"));
    let raw = std::fs::read_to_string(path).expect("snapshot file");
    let state: ReflectionState = serde_json::from_str(&raw).expect("snapshot json");
    assert_eq!(state.group_id, group_id);
    assert_eq!(state.phase, ReflectionPhase::Completed);
    assert_eq!(state.evaluation_history.len(), 1);
}

#[tokio::test]
async fn summary_is_handed_out_once() {
    let (_h, groups) = setup(scripted(varying, vec!["SCORE: 1.0"]), true);
    let group_id = groups.start_reflection(request(None, true)).expect("start");
    finish(&groups, &group_id).await;

    assert!(matches!(
        groups.await_reflection(&group_id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn finished_groups_can_be_forgotten() {
    let (_h, groups) = setup(scripted(varying, vec!["SCORE: 0.1"]), true);
    let group_id = groups.start_reflection(request(None, true)).expect("start");
    groups.pause_reflection(&group_id).expect("pause");

    assert!(matches!(
        groups.forget_reflection(&group_id),
        Err(AppError::Busy(_))
    ));

    groups.stop_reflection(&group_id).expect("stop");
    finish(&groups, &group_id).await;

    let last = groups.forget_reflection(&group_id).expect("forget");
    assert_eq!(last.phase, ReflectionPhase::Cancelled);
    assert!(groups.group_ids().is_empty());
    assert!(matches!(
        groups.reflection_state(&group_id),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        groups.forget_reflection(&group_id),
        Err(AppError::NotFound(_))
    ));

    // The sessions are free for a new group once the old one is gone.
    groups.start_reflection(request(None, true)).expect("restart");
}
