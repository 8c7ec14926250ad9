use chrono::Utc;

use agent_conductor::diagnostics::{
    DiagnosticEntry, DiagnosticKind, DiagnosticLogger, JsonlDiagnosticWriter,
};

#[test]
fn writes_one_json_line_per_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlDiagnosticWriter::new(dir.path().to_path_buf()).expect("writer");

    writer
        .log_entry(
            DiagnosticEntry::new(DiagnosticKind::TurnEnded)
                .with_session("s1")
                .with_trigger("watchdog_timeout")
                .with_generation(4),
        )
        .expect("log");
    writer
        .log_entry(DiagnosticEntry::new(DiagnosticKind::ReflectionFinished).with_group("g1"))
        .expect("log");

    let path = writer.file_for(Utc::now().date_naive());
    let content = std::fs::read_to_string(&path).expect("read log");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: DiagnosticEntry = serde_json::from_str(lines[0]).expect("parse");
    assert_eq!(first.kind, DiagnosticKind::TurnEnded);
    assert_eq!(first.session_id.as_deref(), Some("s1"));
    assert_eq!(first.trigger.as_deref(), Some("watchdog_timeout"));
    assert_eq!(first.generation, Some(4));

    assert!(lines[1].contains("\"reflection_finished\""));
}

#[test]
fn creates_missing_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("a").join("b");
    let _writer = JsonlDiagnosticWriter::new(nested.clone()).expect("writer");
    assert!(nested.is_dir());
}

#[test]
fn file_name_carries_the_date() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlDiagnosticWriter::new(dir.path().to_path_buf()).expect("writer");
    let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 9).expect("date");
    assert!(writer
        .file_for(date)
        .ends_with("diagnostics-2026-03-09.jsonl"));
}
