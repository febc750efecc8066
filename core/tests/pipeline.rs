//! End-to-end pipeline tests over a full `LiveSession` with the
//! null runtime and the deterministic fallback backend.

use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use riff_core::runtime::NullRuntime;
use riff_core::{BackendKind, Config, LiveSession, RiffError};
use riff_protocol::{ApplyStatus, FailedTurn, Intent, TurnOutcome, ViolationBucket};

struct Harness {
    session: LiveSession,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let song = dir.path().join("set.py");
    std::fs::write(&song, "# warmup set\n").unwrap();
    std::fs::write(
        dir.path().join("set.json"),
        r#"{
            "globals": {"Clock.bpm": 120, "Scale.default": "minor"},
            "players": {
                "p1": {"synth": "pluck", "pattern": "[0, 2, 4, 7]"},
                "d1": {"synth": "play", "pattern": "x-o-"}
            }
        }"#,
    )
    .unwrap();

    let config = Config {
        backend: BackendKind::Fallback,
        store_path: Some(dir.path().join("riff.sqlite")),
        ..Config::default()
    };
    let runtime = Arc::new(NullRuntime::new());
    let session = LiveSession::new(&config, runtime).unwrap();
    session.boot().await.unwrap();
    session.load_song(&song).await.unwrap();
    Harness { session, _dir: dir }
}

fn failed_turn_from(prompt: &str, outcome: &TurnOutcome) -> FailedTurn {
    FailedTurn {
        prompt: prompt.to_string(),
        intent: Intent::Edit,
        commands: outcome.effective_commands.clone(),
        violations: outcome.validation.violations.clone(),
    }
}

#[tokio::test]
async fn set_bpm_prompt_lands_as_a_transport_command() {
    let h = harness().await;
    let outcome = h
        .session
        .submit_turn("Set bpm to 140", Intent::Edit)
        .await
        .unwrap();

    assert_eq!(outcome.apply_status, ApplyStatus::Applied);
    assert_eq!(outcome.emitted, vec!["Clock.bpm = 140".to_string()]);
    assert_eq!(h.session.snapshot().await.tempo, Some(140.0));
    assert!(outcome.revert.is_some());
}

#[tokio::test]
async fn out_of_range_amp_is_rejected_then_repaired() {
    let h = harness().await;
    let prompt = r#"[{"op": "player_set", "player": "p1", "param": "amp", "value": 5.0}]"#;
    let outcome = h.session.submit_turn(prompt, Intent::Edit).await.unwrap();

    assert_eq!(outcome.apply_status, ApplyStatus::Skipped);
    assert_eq!(
        outcome.validation.violations[0].bucket,
        ViolationBucket::Range
    );

    let proposal = h
        .session
        .troubleshoot(&failed_turn_from(prompt, &outcome))
        .await
        .unwrap();
    assert!(proposal.confidence < 1.0);
    assert!(proposal.reason.contains("amp"));
    assert_eq!(proposal.budget.used, 1);

    // Applying the proposal is an explicit new turn, and it validates.
    let resubmit = serde_json::to_string(&proposal.fixed_commands).unwrap();
    let fixed = h.session.submit_turn(&resubmit, Intent::Edit).await.unwrap();
    assert_eq!(fixed.apply_status, ApplyStatus::Applied);
    let snapshot = h.session.snapshot().await;
    let amp = snapshot.players["p1"].params[&riff_protocol::PlayerParam::Amp]
        .as_f64()
        .unwrap();
    assert!((0.0..=1.5).contains(&amp));
}

#[tokio::test]
async fn troubleshoot_budget_is_monotonic_and_hard() {
    let h = harness().await;
    let prompt = r#"[{"op": "player_set", "player": "p1", "param": "amp", "value": 5.0}]"#;
    let outcome = h.session.submit_turn(prompt, Intent::Edit).await.unwrap();
    let failed = failed_turn_from(prompt, &outcome);

    for expected in 1..=3u32 {
        let proposal = h.session.troubleshoot(&failed).await.unwrap();
        assert_eq!(proposal.budget.used, expected);
    }
    // The fallback backend is still perfectly available; the fourth
    // attempt is refused on budget alone.
    match h.session.troubleshoot(&failed).await {
        Err(RiffError::BudgetExhausted { used, limit }) => assert_eq!((used, limit), (3, 3)),
        other => panic!("expected BudgetExhausted, got {other:?}"),
    }
    assert_eq!(h.session.budget().unwrap().remaining(), 0);
}

#[tokio::test]
async fn undo_walks_back_exactly_one_patch() {
    let h = harness().await;
    for bpm in [130, 150] {
        let turn = format!(r#"[{{"op": "set_global", "target": "Clock.bpm", "value": {bpm}}}]"#);
        h.session.submit_turn(&turn, Intent::Edit).await.unwrap();
    }
    assert_eq!(h.session.snapshot().await.tempo, Some(150.0));

    let undo = h.session.undo().await.unwrap();
    assert_eq!(h.session.snapshot().await.tempo, Some(130.0));
    assert_eq!(undo.emitted, vec!["Clock.bpm = 130".to_string()]);

    // Second undo targets the earlier patch, not the undo itself.
    h.session.undo().await.unwrap();
    assert_eq!(h.session.snapshot().await.tempo, Some(120.0));

    match h.session.undo().await {
        Err(RiffError::NothingToUndo) => {}
        other => panic!("expected NothingToUndo, got {other:?}"),
    }
}

#[tokio::test]
async fn clock_clear_turn_is_applied_but_not_undoable() {
    let h = harness().await;
    h.session
        .submit_turn(r#"[{"op": "clock_clear"}]"#, Intent::Edit)
        .await
        .unwrap();
    assert!(h.session.snapshot().await.players.is_empty());

    match h.session.undo().await {
        Err(RiffError::NothingToUndo) => {}
        other => panic!("expected NothingToUndo, got {other:?}"),
    }
}

#[tokio::test]
async fn normalized_turn_reports_its_repairs() {
    let h = harness().await;
    let outcome = h
        .session
        .submit_turn(
            r#"[{"op": "set_global", "param": "bpm", "val": "140"}]"#,
            Intent::Edit,
        )
        .await
        .unwrap();
    assert_eq!(outcome.apply_status, ApplyStatus::Applied);
    assert!(!outcome.normalization_notes.is_empty());
    assert_eq!(outcome.effective_commands[0]["target"], "Clock.bpm");
    assert_eq!(h.session.snapshot().await.tempo, Some(140.0));
}

#[tokio::test]
async fn events_stream_in_order_across_operations() {
    let h = harness().await;
    let mut rx = h.session.subscribe();

    h.session
        .submit_turn(r#"[{"op": "player_stop", "player": "d1"}]"#, Intent::Edit)
        .await
        .unwrap();
    h.session.undo().await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(second.seq > first.seq);
    assert_eq!(first.source, "patch");
    assert!(first.message.contains("applied"));
    assert!(second.message.contains("undone"));
}

#[tokio::test]
async fn stopping_an_unknown_player_is_runtime_incompatible() {
    let h = harness().await;
    let outcome = h
        .session
        .submit_turn(r#"[{"op": "player_stop", "player": "n3"}]"#, Intent::Edit)
        .await
        .unwrap();
    assert_eq!(outcome.apply_status, ApplyStatus::Skipped);
    assert_eq!(
        outcome.validation.violations[0].bucket,
        ViolationBucket::RuntimeIncompatible
    );
}

#[tokio::test]
async fn turns_are_rejected_before_boot() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backend: BackendKind::Fallback,
        store_path: Some(dir.path().join("riff.sqlite")),
        ..Config::default()
    };
    let session = LiveSession::new(&config, Arc::new(NullRuntime::new())).unwrap();

    let outcome = session
        .submit_turn(r#"[{"op": "clock_clear"}]"#, Intent::Edit)
        .await
        .unwrap();
    assert_eq!(outcome.apply_status, ApplyStatus::Skipped);
    assert_eq!(
        outcome.validation.violations[0].bucket,
        ViolationBucket::RuntimeIncompatible
    );
}

#[tokio::test]
async fn missing_song_file_errors_cleanly() {
    let h = harness().await;
    let missing = PathBuf::from("/definitely/not/here.py");
    assert!(matches!(
        h.session.load_song(&missing).await,
        Err(RiffError::SongNotFound { .. })
    ));
}
