//! The session orchestrator: boundary operations over one live session.
//!
//! `LiveSession` wires the pipeline together (route, generate,
//! normalize, validate, emit, apply) and owns the durable records for
//! every turn. Backend calls happen before the apply-lock is taken;
//! turns and undo serialize on that lock inside the applier, and whole
//! undo operations additionally serialize on the session's undo lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use riff_protocol::{
    ApplyStatus, Command, Event, EventLevel, FailedTurn, GlobalTarget, Intent, RepairProposal,
    RevertBatch, SessionSnapshot, TurnOutcome, TurnRequest, UndoOutcome, ValidationReport, Value,
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::apply::RuntimeApplier;
use crate::backend::{BackendChain, GenerateRequest};
use crate::config::Config;
use crate::emit;
use crate::error::{Result, RiffError};
use crate::events::EventBus;
use crate::normalize;
use crate::router::{self, Route};
use crate::runtime::LiveRuntime;
use crate::session::{PlayerState, SessionState};
use crate::store::Store;
use crate::troubleshoot::RepairEngine;
use crate::validate;

/// Model name recorded for turns that bypassed the backends.
pub const DIRECT_MODEL: &str = "direct-json";

/// State a song file establishes, read from its JSON sidecar.
#[derive(Debug, Default, Deserialize)]
struct SongState {
    #[serde(default)]
    globals: BTreeMap<GlobalTarget, Value>,
    #[serde(default)]
    players: BTreeMap<String, PlayerSeed>,
}

#[derive(Debug, Deserialize)]
struct PlayerSeed {
    synth: String,
    #[serde(default = "default_pattern")]
    pattern: String,
    #[serde(default)]
    kwargs: BTreeMap<String, Value>,
}

fn default_pattern() -> String {
    "[0]".to_string()
}

pub struct LiveSession {
    id: String,
    store: Arc<Store>,
    events: EventBus,
    runtime: Arc<dyn LiveRuntime>,
    applier: RuntimeApplier,
    chain: Arc<BackendChain>,
    repair: RepairEngine,
    /// Serializes whole undo operations: fetching the last reversible
    /// patch, replaying its revert and consuming it must be one critical
    /// section, or two racing undos replay the same revert twice.
    undo_lock: tokio::sync::Mutex<()>,
}

impl LiveSession {
    pub fn new(config: &Config, runtime: Arc<dyn LiveRuntime>) -> Result<Self> {
        let store = Arc::new(match &config.store_path {
            Some(path) => Store::open(path)?,
            None => Store::open_in_memory()?,
        });
        let id = uuid::Uuid::new_v4().to_string();
        store.ensure_session(&id, config.troubleshoot_limit)?;

        let events = EventBus::new(id.clone(), Some(store.clone()));
        runtime.attach_events(events.clone());
        let chain = Arc::new(BackendChain::from_config(config));
        let repair = RepairEngine::new(chain.clone(), store.clone());
        let applier = RuntimeApplier::new(SessionState::new(&id), runtime.clone());

        info!(session = %id, backends = ?chain.names(), "session created");
        Ok(Self {
            id,
            store,
            events,
            runtime,
            applier,
            chain,
            repair,
            undo_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.applier.snapshot().await
    }

    pub fn budget(&self) -> Result<riff_protocol::BudgetStatus> {
        Ok(self.store.budget(&self.id)?)
    }

    /// Boot the live runtime. Idempotent.
    pub async fn boot(&self) -> Result<SessionSnapshot> {
        self.runtime.ensure_running().await?;
        self.applier.mark_booted().await;
        self.events.publish(
            "system",
            EventLevel::Info,
            "session booted",
            serde_json::json!({}),
        );
        Ok(self.applier.snapshot().await)
    }

    /// Execute a song file in the runtime and seed the session with the
    /// state it establishes (from the `<song>.json` sidecar, if present).
    pub async fn load_song(&self, path: &Path) -> Result<SessionSnapshot> {
        if !path.is_file() {
            return Err(RiffError::SongNotFound {
                path: path.display().to_string(),
            });
        }
        self.runtime.load_song(path).await?;

        let sidecar = path.with_extension("json");
        let state: SongState = match std::fs::read_to_string(&sidecar) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => SongState::default(),
        };
        let players = state
            .players
            .into_iter()
            .map(|(name, seed)| {
                (
                    name,
                    PlayerState {
                        synth: seed.synth,
                        pattern: seed.pattern,
                        kwargs: seed.kwargs,
                        ..PlayerState::default()
                    },
                )
            })
            .collect();
        let path_str = path.display().to_string();
        self.applier
            .mark_song_loaded(&path_str, state.globals, players)
            .await;
        self.store.update_session_song(&self.id, &path_str)?;
        self.events.publish(
            "system",
            EventLevel::Info,
            format!("song loaded: {path_str}"),
            serde_json::json!({ "path": path_str }),
        );
        Ok(self.applier.snapshot().await)
    }

    /// Boundary-payload form of [`LiveSession::submit_turn`].
    pub async fn submit(&self, request: &TurnRequest) -> Result<TurnOutcome> {
        self.submit_turn(&request.input, request.intent).await
    }

    /// Run one request through the full pipeline and record it.
    pub async fn submit_turn(&self, input: &str, intent: Intent) -> Result<TurnOutcome> {
        let start = Instant::now();

        let (raw, model) = match router::route(input) {
            Route::Direct(commands) => (commands, DIRECT_MODEL.to_string()),
            Route::Generative => {
                let snapshot = self.applier.snapshot().await;
                let request = GenerateRequest {
                    prompt: input.to_string(),
                    intent,
                    snapshot,
                    failure: None,
                };
                match self.chain.generate(&request).await {
                    Ok(reply) => (reply.commands, reply.model),
                    Err(err) => {
                        return self.record_backend_failure(input, intent, err, start);
                    }
                }
            }
        };

        let (effective, notes) = normalize::normalize(&raw);
        let snapshot = self.applier.snapshot().await;
        let (commands, report) = validate::validate(&effective, &snapshot);

        if !report.valid {
            return self
                .record_rejected(input, intent, &model, raw, effective, notes, report, start);
        }

        let emitted: Vec<String> = emit::emit(&commands).iter().map(emit::render).collect();

        let outcome = self.applier.apply(&commands).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let turn_id = self
            .store
            .create_turn(&self.id, input, intent.as_str(), &model, latency_ms)?;
        let patch_id = self.store.create_patch(
            turn_id,
            &raw,
            &effective,
            &notes,
            &emitted,
            &report,
            outcome.status,
            &outcome.revert,
        )?;

        let (level, message) = match outcome.status {
            ApplyStatus::Applied => (EventLevel::Info, format!("patch {patch_id} applied")),
            _ => (EventLevel::Error, format!("patch {patch_id} failed to apply")),
        };
        self.events.publish(
            "patch",
            level,
            message,
            serde_json::json!({ "turn_id": turn_id, "patch_id": patch_id, "emitted": emitted }),
        );

        Ok(TurnOutcome {
            session_id: self.id.clone(),
            turn_id,
            patch_id: Some(patch_id),
            model,
            latency_ms,
            commands: raw,
            effective_commands: effective,
            normalization_notes: notes,
            validation: report,
            apply_status: outcome.status,
            emitted,
            revert: (outcome.status == ApplyStatus::Applied).then_some(outcome.revert),
            backend_error: None,
        })
    }

    fn record_backend_failure(
        &self,
        input: &str,
        intent: Intent,
        err: crate::backend::BackendError,
        start: Instant,
    ) -> Result<TurnOutcome> {
        let latency_ms = start.elapsed().as_millis() as u64;
        let turn_id = self
            .store
            .create_turn(&self.id, input, intent.as_str(), "none", latency_ms)?;
        self.events.publish(
            "backend",
            EventLevel::Error,
            err.to_string(),
            serde_json::json!({ "turn_id": turn_id }),
        );
        Ok(TurnOutcome {
            session_id: self.id.clone(),
            turn_id,
            patch_id: None,
            model: "none".to_string(),
            latency_ms,
            commands: vec![],
            effective_commands: vec![],
            normalization_notes: vec![],
            validation: ValidationReport::ok(),
            apply_status: ApplyStatus::Skipped,
            emitted: vec![],
            revert: None,
            backend_error: Some(err.to_string()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record_rejected(
        &self,
        input: &str,
        intent: Intent,
        model: &str,
        raw: Vec<serde_json::Value>,
        effective: Vec<serde_json::Value>,
        notes: Vec<String>,
        report: ValidationReport,
        start: Instant,
    ) -> Result<TurnOutcome> {
        let latency_ms = start.elapsed().as_millis() as u64;
        let turn_id = self
            .store
            .create_turn(&self.id, input, intent.as_str(), model, latency_ms)?;
        let patch_id = self.store.create_patch(
            turn_id,
            &raw,
            &effective,
            &notes,
            &[],
            &report,
            ApplyStatus::Skipped,
            &RevertBatch::Commands { commands: vec![] },
        )?;
        self.events.publish(
            "validator",
            EventLevel::Warning,
            format!(
                "patch {patch_id} rejected: {}",
                report.messages().join("; ")
            ),
            serde_json::json!({ "turn_id": turn_id, "patch_id": patch_id }),
        );
        Ok(TurnOutcome {
            session_id: self.id.clone(),
            turn_id,
            patch_id: Some(patch_id),
            model: model.to_string(),
            latency_ms,
            commands: raw,
            effective_commands: effective,
            normalization_notes: notes,
            validation: report,
            apply_status: ApplyStatus::Skipped,
            emitted: vec![],
            revert: None,
            backend_error: None,
        })
    }

    /// Undo the most recent reversible patch. Single-step: the undone
    /// patch is consumed, and the undo itself is not reversible.
    pub async fn undo(&self) -> Result<UndoOutcome> {
        let _undoing = self.undo_lock.lock().await;
        let patch = self
            .store
            .last_reversible_patch(&self.id)?
            .ok_or(RiffError::NothingToUndo)?;
        let commands: Vec<Command> = patch
            .revert
            .commands()
            .ok_or_else(|| RiffError::NotReversible {
                patch_id: patch.id,
                reason: "revert batch is empty".to_string(),
            })?
            .to_vec();

        let outcome = self.applier.apply(&commands).await;
        if outcome.status != ApplyStatus::Applied {
            let reason = match outcome.revert {
                RevertBatch::Unavailable { reason } => reason,
                RevertBatch::Commands { .. } => "runtime rejected the revert".to_string(),
            };
            return Err(RiffError::NotReversible {
                patch_id: patch.id,
                reason,
            });
        }

        let raw: Vec<serde_json::Value> = commands
            .iter()
            .map(|c| serde_json::to_value(c).unwrap_or_default())
            .collect();
        let emitted: Vec<String> = emit::emit(&commands).iter().map(emit::render).collect();

        let turn_id = self.store.create_turn(
            &self.id,
            ":undo",
            Intent::Edit.as_str(),
            "undo",
            outcome.latency_ms,
        )?;
        let new_patch = self.store.create_patch(
            turn_id,
            &raw,
            &raw,
            &[],
            &emitted,
            &ValidationReport::ok(),
            ApplyStatus::Applied,
            &RevertBatch::Unavailable {
                reason: "undo is not itself reversible".to_string(),
            },
        )?;
        self.store.mark_undone(patch.id)?;

        self.events.publish(
            "patch",
            EventLevel::Info,
            format!("patch {} undone", patch.id),
            serde_json::json!({ "reverted_patch_id": patch.id, "patch_id": new_patch }),
        );
        Ok(UndoOutcome {
            reverted_patch_id: patch.id,
            patch_id: new_patch,
            emitted,
        })
    }

    /// Ask the repair engine for a corrected batch. Proposal only.
    pub async fn troubleshoot(&self, failed: &FailedTurn) -> Result<RepairProposal> {
        let snapshot = self.applier.snapshot().await;
        let proposal = self.repair.propose(&self.id, failed, &snapshot).await?;
        self.events.publish(
            "repair",
            EventLevel::Info,
            format!(
                "repair proposed ({}, confidence {:.2})",
                proposal.model, proposal.confidence
            ),
            serde_json::json!({ "budget": proposal.budget }),
        );
        Ok(proposal)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await?;
        self.events.publish(
            "system",
            EventLevel::Info,
            "session shut down",
            serde_json::json!({}),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::runtime::NullRuntime;

    async fn booted_session() -> (LiveSession, Arc<NullRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("set.py");
        std::fs::write(&song, "# song\n").unwrap();
        std::fs::write(
            dir.path().join("set.json"),
            r#"{"globals": {"Clock.bpm": 120}, "players": {"p1": {"synth": "pluck", "pattern": "[0]"}}}"#,
        )
        .unwrap();

        let runtime = Arc::new(NullRuntime::new());
        let config = Config {
            backend: crate::config::BackendKind::Fallback,
            ..Config::default()
        };
        let session = LiveSession::new(&config, runtime.clone()).unwrap();
        session.boot().await.unwrap();
        session.load_song(&song).await.unwrap();
        (session, runtime, dir)
    }

    #[tokio::test]
    async fn direct_turn_applies_and_records() {
        let (session, runtime, _dir) = booted_session().await;
        let outcome = session
            .submit_turn(
                r#"[{"op": "set_global", "target": "Clock.bpm", "value": 140}]"#,
                Intent::Edit,
            )
            .await
            .unwrap();

        assert_eq!(outcome.model, DIRECT_MODEL);
        assert_eq!(outcome.apply_status, ApplyStatus::Applied);
        assert_eq!(outcome.emitted, vec!["Clock.bpm = 140".to_string()]);
        assert!(outcome.patch_id.is_some());
        assert_eq!(session.snapshot().await.tempo, Some(140.0));
        assert!(!runtime.applied().is_empty());
    }

    #[tokio::test]
    async fn invalid_direct_turn_is_skipped_whole() {
        let (session, runtime, _dir) = booted_session().await;
        let applied_before = runtime.applied().len();
        let outcome = session
            .submit_turn(
                r#"[{"op": "set_global", "target": "Clock.bpm", "value": 130},
                    {"op": "player_set", "player": "p1", "param": "amp", "value": 5.0}]"#,
                Intent::Edit,
            )
            .await
            .unwrap();

        assert_eq!(outcome.apply_status, ApplyStatus::Skipped);
        assert!(!outcome.validation.valid);
        assert!(outcome.needs_user_input());
        // Nothing reached the runtime, not even the valid first command.
        assert_eq!(runtime.applied().len(), applied_before);
        assert_eq!(session.snapshot().await.tempo, Some(120.0));
    }

    #[tokio::test]
    async fn generative_turn_reaches_the_fallback() {
        let (session, _runtime, _dir) = booted_session().await;
        let outcome = session
            .submit_turn("set bpm to 140", Intent::Edit)
            .await
            .unwrap();
        assert_eq!(outcome.model, "fallback-local");
        assert_eq!(outcome.apply_status, ApplyStatus::Applied);
        assert_eq!(session.snapshot().await.tempo, Some(140.0));
    }

    #[tokio::test]
    async fn undo_restores_and_is_single_step() {
        let (session, _runtime, _dir) = booted_session().await;
        session
            .submit_turn(
                r#"[{"op": "set_global", "target": "Clock.bpm", "value": 150}]"#,
                Intent::Edit,
            )
            .await
            .unwrap();
        assert_eq!(session.snapshot().await.tempo, Some(150.0));

        let undo = session.undo().await.unwrap();
        assert_eq!(session.snapshot().await.tempo, Some(120.0));
        assert_eq!(undo.emitted, vec!["Clock.bpm = 120".to_string()]);

        // The undo consumed the only reversible patch; its own record is
        // not reversible either.
        match session.undo().await {
            Err(RiffError::NothingToUndo) => {}
            other => panic!("expected NothingToUndo, got {other:?}"),
        }
    }

    /// Holds every instruction long enough for racing callers to overlap.
    struct SlowRuntime {
        inner: NullRuntime,
    }

    #[async_trait::async_trait]
    impl LiveRuntime for SlowRuntime {
        async fn ensure_running(&self) -> std::result::Result<(), crate::runtime::RuntimeError> {
            self.inner.ensure_running().await
        }

        fn is_running(&self) -> bool {
            self.inner.is_running()
        }

        async fn apply(
            &self,
            instruction: &crate::emit::RuntimeInstruction,
        ) -> std::result::Result<(), crate::runtime::RuntimeError> {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            self.inner.apply(instruction).await
        }

        async fn load_song(&self, path: &Path) -> std::result::Result<(), crate::runtime::RuntimeError> {
            self.inner.load_song(path).await
        }

        async fn shutdown(&self) -> std::result::Result<(), crate::runtime::RuntimeError> {
            self.inner.shutdown().await
        }
    }

    #[tokio::test]
    async fn concurrent_undos_consume_the_patch_once() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("set.py");
        std::fs::write(&song, "# song\n").unwrap();
        std::fs::write(
            dir.path().join("set.json"),
            r#"{"globals": {"Clock.bpm": 120}, "players": {}}"#,
        )
        .unwrap();

        let runtime = Arc::new(SlowRuntime {
            inner: NullRuntime::new(),
        });
        let config = Config {
            backend: crate::config::BackendKind::Fallback,
            ..Config::default()
        };
        let session = LiveSession::new(&config, runtime).unwrap();
        session.boot().await.unwrap();
        session.load_song(&song).await.unwrap();
        session
            .submit_turn(
                r#"[{"op": "set_global", "target": "Clock.bpm", "value": 150}]"#,
                Intent::Edit,
            )
            .await
            .unwrap();

        // Both undos race; exactly one may replay the revert batch.
        let (a, b) = tokio::join!(session.undo(), session.undo());
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|r| matches!(r, Err(RiffError::NothingToUndo)))
        );
        assert_eq!(session.snapshot().await.tempo, Some(120.0));
    }

    #[tokio::test]
    async fn song_must_exist() {
        let runtime = Arc::new(NullRuntime::new());
        let session = LiveSession::new(&Config::default(), runtime).unwrap();
        session.boot().await.unwrap();
        match session.load_song(Path::new("/nonexistent/set.py")).await {
            Err(RiffError::SongNotFound { path }) => {
                assert!(path.contains("set.py"));
            }
            other => panic!("expected SongNotFound, got {other:?}"),
        }
    }
}
