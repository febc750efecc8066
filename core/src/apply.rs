//! Atomic application of validated batches to the live session.
//!
//! All session mutation happens here, behind one async mutex. A batch
//! either applies completely or leaves the session exactly as it was:
//! on a mid-batch runtime failure the in-memory state is restored from
//! the pre-batch clone and the already-executed instructions are
//! compensated on the runtime, newest first.
//!
//! The revert batch is computed from the state each command observes as
//! it applies, then reversed, so replaying it walks the session back to
//! the pre-patch state one inverse at a time.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use riff_protocol::{ApplyStatus, Command, RevertBatch, RuntimePhase, SessionSnapshot, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::emit;
use crate::runtime::LiveRuntime;
use crate::session::{PlayerState, SessionState};

/// What applying one batch did.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    pub revert: RevertBatch,
    pub latency_ms: u64,
}

/// Sole owner of the mutable `SessionState`.
pub struct RuntimeApplier {
    state: Mutex<SessionState>,
    runtime: Arc<dyn LiveRuntime>,
}

impl RuntimeApplier {
    pub fn new(state: SessionState, runtime: Arc<dyn LiveRuntime>) -> Self {
        Self {
            state: Mutex::new(state),
            runtime,
        }
    }

    /// Point-in-time view for validators and backends.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn mark_booted(&self) {
        let mut state = self.state.lock().await;
        if state.phase == RuntimePhase::Idle {
            state.phase = RuntimePhase::Booted;
        }
    }

    /// Record a loaded song and seed the state it establishes.
    pub async fn mark_song_loaded(
        &self,
        path: &str,
        globals: std::collections::BTreeMap<riff_protocol::GlobalTarget, Value>,
        players: std::collections::BTreeMap<String, PlayerState>,
    ) {
        let mut state = self.state.lock().await;
        state.phase = RuntimePhase::SongLoaded;
        state.song_path = Some(path.to_string());
        state.globals.extend(globals);
        state.players.extend(players);
        state.clock_started_at = Some(Utc::now());
    }

    /// Apply a validated batch. Infallible by contract: runtime failures
    /// come back as `ApplyStatus::Failed` with the session unchanged.
    pub async fn apply(&self, commands: &[Command]) -> ApplyOutcome {
        let start = Instant::now();
        let mut state = self.state.lock().await;
        let saved = state.clone();

        let mut inverses: Vec<Command> = Vec::new();
        let mut irreversible: Option<String> = None;

        for (idx, command) in commands.iter().enumerate() {
            let instruction = emit::instruction(command);
            if let Err(err) = self.runtime.apply(&instruction).await {
                warn!(
                    command = command.op(),
                    position = idx + 1,
                    %err,
                    "batch apply failed, rolling back"
                );
                // Compensate the runtime for what already executed,
                // newest first; the session state is simply restored.
                for inverse in inverses.iter().rev() {
                    if let Err(err) = self.runtime.apply(&emit::instruction(inverse)).await {
                        warn!(%err, "compensation instruction failed");
                    }
                }
                *state = saved;
                return ApplyOutcome {
                    status: ApplyStatus::Failed,
                    revert: RevertBatch::Unavailable {
                        reason: format!("runtime rejected command {}: {err}", idx + 1),
                    },
                    latency_ms: start.elapsed().as_millis() as u64,
                };
            }
            debug!(line = %emit::render(&instruction), "applied");
            match apply_to_state(&mut state, command) {
                Inverse::Command(inverse) => inverses.push(inverse),
                Inverse::None => {}
                Inverse::Irreversible(reason) => irreversible = Some(reason.to_string()),
            }
        }

        inverses.reverse();
        let revert = match irreversible {
            Some(reason) => RevertBatch::Unavailable { reason },
            None => RevertBatch::Commands { commands: inverses },
        };
        ApplyOutcome {
            status: ApplyStatus::Applied,
            revert,
            latency_ms: start.elapsed().as_millis() as u64,
        }
    }
}

enum Inverse {
    Command(Command),
    /// The command changed nothing a revert could restore.
    None,
    Irreversible(&'static str),
}

/// Mutate the session for one command and produce its inverse, based on
/// the state the command is about to overwrite.
fn apply_to_state(state: &mut SessionState, command: &Command) -> Inverse {
    match command {
        Command::SetGlobal { target, value } => {
            let previous = state.globals.insert(*target, value.clone());
            match previous {
                Some(previous) => Inverse::Command(Command::SetGlobal {
                    target: *target,
                    value: previous,
                }),
                None => Inverse::None,
            }
        }
        Command::PlayerAssign {
            player,
            synth,
            pattern,
            kwargs,
        } => {
            let previous = state.players.insert(
                player.clone(),
                PlayerState {
                    synth: synth.clone(),
                    pattern: pattern.clone(),
                    kwargs: kwargs.clone(),
                    params: Default::default(),
                    last_assign_at: Some(Utc::now()),
                },
            );
            match previous {
                Some(previous) => Inverse::Command(Command::PlayerAssign {
                    player: player.clone(),
                    synth: previous.synth,
                    pattern: previous.pattern,
                    kwargs: previous.kwargs,
                }),
                None => Inverse::Command(Command::PlayerStop {
                    player: player.clone(),
                }),
            }
        }
        Command::PlayerSet {
            player,
            param,
            value,
        } => {
            let entry = state.players.entry(player.clone()).or_default();
            match entry.params.insert(*param, value.clone()) {
                Some(previous) => Inverse::Command(Command::PlayerSet {
                    player: player.clone(),
                    param: *param,
                    value: previous,
                }),
                None => Inverse::None,
            }
        }
        Command::PlayerStop { player } => match state.players.remove(player) {
            Some(previous) => Inverse::Command(Command::PlayerAssign {
                player: player.clone(),
                synth: previous.synth,
                pattern: previous.pattern,
                kwargs: previous.kwargs,
            }),
            None => Inverse::None,
        },
        Command::ClockClear => {
            state.players.clear();
            state.clock_started_at = None;
            Inverse::Irreversible("clock_clear discards transport and player state")
        }
    }
}
