//! In-memory state of the live performance session.
//!
//! `SessionState` is exclusively owned by the `RuntimeApplier`; every
//! other stage works from a `SessionSnapshot` taken under the apply lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use riff_protocol::{
    GlobalTarget, PlayerParam, PlayerSnapshot, RuntimePhase, SessionSnapshot, Value,
};

/// Live state of one performer channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerState {
    pub synth: String,
    pub pattern: String,
    pub kwargs: BTreeMap<String, Value>,
    pub params: BTreeMap<PlayerParam, Value>,
    pub last_assign_at: Option<DateTime<Utc>>,
}

impl PlayerState {
    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            synth: self.synth.clone(),
            pattern: self.pattern.clone(),
            kwargs: self.kwargs.clone(),
            params: self.params.clone(),
        }
    }
}

/// The one live performance context. Mutated only via applied patches.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: String,
    pub phase: RuntimePhase,
    pub song_path: Option<String>,
    pub globals: BTreeMap<GlobalTarget, Value>,
    pub players: BTreeMap<String, PlayerState>,
    pub clock_started_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: RuntimePhase::Idle,
            song_path: None,
            globals: BTreeMap::new(),
            players: BTreeMap::new(),
            clock_started_at: None,
        }
    }

    /// Current tempo, if one has been set.
    pub fn tempo(&self) -> Option<f64> {
        self.globals.get(&GlobalTarget::ClockBpm).and_then(Value::as_f64)
    }

    /// Immutable view handed to validators and backends.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            phase: self.phase,
            song_path: self.song_path.clone(),
            tempo: self.tempo(),
            globals: self.globals.clone(),
            players: self
                .players
                .iter()
                .map(|(name, state)| (name.clone(), state.snapshot()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_tempo_and_players() {
        let mut state = SessionState::new("s1");
        state.phase = RuntimePhase::SongLoaded;
        state
            .globals
            .insert(GlobalTarget::ClockBpm, Value::Int(128));
        state.players.insert(
            "p1".to_string(),
            PlayerState {
                synth: "pluck".to_string(),
                pattern: "[0,2,4,7]".to_string(),
                ..PlayerState::default()
            },
        );

        let snap = state.snapshot();
        assert_eq!(snap.tempo, Some(128.0));
        assert_eq!(snap.phase, RuntimePhase::SongLoaded);
        assert_eq!(snap.players["p1"].synth, "pluck");
    }
}
