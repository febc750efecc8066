//! Wire and data types shared across the riff workspace.
//!
//! Everything the pipeline exchanges with its collaborators lives here:
//! the command vocabulary, validation/apply reports, session snapshots,
//! events, and the payloads of the boundary operations (turn, undo,
//! troubleshoot). The command set is closed by construction: an op that
//! is not a `Command` variant cannot reach the runtime.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of commands accepted in a single patch.
pub const MAX_PATCH_COMMANDS: usize = 12;

/// What the performer is trying to do with a turn. Forwarded to the
/// generative backend as a hint; never changes pipeline behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Edit,
    NewScene,
    MixFix,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Edit => "edit",
            Intent::NewScene => "new_scene",
            Intent::MixFix => "mix_fix",
        }
    }
}

/// Global runtime attributes a `set_global` command may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GlobalTarget {
    #[serde(rename = "Clock.bpm")]
    ClockBpm,
    #[serde(rename = "Scale.default")]
    ScaleDefault,
    #[serde(rename = "Root.default")]
    RootDefault,
}

impl GlobalTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalTarget::ClockBpm => "Clock.bpm",
            GlobalTarget::ScaleDefault => "Scale.default",
            GlobalTarget::RootDefault => "Root.default",
        }
    }
}

impl fmt::Display for GlobalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of per-player parameters a `player_set` command may touch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlayerParam {
    Amp,
    Dur,
    Sus,
    Oct,
    Lpf,
    Hpf,
    Pan,
    Room,
    Mix,
    Echo,
    Delay,
    Chop,
    Sample,
    Rate,
    Detune,
    Drive,
    Shape,
    Blur,
    Formant,
    Coarse,
    Spin,
}

impl PlayerParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerParam::Amp => "amp",
            PlayerParam::Dur => "dur",
            PlayerParam::Sus => "sus",
            PlayerParam::Oct => "oct",
            PlayerParam::Lpf => "lpf",
            PlayerParam::Hpf => "hpf",
            PlayerParam::Pan => "pan",
            PlayerParam::Room => "room",
            PlayerParam::Mix => "mix",
            PlayerParam::Echo => "echo",
            PlayerParam::Delay => "delay",
            PlayerParam::Chop => "chop",
            PlayerParam::Sample => "sample",
            PlayerParam::Rate => "rate",
            PlayerParam::Detune => "detune",
            PlayerParam::Drive => "drive",
            PlayerParam::Shape => "shape",
            PlayerParam::Blur => "blur",
            PlayerParam::Formant => "formant",
            PlayerParam::Coarse => "coarse",
            PlayerParam::Spin => "spin",
        }
    }
}

impl fmt::Display for PlayerParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar command argument. Kept deliberately narrow: numbers, strings
/// and booleans are the only shapes the runtime accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(_) | Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// A single intended mutation of the live session.
///
/// Internally tagged on `op`; the tag values are the wire vocabulary the
/// generative backends are prompted to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    SetGlobal {
        target: GlobalTarget,
        value: Value,
    },
    PlayerAssign {
        player: String,
        synth: String,
        pattern: String,
        #[serde(default)]
        kwargs: BTreeMap<String, Value>,
    },
    PlayerSet {
        player: String,
        param: PlayerParam,
        value: Value,
    },
    PlayerStop {
        player: String,
    },
    ClockClear,
}

impl Command {
    /// The wire name of this command's operation kind.
    pub fn op(&self) -> &'static str {
        match self {
            Command::SetGlobal { .. } => "set_global",
            Command::PlayerAssign { .. } => "player_assign",
            Command::PlayerSet { .. } => "player_set",
            Command::PlayerStop { .. } => "player_stop",
            Command::ClockClear => "clock_clear",
        }
    }

    /// Player this command addresses, if it addresses one.
    pub fn player(&self) -> Option<&str> {
        match self {
            Command::PlayerAssign { player, .. }
            | Command::PlayerSet { player, .. }
            | Command::PlayerStop { player } => Some(player),
            Command::SetGlobal { .. } | Command::ClockClear => None,
        }
    }
}

/// Operation kinds the pipeline knows about. Anything else is rejected
/// outright by the validator.
pub const KNOWN_OPS: &[&str] = &[
    "set_global",
    "player_assign",
    "player_set",
    "player_stop",
    "clock_clear",
];

/// Whether `name` is one of the closed set of performer channels
/// (p1–p8 melodic, b1–b4 bass, d1–d4 drums, n1–n4 noise).
pub fn is_allowed_player(name: &str) -> bool {
    let mut chars = name.chars();
    let (Some(prefix), Some(digit), None) = (chars.next(), chars.next(), chars.next()) else {
        return false;
    };
    let Some(n) = digit.to_digit(10) else {
        return false;
    };
    match prefix {
        'p' => (1..=8).contains(&n),
        'b' | 'd' | 'n' => (1..=4).contains(&n),
        _ => false,
    }
}

/// Cause bucket for a validation violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationBucket {
    Schema,
    Range,
    UnsupportedOp,
    RuntimeIncompatible,
}

/// One human-readable validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub bucket: ViolationBucket,
    pub message: String,
}

impl Violation {
    pub fn new(bucket: ViolationBucket, message: impl Into<String>) -> Self {
        Self {
            bucket,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of validating a command batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            violations: Vec::new(),
        }
    }

    pub fn failed(violations: Vec<Violation>) -> Self {
        Self {
            valid: false,
            violations,
        }
    }

    /// Violation messages in order, for display and repair context.
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.message.clone()).collect()
    }
}

/// Whether an emitted batch reached the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    Skipped,
    Failed,
}

/// The inverse of an applied patch, or the reason one does not exist.
///
/// Once computed the batch is immutable: reverting patch N always targets
/// the state as it was immediately before N, not the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevertBatch {
    Commands { commands: Vec<Command> },
    Unavailable { reason: String },
}

impl RevertBatch {
    pub fn commands(&self) -> Option<&[Command]> {
        match self {
            RevertBatch::Commands { commands } if !commands.is_empty() => Some(commands),
            _ => None,
        }
    }

    pub fn is_reversible(&self) -> bool {
        self.commands().is_some()
    }
}

/// Lifecycle phase of the live runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimePhase {
    #[default]
    Idle,
    Booted,
    SongLoaded,
}

/// Point-in-time view of one performer channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub synth: String,
    pub pattern: String,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    #[serde(default)]
    pub params: BTreeMap<PlayerParam, Value>,
}

/// Immutable view of the live session handed to validators and backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: RuntimePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_path: Option<String>,
    /// Current tempo, if one has been set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
    #[serde(default)]
    pub globals: BTreeMap<GlobalTarget, Value>,
    #[serde(default)]
    pub players: BTreeMap<String, PlayerSnapshot>,
}

/// Severity of a broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A timestamped, per-session sequence-numbered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub source: String,
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One user-initiated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    /// Free text or a literal JSON command list.
    pub input: String,
    #[serde(default)]
    pub intent: Intent,
}

/// Everything a caller learns about a submitted turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub turn_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<i64>,
    /// Which backend (or fast path) produced the commands.
    pub model: String,
    pub latency_ms: u64,
    /// Raw candidate commands, before normalization.
    pub commands: Vec<serde_json::Value>,
    /// Commands after shape repair, i.e. what was actually validated.
    pub effective_commands: Vec<serde_json::Value>,
    #[serde(default)]
    pub normalization_notes: Vec<String>,
    pub validation: ValidationReport,
    pub apply_status: ApplyStatus,
    /// Rendered instruction previews, one per command.
    #[serde(default)]
    pub emitted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertBatch>,
    /// Set when every backend in the chain failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
}

impl TurnOutcome {
    /// True when the caller should edit the prompt or ask for repair.
    pub fn needs_user_input(&self) -> bool {
        self.apply_status != ApplyStatus::Applied
    }
}

/// Troubleshoot budget accounting. `used` is monotonic for the life of
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub used: u32,
    pub limit: u32,
}

impl BudgetStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

/// The failed turn handed to the repair engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTurn {
    pub prompt: String,
    #[serde(default)]
    pub intent: Intent,
    /// The (normalized) commands that failed validation.
    pub commands: Vec<serde_json::Value>,
    pub violations: Vec<Violation>,
}

/// A corrected command list proposed by the repair engine. Never applied
/// automatically; resubmitting it is an explicit new turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairProposal {
    pub fixed_commands: Vec<serde_json::Value>,
    pub model: String,
    /// Always below 1.0: a repaired guess is never certain.
    pub confidence: f32,
    pub reason: String,
    #[serde(default)]
    pub normalization_notes: Vec<String>,
    pub budget: BudgetStatus,
}

/// Result of undoing the most recent reversible patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoOutcome {
    /// The patch whose revert batch was applied.
    pub reverted_patch_id: i64,
    /// The new patch recording the revert application.
    pub patch_id: i64,
    #[serde(default)]
    pub emitted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_wire_shape_round_trips() {
        let raw = r#"{"op":"player_set","player":"p1","param":"lpf","value":1300}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            Command::PlayerSet {
                player: "p1".into(),
                param: PlayerParam::Lpf,
                value: Value::Int(1300),
            }
        );
        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["op"], "player_set");
        assert_eq!(back["param"], "lpf");
    }

    #[test]
    fn set_global_uses_dotted_target_names() {
        let cmd = Command::SetGlobal {
            target: GlobalTarget::ClockBpm,
            value: Value::Int(140),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "set_global");
        assert_eq!(json["target"], "Clock.bpm");
    }

    #[test]
    fn clock_clear_needs_no_fields() {
        let cmd: Command = serde_json::from_str(r#"{"op":"clock_clear"}"#).unwrap();
        assert_eq!(cmd, Command::ClockClear);
    }

    #[test]
    fn unknown_op_fails_decode() {
        let err = serde_json::from_str::<Command>(r#"{"op":"run_shell","cmd":"rm -rf /"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn player_allow_list_is_closed() {
        for name in ["p1", "p8", "b4", "d1", "n4"] {
            assert!(is_allowed_player(name), "{name} should be allowed");
        }
        for name in ["p0", "p9", "b5", "x1", "p12", "", "drums"] {
            assert!(!is_allowed_player(name), "{name} should be rejected");
        }
    }

    #[test]
    fn value_numeric_views() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::Text("x".into()).as_f64(), None);
    }

    #[test]
    fn revert_batch_reversibility() {
        let empty = RevertBatch::Commands { commands: vec![] };
        assert!(!empty.is_reversible());

        let unavailable = RevertBatch::Unavailable {
            reason: "clock_clear discards transport state".into(),
        };
        assert!(!unavailable.is_reversible());

        let some = RevertBatch::Commands {
            commands: vec![Command::PlayerStop {
                player: "p1".into(),
            }],
        };
        assert!(some.is_reversible());
    }

    #[test]
    fn budget_remaining_saturates() {
        let b = BudgetStatus { used: 5, limit: 3 };
        assert_eq!(b.remaining(), 0);
    }
}
