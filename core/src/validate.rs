//! Batch validation against the closed safety tables.
//!
//! Validation is all-or-nothing: a batch with any violation is rejected
//! whole, and every violation found is reported (no early exit). The
//! range tables below are the complete, closed contract; no config or
//! runtime state can widen them.

use riff_protocol::{
    Command, GlobalTarget, KNOWN_OPS, MAX_PATCH_COMMANDS, PlayerParam, RuntimePhase,
    SessionSnapshot, ValidationReport, Value, Violation, ViolationBucket, is_allowed_player,
};
use serde_json::Value as Json;
use std::collections::BTreeSet;

const MAX_TEXT_GLOBAL_LEN: usize = 32;
const MAX_SYNTH_LEN: usize = 32;
const MAX_PATTERN_LEN: usize = 256;

/// Inclusive safe range for a numeric player parameter.
pub fn param_range(param: PlayerParam) -> (f64, f64) {
    match param {
        PlayerParam::Amp => (0.0, 1.5),
        PlayerParam::Dur => (0.0625, 16.0),
        PlayerParam::Sus => (0.0, 32.0),
        PlayerParam::Oct => (0.0, 9.0),
        PlayerParam::Lpf => (20.0, 20_000.0),
        PlayerParam::Hpf => (0.0, 20_000.0),
        PlayerParam::Pan => (-1.0, 1.0),
        PlayerParam::Room
        | PlayerParam::Mix
        | PlayerParam::Blur
        | PlayerParam::Drive
        | PlayerParam::Shape => (0.0, 1.0),
        PlayerParam::Echo | PlayerParam::Delay | PlayerParam::Spin => (0.0, 4.0),
        PlayerParam::Chop | PlayerParam::Coarse => (0.0, 32.0),
        PlayerParam::Sample => (0.0, 64.0),
        PlayerParam::Rate => (-4.0, 4.0),
        PlayerParam::Detune => (-12.0, 12.0),
        PlayerParam::Formant => (0.0, 12.0),
    }
}

/// Inclusive safe tempo range for `Clock.bpm`.
pub const BPM_RANGE: (f64, f64) = (50.0, 220.0);

/// Validate a normalized batch against the snapshot taken under the
/// apply lock. Returns every command that decoded, plus the report; the
/// decoded commands are only meaningful when the report is valid.
pub fn validate(raw: &[Json], snapshot: &SessionSnapshot) -> (Vec<Command>, ValidationReport) {
    let mut violations = Vec::new();

    if raw.is_empty() {
        violations.push(Violation::new(
            ViolationBucket::Schema,
            "command batch is empty",
        ));
    }
    if raw.len() > MAX_PATCH_COMMANDS {
        violations.push(Violation::new(
            ViolationBucket::Schema,
            format!(
                "command batch has {} commands, limit is {MAX_PATCH_COMMANDS}",
                raw.len()
            ),
        ));
    }

    // Players assigned earlier in this same batch count as active for
    // later commands: an assign-then-set batch is coherent on its own.
    let mut assigned_in_batch: BTreeSet<String> = BTreeSet::new();
    let mut commands = Vec::new();

    for (idx, item) in raw.iter().enumerate() {
        let position = idx + 1;
        let Some(obj) = item.as_object() else {
            violations.push(Violation::new(
                ViolationBucket::Schema,
                format!("command {position}: not a JSON object"),
            ));
            continue;
        };
        match obj.get("op").and_then(Json::as_str) {
            None => {
                violations.push(Violation::new(
                    ViolationBucket::UnsupportedOp,
                    format!("command {position}: missing 'op' field"),
                ));
                continue;
            }
            Some(op) if !KNOWN_OPS.contains(&op) => {
                violations.push(Violation::new(
                    ViolationBucket::UnsupportedOp,
                    format!("command {position}: unknown op '{op}'"),
                ));
                continue;
            }
            Some(_) => {}
        }

        let command: Command = match serde_json::from_value(item.clone()) {
            Ok(command) => command,
            Err(err) => {
                violations.push(Violation::new(
                    ViolationBucket::Schema,
                    format!("command {position}: {err}"),
                ));
                continue;
            }
        };

        check_phase(&command, position, snapshot.phase, &mut violations);
        check_players(
            &command,
            position,
            snapshot,
            &mut assigned_in_batch,
            &mut violations,
        );
        check_content(&command, position, &mut violations);
        commands.push(command);
    }

    let report = if violations.is_empty() {
        ValidationReport::ok()
    } else {
        ValidationReport::failed(violations)
    };
    (commands, report)
}

fn check_phase(
    command: &Command,
    position: usize,
    phase: RuntimePhase,
    violations: &mut Vec<Violation>,
) {
    match phase {
        RuntimePhase::Idle => violations.push(Violation::new(
            ViolationBucket::RuntimeIncompatible,
            format!(
                "command {position}: runtime is not booted, cannot apply {}",
                command.op()
            ),
        )),
        RuntimePhase::Booted if command.player().is_some() => {
            violations.push(Violation::new(
                ViolationBucket::RuntimeIncompatible,
                format!(
                    "command {position}: no song loaded, player ops are unavailable"
                ),
            ));
        }
        RuntimePhase::Booted | RuntimePhase::SongLoaded => {}
    }
}

fn check_players(
    command: &Command,
    position: usize,
    snapshot: &SessionSnapshot,
    assigned_in_batch: &mut BTreeSet<String>,
    violations: &mut Vec<Violation>,
) {
    let Some(player) = command.player() else {
        return;
    };
    if !is_allowed_player(player) {
        violations.push(Violation::new(
            ViolationBucket::Schema,
            format!("command {position}: '{player}' is not a known player name"),
        ));
        return;
    }
    match command {
        Command::PlayerAssign { .. } => {
            assigned_in_batch.insert(player.to_string());
        }
        Command::PlayerSet { .. } | Command::PlayerStop { .. } => {
            let active = snapshot.players.contains_key(player)
                || assigned_in_batch.contains(player);
            if !active && snapshot.phase == RuntimePhase::SongLoaded {
                violations.push(Violation::new(
                    ViolationBucket::RuntimeIncompatible,
                    format!("command {position}: player '{player}' is not active"),
                ));
            }
        }
        _ => {}
    }
}

fn check_content(command: &Command, position: usize, violations: &mut Vec<Violation>) {
    match command {
        Command::SetGlobal { target, value } => match target {
            GlobalTarget::ClockBpm => {
                check_numeric_range(
                    "Clock.bpm",
                    value,
                    BPM_RANGE,
                    position,
                    violations,
                );
            }
            GlobalTarget::ScaleDefault | GlobalTarget::RootDefault => match value {
                Value::Text(text) if text.is_empty() || text.len() > MAX_TEXT_GLOBAL_LEN => {
                    violations.push(Violation::new(
                        ViolationBucket::Schema,
                        format!(
                            "command {position}: {target} text must be 1..={MAX_TEXT_GLOBAL_LEN} chars"
                        ),
                    ));
                }
                Value::Bool(_) => violations.push(Violation::new(
                    ViolationBucket::Schema,
                    format!("command {position}: {target} cannot be a boolean"),
                )),
                _ => {}
            },
        },
        Command::PlayerAssign {
            synth,
            pattern,
            kwargs,
            ..
        } => {
            if synth.is_empty() || synth.len() > MAX_SYNTH_LEN {
                violations.push(Violation::new(
                    ViolationBucket::Schema,
                    format!("command {position}: synth name must be 1..={MAX_SYNTH_LEN} chars"),
                ));
            }
            if pattern.is_empty() || pattern.len() > MAX_PATTERN_LEN {
                violations.push(Violation::new(
                    ViolationBucket::Schema,
                    format!(
                        "command {position}: pattern must be 1..={MAX_PATTERN_LEN} chars"
                    ),
                ));
            }
            for (key, value) in kwargs {
                match serde_json::from_value::<PlayerParam>(Json::String(key.clone())) {
                    Ok(param) => check_numeric_range(
                        key,
                        value,
                        param_range(param),
                        position,
                        violations,
                    ),
                    Err(_) => violations.push(Violation::new(
                        ViolationBucket::Schema,
                        format!("command {position}: unknown kwarg '{key}'"),
                    )),
                }
            }
        }
        Command::PlayerSet { param, value, .. } => {
            check_numeric_range(
                param.as_str(),
                value,
                param_range(*param),
                position,
                violations,
            );
        }
        Command::PlayerStop { .. } | Command::ClockClear => {}
    }
}

fn check_numeric_range(
    name: &str,
    value: &Value,
    (min, max): (f64, f64),
    position: usize,
    violations: &mut Vec<Violation>,
) {
    match value.as_f64() {
        None => violations.push(Violation::new(
            ViolationBucket::Range,
            format!("command {position}: {name} requires a numeric value"),
        )),
        Some(n) if !n.is_finite() || !(min..=max).contains(&n) => {
            violations.push(Violation::new(
                ViolationBucket::Range,
                format!("command {position}: {name}={n} outside safe range {min}..={max}"),
            ));
        }
        Some(_) => {}
    }
}
