//! Structural translation from validated commands to runtime instructions.
//!
//! Emission is total: every `Command` value maps to exactly one
//! instruction, with no validation, no I/O and no failure path. Anything
//! that should not reach the runtime must have been rejected upstream.

use std::collections::BTreeMap;

use riff_protocol::{Command, GlobalTarget, PlayerParam, Value};
use serde::Serialize;

/// One line of work for the live runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeInstruction {
    SetGlobal {
        target: GlobalTarget,
        value: Value,
    },
    AssignPlayer {
        player: String,
        synth: String,
        pattern: String,
        kwargs: BTreeMap<String, Value>,
    },
    SetPlayerParam {
        player: String,
        param: PlayerParam,
        value: Value,
    },
    StopPlayer {
        player: String,
    },
    ClearClock,
}

/// Map a command to its instruction. Total and pure.
pub fn instruction(command: &Command) -> RuntimeInstruction {
    match command {
        Command::SetGlobal { target, value } => RuntimeInstruction::SetGlobal {
            target: *target,
            value: value.clone(),
        },
        Command::PlayerAssign {
            player,
            synth,
            pattern,
            kwargs,
        } => RuntimeInstruction::AssignPlayer {
            player: player.clone(),
            synth: synth.clone(),
            pattern: pattern.clone(),
            kwargs: kwargs.clone(),
        },
        Command::PlayerSet {
            player,
            param,
            value,
        } => RuntimeInstruction::SetPlayerParam {
            player: player.clone(),
            param: *param,
            value: value.clone(),
        },
        Command::PlayerStop { player } => RuntimeInstruction::StopPlayer {
            player: player.clone(),
        },
        Command::ClockClear => RuntimeInstruction::ClearClock,
    }
}

/// Translate a whole validated batch.
pub fn emit(commands: &[Command]) -> Vec<RuntimeInstruction> {
    commands.iter().map(instruction).collect()
}

/// Render an instruction as the single line of interpreter input the
/// runtime executes.
pub fn render(instruction: &RuntimeInstruction) -> String {
    match instruction {
        RuntimeInstruction::SetGlobal { target, value } => {
            format!("{target} = {}", render_value(value))
        }
        RuntimeInstruction::AssignPlayer {
            player,
            synth,
            pattern,
            kwargs,
        } => {
            let mut args = vec![render_pattern(pattern)];
            // BTreeMap keeps kwargs in stable order.
            for (key, value) in kwargs {
                args.push(format!("{key}={}", render_value(value)));
            }
            format!("{player} >> {synth}({})", args.join(", "))
        }
        RuntimeInstruction::SetPlayerParam {
            player,
            param,
            value,
        } => format!("{player}.{param} = {}", render_value(value)),
        RuntimeInstruction::StopPlayer { player } => format!("{player}.stop()"),
        RuntimeInstruction::ClearClock => "Clock.clear()".to_string(),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Text(s) => quote(s),
    }
}

/// A pattern is emitted verbatim only when it is plainly pattern syntax:
/// digits, note arithmetic and grouping. Anything else (letters, quotes,
/// control characters) is emitted as a string literal so free text can
/// never smuggle interpreter statements into the runtime.
fn render_pattern(pattern: &str) -> String {
    let plain = !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| c.is_ascii_digit() || "., +-*/()[]<>".contains(c));
    if plain {
        pattern.to_string()
    } else {
        quote(pattern)
    }
}

pub(crate) fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rendered(command: &Command) -> String {
        render(&instruction(command))
    }

    #[test]
    fn set_global_renders_assignment() {
        let cmd = Command::SetGlobal {
            target: GlobalTarget::ClockBpm,
            value: Value::Int(140),
        };
        assert_eq!(rendered(&cmd), "Clock.bpm = 140");
    }

    #[test]
    fn text_global_is_quoted() {
        let cmd = Command::SetGlobal {
            target: GlobalTarget::ScaleDefault,
            value: Value::Text("minor".into()),
        };
        assert_eq!(rendered(&cmd), "Scale.default = 'minor'");
    }

    #[test]
    fn assign_renders_call_with_sorted_kwargs() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("dur".to_string(), Value::Float(0.25));
        kwargs.insert("amp".to_string(), Value::Float(0.7));
        let cmd = Command::PlayerAssign {
            player: "p1".into(),
            synth: "pluck".into(),
            pattern: "[0, 2, 4, 7]".into(),
            kwargs,
        };
        assert_eq!(rendered(&cmd), "p1 >> pluck([0, 2, 4, 7], amp=0.7, dur=0.25)");
    }

    #[test]
    fn player_set_and_stop_and_clear() {
        assert_eq!(
            rendered(&Command::PlayerSet {
                player: "p1".into(),
                param: PlayerParam::Lpf,
                value: Value::Int(1300),
            }),
            "p1.lpf = 1300"
        );
        assert_eq!(
            rendered(&Command::PlayerStop {
                player: "d2".into()
            }),
            "d2.stop()"
        );
        assert_eq!(rendered(&Command::ClockClear), "Clock.clear()");
    }

    #[test]
    fn pattern_with_letters_is_quoted() {
        let cmd = Command::PlayerAssign {
            player: "p1".into(),
            synth: "play".into(),
            pattern: "x-o-".into(),
            kwargs: BTreeMap::new(),
        };
        assert_eq!(rendered(&cmd), "p1 >> play('x-o-')");
    }

    #[test]
    fn pattern_cannot_smuggle_statements() {
        let cmd = Command::PlayerAssign {
            player: "p1".into(),
            synth: "pluck".into(),
            pattern: "[0]); import os; (".into(),
            kwargs: BTreeMap::new(),
        };
        let line = rendered(&cmd);
        assert!(line.contains("'[0]); import os; ('"));
    }

    #[test]
    fn quoting_escapes_quotes_and_backslashes() {
        let cmd = Command::SetGlobal {
            target: GlobalTarget::RootDefault,
            value: Value::Text("C'\\".into()),
        };
        assert_eq!(rendered(&cmd), "Root.default = 'C\\'\\\\'");
    }

    #[test]
    fn booleans_render_pythonic() {
        let cmd = Command::PlayerSet {
            player: "p1".into(),
            param: PlayerParam::Blur,
            value: Value::Bool(true),
        };
        assert_eq!(rendered(&cmd), "p1.blur = True");
    }
}
