//! Deterministic offline backend.
//!
//! Terminal link in every chain: no network, no subprocess, always
//! answers. In normal mode it maps a handful of common phrasings to
//! conservative command batches; in repair mode it clamps the failed
//! batch back inside the safety tables. Anything it cannot interpret
//! gets a safe default assignment rather than an error.

use async_trait::async_trait;
use riff_protocol::PlayerParam;
use serde_json::{Value as Json, json};

use crate::validate::{BPM_RANGE, param_range};

use super::{BackendError, BackendReply, CommandBackend, GenerateRequest, extract_commands};

pub const FALLBACK_MODEL: &str = "fallback-local";

#[derive(Default)]
pub struct FallbackBackend;

impl FallbackBackend {
    pub fn new() -> Self {
        Self
    }

    fn repair(failed: &[Json]) -> Vec<Json> {
        failed.iter().map(clamp_command).collect()
    }

    fn interpret(prompt: &str) -> Vec<Json> {
        // The prompt may itself contain a JSON batch (e.g. pasted into a
        // sentence); honor it verbatim.
        if let Ok(extraction) = extract_commands(prompt)
            && !extraction.commands.is_empty()
        {
            return extraction.commands;
        }

        let lower = prompt.to_lowercase();
        if lower.contains("stop") || lower.contains("pause") || lower.contains("silence") {
            return vec![json!({"op": "clock_clear"})];
        }
        if let Some(bpm) = first_number(&lower)
            && lower.contains("bpm")
        {
            let bpm = bpm.clamp(BPM_RANGE.0, BPM_RANGE.1);
            return vec![json!({"op": "set_global", "target": "Clock.bpm", "value": bpm})];
        }
        if lower.contains("slower") {
            return vec![json!({"op": "set_global", "target": "Clock.bpm", "value": 108})];
        }
        if lower.contains("faster") {
            return vec![json!({"op": "set_global", "target": "Clock.bpm", "value": 132})];
        }
        if lower.contains("dark") {
            return vec![
                json!({"op": "player_set", "player": "p1", "param": "lpf", "value": 1300}),
                json!({"op": "player_set", "player": "p1", "param": "amp", "value": 0.55}),
            ];
        }
        // Safe default: a quiet melodic line on p1.
        vec![json!({
            "op": "player_assign",
            "player": "p1",
            "synth": "pluck",
            "pattern": "[0, 2, 4, 7]",
            "kwargs": {"amp": 0.7, "dur": 0.25}
        })]
    }
}

/// Clamp one failed command back inside the safety tables.
fn clamp_command(command: &Json) -> Json {
    let mut fixed = command.clone();
    let Some(obj) = fixed.as_object_mut() else {
        return fixed;
    };
    match obj.get("op").and_then(Json::as_str) {
        Some("set_global") => {
            if obj.get("target").and_then(Json::as_str) == Some("Clock.bpm")
                && let Some(value) = obj.get("value")
                && let Some(clamped) = clamp_number(value, BPM_RANGE)
            {
                obj.insert("value".to_string(), clamped);
            }
        }
        Some("player_set") => {
            if let Some(param) = obj
                .get("param")
                .cloned()
                .and_then(|p| serde_json::from_value::<PlayerParam>(p).ok())
                && let Some(value) = obj.get("value")
                && let Some(clamped) = clamp_number(value, param_range(param))
            {
                obj.insert("value".to_string(), clamped);
            }
        }
        Some("player_assign") => {
            if let Some(kwargs) = obj.get_mut("kwargs").and_then(Json::as_object_mut) {
                let keys: Vec<String> = kwargs.keys().cloned().collect();
                for key in keys {
                    let Ok(param) =
                        serde_json::from_value::<PlayerParam>(Json::String(key.clone()))
                    else {
                        // Unknown kwargs can never validate; drop them.
                        kwargs.remove(&key);
                        continue;
                    };
                    if let Some(value) = kwargs.get(&key)
                        && let Some(clamped) = clamp_number(value, param_range(param))
                    {
                        kwargs.insert(key, clamped);
                    }
                }
            }
        }
        _ => {}
    }
    fixed
}

/// Clamp a numeric JSON value into `(min, max)`. Non-numeric values are
/// replaced with the range midpoint so the repaired batch can validate.
fn clamp_number(value: &Json, (min, max): (f64, f64)) -> Option<Json> {
    let n = match value.as_f64() {
        Some(n) if n.is_finite() => n.clamp(min, max),
        _ => (min + max) / 2.0,
    };
    if value.as_f64() == Some(n) {
        return None;
    }
    serde_json::Number::from_f64(n).map(Json::Number)
}

fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty()) {
            current.push(c);
        } else if !current.is_empty() {
            break;
        }
    }
    current.parse().ok()
}

#[async_trait]
impl CommandBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        FALLBACK_MODEL
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        let commands = match &request.failure {
            Some(failure) => Self::repair(&failure.failed_commands),
            None => Self::interpret(&request.prompt),
        };
        Ok(BackendReply {
            commands,
            model: FALLBACK_MODEL.to_string(),
            confidence: 0.6,
        })
    }
}
