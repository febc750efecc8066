//! Command extraction from model output.
//!
//! Backends return prose-wrapped JSON more often than clean JSON. The
//! cascade tries progressively looser strategies, each with a fixed
//! confidence: direct parse, fenced code block, then a depth-aware scan
//! for the first balanced JSON payload in the text.

use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("model output was empty")]
    Empty,

    #[error("no JSON payload found in model output")]
    NoJson,

    #[error("JSON payload does not contain a command list")]
    NotCommands,
}

/// How the payload was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    DirectParse,
    MarkdownFence,
    DepthScan,
}

impl ExtractionMethod {
    pub fn confidence(&self) -> f32 {
        match self {
            ExtractionMethod::DirectParse => 0.95,
            ExtractionMethod::MarkdownFence => 0.90,
            ExtractionMethod::DepthScan => 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub commands: Vec<Json>,
    pub method: ExtractionMethod,
}

impl Extraction {
    pub fn confidence(&self) -> f32 {
        self.method.confidence()
    }
}

/// Pull a command list out of raw model output.
pub fn extract_commands(text: &str) -> Result<Extraction, ExtractError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::Empty);
    }

    if let Ok(value) = serde_json::from_str::<Json>(trimmed) {
        return commands_from(value)
            .map(|commands| Extraction {
                commands,
                method: ExtractionMethod::DirectParse,
            })
            .ok_or(ExtractError::NotCommands);
    }

    if let Some(block) = fenced_block(trimmed)
        && let Ok(value) = serde_json::from_str::<Json>(block)
        && let Some(commands) = commands_from(value)
    {
        return Ok(Extraction {
            commands,
            method: ExtractionMethod::MarkdownFence,
        });
    }

    for candidate in balanced_candidates(trimmed) {
        if let Ok(value) = serde_json::from_str::<Json>(&candidate)
            && let Some(commands) = commands_from(value)
        {
            return Ok(Extraction {
                commands,
                method: ExtractionMethod::DepthScan,
            });
        }
    }

    Err(ExtractError::NoJson)
}

/// Accept either a bare array of commands or `{"commands": [...]}`.
fn commands_from(value: Json) -> Option<Vec<Json>> {
    let items = match value {
        Json::Array(items) => items,
        Json::Object(mut obj) => match obj.remove("commands") {
            Some(Json::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    items.iter().all(Json::is_object).then_some(items)
}

/// Contents of the first fenced code block, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Balanced `[...]` or `{...}` spans in order of appearance, respecting
/// string literals and escapes.
fn balanced_candidates(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let open = bytes[i];
        if open != b'[' && open != b'{' {
            i += 1;
            continue;
        }
        let close = if open == b'[' { b']' } else { b'}' };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (j, &b) in bytes.iter().enumerate().skip(i) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                _ if b == open => depth += 1,
                _ if b == close => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                candidates.push(text[i..=end].to_string());
                i = end + 1;
            }
            None => i += 1,
        }
    }
    candidates
}
