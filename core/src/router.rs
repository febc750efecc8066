//! Input routing: direct JSON batches bypass the generative backends.
//!
//! The check is strict on shape (the whole input must parse as a JSON
//! array of objects) and deliberately loose on content: routing never
//! inspects `op` fields or validates anything. A structurally direct
//! batch with bad commands still takes the direct path and fails in
//! validation, with the violations attributed to the user's own JSON.

/// Where a turn's input goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// The input was a JSON array of objects; these are the raw commands.
    Direct(Vec<serde_json::Value>),
    /// Free text (or anything else): hand the prompt to the backend chain.
    Generative,
}

/// Classify raw user input.
pub fn route(input: &str) -> Route {
    let trimmed = input.trim();
    if !trimmed.starts_with('[') {
        return Route::Generative;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) if items.iter().all(|i| i.is_object()) => {
            Route::Direct(items)
        }
        _ => Route::Generative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_array_of_objects_is_direct() {
        let input = r#"[{"op": "set_global", "target": "Clock.bpm", "value": 140}]"#;
        match route(input) {
            Route::Direct(commands) => {
                assert_eq!(commands.len(), 1);
                assert_eq!(commands[0]["op"], "set_global");
            }
            Route::Generative => panic!("expected direct route"),
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert!(matches!(route("  [{\"op\": \"clock_clear\"}]\n"), Route::Direct(_)));
    }

    #[test]
    fn free_text_is_generative() {
        assert_eq!(route("make it darker"), Route::Generative);
        assert_eq!(route("set bpm to [140]"), Route::Generative);
    }

    #[test]
    fn non_object_elements_are_generative() {
        assert_eq!(route(r#"[1, 2, 3]"#), Route::Generative);
        assert_eq!(route(r#"["set_global"]"#), Route::Generative);
    }

    #[test]
    fn malformed_json_is_generative() {
        assert_eq!(route(r#"[{"op": "set_global""#), Route::Generative);
    }

    #[test]
    fn top_level_object_is_generative() {
        assert_eq!(route(r#"{"op": "clock_clear"}"#), Route::Generative);
    }

    #[test]
    fn empty_array_is_direct() {
        // Shape says direct; the validator rejects empty batches.
        assert_eq!(route("[]"), Route::Direct(vec![]));
    }
}
