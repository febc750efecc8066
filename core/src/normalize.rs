//! Shape repair for raw command batches.
//!
//! Backends (and users typing JSON by hand) produce near-miss shapes:
//! aliased keys, missing `op` fields, numbers as strings, whole player
//! lines packed into one `synth` string. Normalization repairs shape
//! only and records a note for every repair. It never invents intent:
//! a value it cannot confidently rewrite passes through untouched for
//! the validator to judge.
//!
//! Normalization is idempotent: feeding its output back through it
//! yields the same commands and no notes.

use std::collections::HashMap;

use serde_json::{Map, Value as Json};

/// Repair a raw batch. Returns the repaired commands and one note per
/// repair performed, in batch order.
pub fn normalize(raw: &[Json]) -> (Vec<Json>, Vec<String>) {
    let mut notes = Vec::new();
    let mut commands: Vec<Json> = Vec::new();
    // Index into `commands` of the latest assign per player, for folding.
    let mut last_assign: HashMap<String, usize> = HashMap::new();

    for (idx, item) in raw.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            notes.push(format!("command {}: dropped non-object entry", idx + 1));
            continue;
        };

        let mut cmd = obj.clone();
        infer_op(&mut cmd, idx, &mut notes);

        let op = cmd.get("op").and_then(Json::as_str).unwrap_or("").to_string();
        match op.as_str() {
            "set_global" => normalize_set_global(&mut cmd, idx, &mut notes),
            "player_assign" => normalize_player_assign(&mut cmd, idx, &mut notes),
            "player_set" => normalize_player_set(&mut cmd, idx, &mut notes),
            _ => {}
        }

        // Fold a set into an assign for the same player earlier in the
        // batch: the assign has not reached the runtime yet, so the
        // param belongs in its kwargs rather than as a separate line.
        if op == "player_set"
            && let Some(player) = cmd.get("player").and_then(Json::as_str).map(str::to_string)
            && let Some(&assign_idx) = last_assign.get(&player)
            && let (Some(param), Some(value)) = (
                cmd.get("param").and_then(Json::as_str).map(str::to_string),
                cmd.get("value").cloned(),
            )
            && let Some(assign) = commands[assign_idx].as_object_mut()
            && let Some(kwargs) = assign
                .entry("kwargs")
                .or_insert_with(|| Json::Object(Map::new()))
                .as_object_mut()
        {
            kwargs.insert(param.clone(), value);
            notes.push(format!(
                "command {}: folded {player}.{param} into the pending assign",
                idx + 1
            ));
            continue;
        }

        if op == "player_assign"
            && let Some(player) = cmd.get("player").and_then(Json::as_str)
        {
            last_assign.insert(player.to_string(), commands.len());
        }
        commands.push(Json::Object(cmd));
    }

    (commands, notes)
}

/// Fill in a missing `op` from the fields that are present.
fn infer_op(cmd: &mut Map<String, Json>, idx: usize, notes: &mut Vec<String>) {
    if cmd.contains_key("op") {
        return;
    }
    let has = |key: &str| cmd.contains_key(key);
    let inferred = if has("target") || ((has("param") || has("name")) && !has("player")) {
        Some("set_global")
    } else if has("player") && (has("synth") || has("voice")) {
        Some("player_assign")
    } else if has("player") && (has("param") || has("name")) {
        Some("player_set")
    } else if has("player") {
        Some("player_stop")
    } else {
        None
    };
    if let Some(op) = inferred {
        cmd.insert("op".to_string(), Json::String(op.to_string()));
        notes.push(format!("command {}: inferred op '{op}'", idx + 1));
    }
}

fn normalize_set_global(cmd: &mut Map<String, Json>, idx: usize, notes: &mut Vec<String>) {
    rename_key(cmd, "val", "value", idx, notes);
    for alias in ["param", "name"] {
        if !cmd.contains_key("target") {
            rename_key(cmd, alias, "target", idx, notes);
        }
    }
    if let Some(target) = cmd.get("target").and_then(Json::as_str) {
        let canonical = match target.trim().to_ascii_lowercase().as_str() {
            "bpm" | "tempo" | "clock.bpm" => Some("Clock.bpm"),
            "scale" | "scale.default" => Some("Scale.default"),
            "root" | "root.default" => Some("Root.default"),
            _ => None,
        };
        if let Some(canonical) = canonical
            && target != canonical
        {
            notes.push(format!(
                "command {}: canonicalized target '{target}' to '{canonical}'",
                idx + 1
            ));
            cmd.insert("target".to_string(), Json::String(canonical.to_string()));
        }
    }
    // Scale and Root values are names; only the tempo is numeric, so a
    // string like "5" must stay text for the other targets.
    if cmd.get("target").and_then(Json::as_str) == Some("Clock.bpm") {
        coerce_value_field(cmd, "value", idx, notes);
    }
}

fn normalize_player_assign(cmd: &mut Map<String, Json>, idx: usize, notes: &mut Vec<String>) {
    rename_key(cmd, "voice", "synth", idx, notes);
    // A stray string `value` on an assign is the synth by another name.
    if !cmd.contains_key("synth") && cmd.get("value").is_some_and(Json::is_string) {
        rename_key(cmd, "value", "synth", idx, notes);
    }

    // A whole player line packed into the synth string, e.g.
    // "pluck([0,2,4,7], amp=0.7)". Unpack it.
    if let Some(synth) = cmd.get("synth").and_then(Json::as_str)
        && synth.contains('(')
        && let Some(parsed) = parse_call(synth)
    {
        notes.push(format!(
            "command {}: unpacked call syntax in synth field",
            idx + 1
        ));
        cmd.insert("synth".to_string(), Json::String(parsed.synth));
        if let Some(pattern) = parsed.pattern {
            cmd.insert("pattern".to_string(), Json::String(pattern));
        }
        let kwargs = cmd
            .entry("kwargs")
            .or_insert_with(|| Json::Object(Map::new()));
        if let Some(kwargs) = kwargs.as_object_mut() {
            for (key, value) in parsed.kwargs {
                kwargs.entry(key).or_insert(value);
            }
        }
    }

    if !cmd.contains_key("pattern") {
        cmd.insert("pattern".to_string(), Json::String("[0]".to_string()));
        notes.push(format!("command {}: defaulted pattern to [0]", idx + 1));
    }
    if !cmd.contains_key("kwargs") {
        cmd.insert("kwargs".to_string(), Json::Object(Map::new()));
    }
    if let Some(kwargs) = cmd.get_mut("kwargs").and_then(Json::as_object_mut) {
        let keys: Vec<String> = kwargs.keys().cloned().collect();
        for key in keys {
            if let Some(canonical) = param_alias(&key) {
                if let Some(value) = kwargs.remove(&key) {
                    kwargs.insert(canonical.to_string(), value);
                }
                notes.push(format!(
                    "command {}: renamed kwarg '{key}' to '{canonical}'",
                    idx + 1
                ));
            }
        }
        for key in kwargs.keys().cloned().collect::<Vec<_>>() {
            coerce_value_field(kwargs, &key, idx, notes);
        }
    }
}

fn normalize_player_set(cmd: &mut Map<String, Json>, idx: usize, notes: &mut Vec<String>) {
    rename_key(cmd, "name", "param", idx, notes);
    rename_key(cmd, "val", "value", idx, notes);
    if let Some(param) = cmd.get("param").and_then(Json::as_str)
        && let Some(canonical) = param_alias(param)
    {
        notes.push(format!(
            "command {}: renamed param '{param}' to '{canonical}'",
            idx + 1
        ));
        cmd.insert("param".to_string(), Json::String(canonical.to_string()));
    }
    coerce_value_field(cmd, "value", idx, notes);
}

/// Well-known parameter aliases. Canonical names pass through as `None`.
fn param_alias(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "cutoff" | "filter" => Some("lpf"),
        "volume" => Some("amp"),
        "duration" => Some("dur"),
        _ => None,
    }
}

fn rename_key(
    cmd: &mut Map<String, Json>,
    from: &str,
    to: &str,
    idx: usize,
    notes: &mut Vec<String>,
) {
    if cmd.contains_key(to) || !cmd.contains_key(from) {
        return;
    }
    if let Some(value) = cmd.remove(from) {
        cmd.insert(to.to_string(), value);
        notes.push(format!("command {}: renamed '{from}' to '{to}'", idx + 1));
    }
}

/// Turn `"140"` into `140` and `"0.5"` into `0.5`. Anything that is not
/// unambiguously numeric stays a string.
fn coerce_value_field(
    obj: &mut Map<String, Json>,
    key: &str,
    idx: usize,
    notes: &mut Vec<String>,
) {
    let Some(Json::String(text)) = obj.get(key) else {
        return;
    };
    let trimmed = text.trim();
    let coerced = if let Ok(int) = trimmed.parse::<i64>() {
        Some(Json::Number(int.into()))
    } else if let Ok(float) = trimmed.parse::<f64>() {
        serde_json::Number::from_f64(float).map(Json::Number)
    } else {
        None
    };
    if let Some(coerced) = coerced {
        notes.push(format!(
            "command {}: coerced '{key}' from string to number",
            idx + 1
        ));
        obj.insert(key.to_string(), coerced);
    }
}

struct ParsedCall {
    synth: String,
    pattern: Option<String>,
    kwargs: Vec<(String, Json)>,
}

/// Parse `name(arg, k=v, ...)`. Returns `None` when the text does not
/// look like a single well-formed call.
fn parse_call(text: &str) -> Option<ParsedCall> {
    let text = text.trim();
    let open = text.find('(')?;
    let synth = text[..open].trim();
    if synth.is_empty() || !synth.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    if !text.ends_with(')') {
        return None;
    }
    let inner = &text[open + 1..text.len() - 1];

    let mut pattern = None;
    let mut kwargs = Vec::new();
    for (i, part) in split_top_level(inner).into_iter().enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(eq) = find_top_level_eq(part) {
            let key = part[..eq].trim().to_string();
            let value = parse_literal(part[eq + 1..].trim());
            kwargs.push((key, value));
        } else if i == 0 {
            pattern = Some(part.to_string());
        } else {
            return None;
        }
    }

    Some(ParsedCall {
        synth: synth.to_string(),
        pattern,
        kwargs,
    })
}

/// Split on commas that are not nested inside brackets or quotes.
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut current = String::new();
    for c in text.chars() {
        match in_string {
            Some(quote) => {
                current.push(c);
                if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    in_string = Some(c);
                    current.push(c);
                }
                '[' | '(' | '<' => {
                    depth += 1;
                    current.push(c);
                }
                ']' | ')' | '>' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn find_top_level_eq(part: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in part.char_indices() {
        match c {
            '[' | '(' | '<' => depth += 1,
            ']' | ')' | '>' => depth -= 1,
            '=' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_literal(text: &str) -> Json {
    if let Ok(int) = text.parse::<i64>() {
        return Json::Number(int.into());
    }
    if let Ok(float) = text.parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(float)
    {
        return Json::Number(number);
    }
    match text {
        "True" | "true" => return Json::Bool(true),
        "False" | "false" => return Json::Bool(false),
        _ => {}
    }
    let unquoted = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')));
    Json::String(unquoted.unwrap_or(text).to_string())
}
