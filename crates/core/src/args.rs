//! Action-input parsing and schema-driven coercion.
//!
//! Models hand tools their arguments as free text inside `name[...]`. The
//! registry tries, in order: a JSON object (tolerating stray brackets around
//! it), `key=value` pairs, then a bare string bound to the obvious parameter.

use serde_json::{Map, Number, Value};

use crate::error::ToolError;
use crate::tool::{ParamType, ToolParams, ToolSchema};

/// Turn raw action input into typed params for `schema`.
///
/// Missing required parameters are reported only after coercion and
/// default filling, so `{"n": "3"}` satisfies a required integer `n`.
pub fn prepare_params(schema: &ToolSchema, raw: &str) -> Result<ToolParams, ToolError> {
    let raw = raw.trim();
    let mut params = match parse_json_params(raw) {
        Some(params) => params,
        None => match parse_key_values(raw, schema) {
            Some(params) => params,
            None => bind_bare(raw, schema)?,
        },
    };
    coerce_params(&mut params, schema);
    fill_defaults(&mut params, schema);
    schema.validate(&params)?;
    Ok(params)
}

// ── JSON ───────────────────────────────────────────────────────

/// Parse a JSON object, accepting `{...}]`, `[{...}]` and objects embedded
/// in surrounding noise.
pub fn parse_json_params(raw: &str) -> Option<ToolParams> {
    if let Some(obj) = json_object(raw) {
        return Some(obj);
    }

    // Stray brackets the model left around the object.
    let stripped = raw.trim_start_matches('[').trim_end_matches(']').trim();
    if stripped != raw
        && let Some(obj) = json_object(stripped)
    {
        return Some(obj);
    }

    extract_first_json_object(raw).and_then(json_object)
}

fn json_object(text: &str) -> Option<ToolParams> {
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(map) => Some(map),
        Value::Array(items) if items.len() == 1 => match items.into_iter().next() {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Return the first balanced `{...}` span, ignoring braces inside strings.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── key=value ──────────────────────────────────────────────────

/// Parse `k=v, k2="v 2"` pairs. Pieces without a key bind positionally to
/// the next unbound declared parameter. At least one key must name a
/// declared parameter, otherwise the input is treated as a bare string.
pub fn parse_key_values(raw: &str, schema: &ToolSchema) -> Option<ToolParams> {
    if !raw.contains('=') {
        return None;
    }

    let mut named = Vec::new();
    let mut positional = Vec::new();
    for piece in split_outside_quotes(raw, &[',', '，']) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('=') {
            Some((key, value)) if is_identifier(key.trim()) => {
                named.push((key.trim().to_string(), unquote(value.trim())));
            }
            _ => positional.push(unquote(piece)),
        }
    }

    if !named.iter().any(|(key, _)| schema.parameter(key).is_some()) {
        return None;
    }

    let mut params = Map::new();
    for (key, value) in named {
        params.insert(key, Value::String(value));
    }

    let mut free = schema
        .parameters
        .iter()
        .filter(|p| !params.contains_key(&p.name))
        .map(|p| p.name.clone())
        .collect::<Vec<_>>()
        .into_iter();
    for value in positional {
        let name = free.next()?;
        params.insert(name, Value::String(value));
    }

    Some(params)
}

/// Split on any of `separators` outside single or double quotes.
pub fn split_outside_quotes(text: &str, separators: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (_, '\\') => {
                current.push(ch);
                escaped = true;
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(ch);
            }
            (None, '"' | '\'') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, c) if separators.contains(&c) => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(s: &str) -> String {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

// ── Bare string ────────────────────────────────────────────────

fn bind_bare(raw: &str, schema: &ToolSchema) -> Result<ToolParams, ToolError> {
    let mut params = Map::new();
    if raw.is_empty() && schema.required_names().next().is_none() {
        return Ok(params);
    }

    let mut required = schema.parameters.iter().filter(|p| p.required);
    let target = match (required.next(), required.next()) {
        (Some(only), None) => Some(only.name.as_str()),
        _ => schema.parameter("input").map(|p| p.name.as_str()),
    };

    match target {
        Some(name) => {
            params.insert(name.to_string(), Value::String(raw.to_string()));
            Ok(params)
        }
        None => Err(ToolError::StructuredInputRequired(schema.name.clone())),
    }
}

// ── Coercion ───────────────────────────────────────────────────

/// Coerce declared parameters to their schema types in place. Undeclared
/// keys pass through untouched.
pub fn coerce_params(params: &mut ToolParams, schema: &ToolSchema) {
    for param in &schema.parameters {
        if let Some(value) = params.remove(&param.name) {
            params.insert(param.name.clone(), coerce_value(value, param.param_type));
        }
    }
}

/// Coerce one value; on failure the raw value is kept.
pub fn coerce_value(value: Value, ty: ParamType) -> Value {
    match ty {
        ParamType::String => value,
        ParamType::Integer => match &value {
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(value),
            _ => value,
        },
        ParamType::Number => match &value {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(value),
            _ => value,
        },
        ParamType::Boolean => match value {
            Value::Bool(b) => Value::Bool(b),
            Value::String(s) => Value::Bool(truthy(&s)),
            other => Value::Bool(truthy(&other.to_string())),
        },
        ParamType::Array | ParamType::Object => match &value {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) if ty == ParamType::Array => parsed,
                Ok(parsed @ Value::Object(_)) if ty == ParamType::Object => parsed,
                _ => value,
            },
            _ => value,
        },
    }
}

fn truthy(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn fill_defaults(params: &mut ToolParams, schema: &ToolSchema) {
    for param in &schema.parameters {
        if let Some(default) = &param.default
            && !params.contains_key(&param.name)
        {
            params.insert(param.name.clone(), default.clone());
        }
    }
}
