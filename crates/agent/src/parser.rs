//! Thought / Action extraction from free-form model output.
//!
//! The scanner works line by line. A line opens a labelled block when it
//! starts with `Thought`, `Action` or `Observation` (or `思考`, `行动`,
//! `观察`), optionally wrapped in `**`, followed by `:` or `：`. A block
//! runs until the next labelled line, so a model that chains several steps
//! into one reply only gets its first action dispatched.
//!
//! Action payloads are cut out by bracket matching that tracks JSON string
//! state, so `tool[{"a": "b]c"}]` keeps the whole object.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Thought,
    Action,
    Observation,
}

const LABELS: &[(&str, Label)] = &[
    ("thought", Label::Thought),
    ("思考", Label::Thought),
    ("action", Label::Action),
    ("行动", Label::Action),
    ("observation", Label::Observation),
    ("观察", Label::Observation),
];

/// Result of [`parse_output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub thought: Option<String>,
    pub action: Option<String>,
}

/// Split a model reply into its first thought and the first action after it.
///
/// When there is no thought, or no action follows it, the first action
/// anywhere in the reply is used.
pub fn parse_output(text: &str) -> ParsedOutput {
    let lines: Vec<&str> = text.trim().lines().collect();
    let labelled: Vec<(usize, Label, &str)> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| strip_label(line).map(|(label, rest)| (i, label, rest)))
        .collect();

    let thought_at = labelled.iter().position(|(_, l, _)| *l == Label::Thought);
    let action_at = thought_at
        .and_then(|t| {
            labelled[t..]
                .iter()
                .position(|(_, l, _)| *l == Label::Action)
                .map(|p| p + t)
        })
        .or_else(|| labelled.iter().position(|(_, l, _)| *l == Label::Action));

    let block = |idx: usize| -> Option<String> {
        let (line, _, first) = labelled[idx];
        let end = labelled.get(idx + 1).map_or(lines.len(), |(next, _, _)| *next);
        let mut text = first.to_string();
        for extra in &lines[line + 1..end] {
            text.push('\n');
            text.push_str(extra);
        }
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    };

    ParsedOutput {
        thought: thought_at.and_then(block),
        action: action_at.and_then(block),
    }
}

/// Render a thought/action pair in the strict two-line form.
pub fn format_output(thought: Option<&str>, action: Option<&str>) -> String {
    let mut lines = Vec::with_capacity(2);
    if let Some(t) = thought {
        lines.push(format!("Thought: {t}"));
    }
    if let Some(a) = action {
        lines.push(format!("Action: {a}"));
    }
    lines.join("\n")
}

/// `name[payload]` → `(name, payload)`.
///
/// Falls back to everything up to the last closing bracket on the first
/// line when the brackets do not balance.
pub fn parse_action(action: &str) -> Option<(String, String)> {
    let action = action.trim();
    let name_len = action
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(action.len());
    if name_len == 0 {
        return None;
    }
    let name = &action[..name_len];
    let rest = action[name_len..].trim_start();
    let open = rest.chars().next().filter(|c| is_open(*c))?;
    let body = &rest[open.len_utf8()..];

    if let Some(end) = matching_close(body) {
        return Some((name.to_string(), body[..end].to_string()));
    }

    let first_line = body.lines().next().unwrap_or_default();
    let end = first_line.rfind(is_close)?;
    Some((name.to_string(), first_line[..end].to_string()))
}

/// Whether the action is the `Finish` pseudo-action.
pub fn is_finish(action: &str) -> bool {
    let action = action.trim_start();
    action.get(..6).is_some_and(|head| head.eq_ignore_ascii_case("finish"))
        && action[6..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
}

/// Final answer carried by a `Finish` action.
///
/// Accepts `Finish[...]`, `Finish: ...`, `Finish：...` and `Finish` followed
/// by the answer on the next lines.
pub fn parse_finish(action: &str) -> Option<String> {
    if !is_finish(action) {
        return None;
    }
    let rest = action.trim()[6..].trim_start();

    if let Some(open) = rest.chars().next()
        && is_open(open)
    {
        let body = &rest[open.len_utf8()..];
        // The answer runs to the last bracket when the reply ends with one.
        let inner = match body.char_indices().last() {
            Some((i, c)) if is_close(c) => &body[..i],
            _ => matching_close(body).map_or(body, |end| &body[..end]),
        };
        return Some(inner.trim().to_string());
    }

    let rest = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))
        .unwrap_or(rest);
    Some(rest.trim().to_string())
}

fn strip_label(line: &str) -> Option<(Label, &str)> {
    let rest = line.trim_start();
    let rest = rest.strip_prefix("**").unwrap_or(rest);
    let (label, after) = LABELS.iter().find_map(|(word, label)| {
        let head = rest.get(..word.len())?;
        head.eq_ignore_ascii_case(word)
            .then(|| (*label, &rest[word.len()..]))
    })?;
    let after = after.strip_prefix("**").unwrap_or(after).trim_start();
    let after = after.strip_prefix(':').or_else(|| after.strip_prefix('：'))?;
    let after = after.strip_prefix("**").unwrap_or(after);
    Some((label, after.trim_start()))
}

fn is_open(c: char) -> bool {
    matches!(c, '[' | '［' | '【')
}

fn is_close(c: char) -> bool {
    matches!(c, ']' | '］' | '】')
}

/// Byte offset of the bracket closing an already-consumed opener.
fn matching_close(body: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if is_open(c) => depth += 1,
            c if is_close(c) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
