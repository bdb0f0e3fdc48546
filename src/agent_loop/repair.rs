//! Best-effort repair of truncated JSON.
//!
//! Models cut off mid-generation leave unbalanced braces and unterminated
//! strings behind. This module closes what it can so a smuggled tool call
//! survives truncation. The heuristics live here, isolated from business
//! logic, and nothing else in the crate reimplements them.

/// Attempt to parse `input` as JSON, repairing truncation when needed.
///
/// Returns `None` when the input is not JSON-shaped at all or the repaired
/// text still does not parse.
pub fn parse_with_repair(input: &str) -> Option<serde_json::Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let repaired = repair_truncated_json(trimmed);
    serde_json::from_str(&repaired).ok()
}

/// Close unterminated strings and balance braces/brackets.
///
/// The scanner walks the text tracking string state and the open
/// container stack; at the end it closes the string (if open), drops a
/// dangling partial token (a trailing `,` or `:`), and appends the
/// closers in stack order.
pub fn repair_truncated_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '{' if !in_string => {
                stack.push('}');
                out.push(ch);
            }
            '[' if !in_string => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' if !in_string => {
                // Only pop a matching closer; an unmatched one is dropped.
                if stack.last() == Some(&ch) {
                    stack.pop();
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }

    // A trailing backslash began an escape that never finished.
    if escaped {
        out.pop();
    }
    if in_string {
        out.push('"');
    }

    // Drop a dangling separator so `{"a": 1,` closes as `{"a": 1}` and
    // `{"a":` closes as `{"a":null}`.
    loop {
        let trimmed_end = out.trim_end().to_string();
        if trimmed_end.ends_with(',') {
            out = trimmed_end[..trimmed_end.len() - 1].to_string();
        } else if trimmed_end.ends_with(':') {
            out = format!("{trimmed_end}null");
        } else {
            out = trimmed_end;
            break;
        }
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
