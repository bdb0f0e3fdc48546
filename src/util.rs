//! Shared utility functions for the vigil crate.

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Strip control characters from text, keeping `\t`, `\n`, and `\r`.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Collapse runs of five or more identical consecutive lines down to one
/// line plus a repeat marker.
pub fn collapse_repeated_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let mut run = 1;
        while i + run < lines.len() && lines[i + run] == lines[i] {
            run += 1;
        }
        if run >= 5 {
            out.push(lines[i].to_string());
            out.push(format!("[... repeated {} more times ...]", run - 1));
        } else {
            for _ in 0..run {
                out.push(lines[i].to_string());
            }
        }
        i += run;
    }
    let mut result = out.join("\n");
    if text.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Truncate text to a byte budget on a char boundary, appending a marker
/// when anything was cut.
pub fn truncate_with_marker(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... output truncated ...]", &text[..end])
}

/// Unwrap a JSON-wrapped shell command: `{"command": "ls"}` becomes `ls`.
/// Non-JSON input and JSON without a string `command` pass through.
pub fn unwrap_json_command(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(command) = value.get("command").and_then(|c| c.as_str()) {
                return command.to_string();
            }
        }
    }
    input.to_string()
}

/// Sanitize a hostname (or other identifier) for use in a directory name.
pub fn sanitize_for_path(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extract the hostname portion of a target URL for directory naming.
/// Falls back to sanitizing the whole string for non-URL targets.
pub fn target_hostname(target: &str) -> String {
    let without_scheme = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    // Drop credentials and port
    let host = host.rsplit('@').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    sanitize_for_path(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_brace_in_string() {
        let text = r#"{"cmd": "echo {"}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_strip_control_chars_keeps_whitespace() {
        let input = "line1\nline2\tindented\r\n\u{0007}bell\u{001b}[31mred";
        let out = strip_control_chars(input);
        assert!(out.contains('\n'));
        assert!(out.contains('\t'));
        assert!(!out.contains('\u{0007}'));
        assert!(!out.contains('\u{001b}'));
    }

    #[test]
    fn test_collapse_repeated_lines_under_threshold() {
        let input = "a\na\na\na\nb";
        // Four repeats stay as-is
        assert_eq!(collapse_repeated_lines(input), input);
    }

    #[test]
    fn test_collapse_repeated_lines_over_threshold() {
        let input = "x\nx\nx\nx\nx\nx\ny";
        let out = collapse_repeated_lines(input);
        assert!(out.contains("repeated 5 more times"));
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn test_truncate_with_marker_short_input() {
        assert_eq!(truncate_with_marker("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_with_marker_cuts_and_marks() {
        let input = "a".repeat(50);
        let out = truncate_with_marker(&input, 10);
        assert!(out.starts_with("aaaaaaaaaa"));
        assert!(out.ends_with("[... output truncated ...]"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let input = "日本語のテキスト";
        let out = truncate_with_marker(input, 7);
        // Must not panic and must keep whole characters
        assert!(out.contains("truncated"));
    }

    #[test]
    fn test_unwrap_json_command() {
        assert_eq!(unwrap_json_command(r#"{"command": "ls -la"}"#), "ls -la");
        assert_eq!(unwrap_json_command("plain command"), "plain command");
        assert_eq!(unwrap_json_command(r#"{"other": 1}"#), r#"{"other": 1}"#);
        assert_eq!(
            unwrap_json_command(r#"  {"command": "curl http://x"}  "#),
            "curl http://x"
        );
    }

    #[test]
    fn test_sanitize_for_path() {
        assert_eq!(sanitize_for_path("app.example.com"), "app.example.com");
        assert_eq!(sanitize_for_path("a b/c"), "a_b_c");
        assert_eq!(sanitize_for_path("///"), "unnamed");
    }

    #[test]
    fn test_target_hostname_from_url() {
        assert_eq!(
            target_hostname("https://app.example.com:8443/login?x=1"),
            "app.example.com"
        );
        assert_eq!(target_hostname("http://10.0.0.5/api"), "10.0.0.5");
    }

    #[test]
    fn test_target_hostname_from_plain_path() {
        assert_eq!(target_hostname("/opt/bins/server"), "opt_bins_server");
    }
}
