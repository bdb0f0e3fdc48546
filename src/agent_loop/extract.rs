//! Extraction of tool calls smuggled inside assistant content.
//!
//! Some models answer with a fenced JSON block instead of a native tool
//! call. This module finds those blocks, repairs truncation, classifies
//! the payload by shape, and attributes it to the canonical tool name:
//!
//! - `tool`/`name` + `arguments`/`args` — explicit call
//! - `deliverable_type` (+ `content` or `path`) — `save_deliverable`
//! - `command` — `bash`
//! - `todo` — `TodoWrite`
//! - `task` + `input` — `SubAgent`
//!
//! Shape classification and the hallucinated-prefix cleanup live here so
//! the loop itself stays free of these heuristics.

use super::repair::parse_with_repair;
use crate::llm::ToolCallRequest;
use serde_json::{Value, json};

/// Extract smuggled tool calls from assistant content.
///
/// Synthetic ids are allocated as `inline-<n>` offset by `id_base` so they
/// never collide with native call ids from the same turn.
pub fn extract_smuggled_calls(content: &str, id_base: usize) -> Vec<ToolCallRequest> {
    let mut calls = Vec::new();
    for block in fenced_blocks(content) {
        let Some(value) = parse_with_repair(&block) else {
            continue;
        };
        // A fenced array holds several calls.
        let candidates: Vec<Value> = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        for candidate in candidates {
            if let Some((name, arguments)) = classify(&candidate) {
                calls.push(ToolCallRequest {
                    id: format!("inline-{}", id_base + calls.len()),
                    name,
                    arguments,
                });
            }
        }
    }
    calls
}

/// The contents of every fenced code block, with an optional language tag
/// on the opening fence.
fn fenced_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        // Skip the language tag line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(end) => {
                blocks.push(body[..end].to_string());
                rest = &body[end + 3..];
            }
            None => {
                // Unterminated fence: the model was cut off mid-block.
                blocks.push(body.to_string());
                break;
            }
        }
    }
    blocks
}

/// Classify a JSON payload into `(canonical tool name, arguments)`.
fn classify(value: &Value) -> Option<(String, Value)> {
    let obj = value.as_object()?;

    // Explicit form first: {"tool": "...", "arguments": {...}}.
    if let Some(name) = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(|v| v.as_str())
    {
        let arguments = obj
            .get("arguments")
            .or_else(|| obj.get("args"))
            .or_else(|| obj.get("parameters"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        return Some((name.to_string(), arguments));
    }

    // Shape-classified forms.
    if obj.contains_key("deliverable_type") {
        let mut args = json!({
            "deliverable_type": obj.get("deliverable_type").cloned().unwrap_or(Value::Null),
        });
        if let Some(content) = obj.get("content") {
            args["content"] = content.clone();
        } else if let Some(path) = obj.get("path") {
            args["path"] = path.clone();
        }
        return Some(("save_deliverable".to_string(), args));
    }
    if let Some(command) = obj.get("command") {
        return Some(("bash".to_string(), json!({"command": command.clone()})));
    }
    if let Some(todo) = obj.get("todo") {
        return Some(("TodoWrite".to_string(), json!({"todo": todo.clone()})));
    }
    if obj.contains_key("task") && obj.contains_key("input") {
        return Some((
            "SubAgent".to_string(),
            json!({
                "task": obj.get("task").cloned().unwrap_or(Value::Null),
                "input": obj.get("input").cloned().unwrap_or(Value::Null),
            }),
        ));
    }
    None
}

/// Strip hallucinated `command:` / `bash:` / `sh:` prefixes and unwrap a
/// JSON-wrapped payload from a shell command.
pub fn sanitize_bash_command(command: &str) -> String {
    let unwrapped = crate::util::unwrap_json_command(command);
    let trimmed = unwrapped.trim();
    for prefix in ["command:", "bash:", "sh:"] {
        if let Some(stripped) = trimmed.strip_prefix(prefix) {
            return stripped.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// True when a shell command targets the local host.
pub fn command_targets_localhost(command: &str) -> bool {
    let lower = command.to_lowercase();
    lower.contains("localhost") || lower.contains("127.0.0.1") || lower.contains("0.0.0.0")
}

/// True when the session target itself is local, which makes localhost
/// traffic legitimate.
pub fn target_is_local(target: &str) -> bool {
    command_targets_localhost(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_explicit_tool_form() {
        let content = "Let me run that.\n```json\n{\"tool\": \"bash\", \"arguments\": {\"command\": \"id\"}}\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].arguments["command"], "id");
        assert_eq!(calls[0].id, "inline-0");
    }

    #[test]
    fn test_extract_bash_by_shape() {
        let content = "```json\n{\"command\": \"nmap -sV 10.0.0.5\"}\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].arguments["command"], "nmap -sV 10.0.0.5");
    }

    #[test]
    fn test_extract_deliverable_by_shape() {
        let content =
            "```json\n{\"deliverable_type\": \"SQLI_ANALYSIS\", \"content\": \"# Findings\"}\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls[0].name, "save_deliverable");
        assert_eq!(calls[0].arguments["deliverable_type"], "SQLI_ANALYSIS");
        assert_eq!(calls[0].arguments["content"], "# Findings");
    }

    #[test]
    fn test_extract_deliverable_with_path_variant() {
        let content = "```json\n{\"deliverable_type\": \"SQLI_QUEUE\", \"path\": \"queue.json\"}\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls[0].name, "save_deliverable");
        assert_eq!(calls[0].arguments["path"], "queue.json");
    }

    #[test]
    fn test_extract_todo_and_subagent_shapes() {
        let content = "```json\n{\"todo\": \"[x] recon\"}\n```\nthen\n```json\n{\"task\": \"trace token\", \"input\": \"where is the JWT validated?\"}\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "TodoWrite");
        assert_eq!(calls[1].name, "SubAgent");
        assert_eq!(calls[1].id, "inline-1");
    }

    #[test]
    fn test_extract_array_of_calls() {
        let content = "```json\n[{\"command\": \"ls\"}, {\"command\": \"pwd\"}]\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.name == "bash"));
    }

    #[test]
    fn test_extract_truncated_block_is_repaired() {
        let content = "```json\n{\"command\": \"curl http://target/api/users\n```";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls.len(), 1);
        assert!(
            calls[0].arguments["command"]
                .as_str()
                .unwrap()
                .starts_with("curl")
        );
    }

    #[test]
    fn test_extract_unterminated_fence() {
        let content = "```json\n{\"command\": \"whoami\"}";
        let calls = extract_smuggled_calls(content, 0);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_non_call_json_is_ignored() {
        let content = "```json\n{\"observation\": \"the endpoint is open\"}\n```";
        assert!(extract_smuggled_calls(content, 0).is_empty());
    }

    #[test]
    fn test_non_json_blocks_are_ignored() {
        let content = "```python\nprint('hello')\n```";
        assert!(extract_smuggled_calls(content, 0).is_empty());
    }

    #[test]
    fn test_id_base_offsets_synthetic_ids() {
        let content = "```json\n{\"command\": \"ls\"}\n```";
        let calls = extract_smuggled_calls(content, 3);
        assert_eq!(calls[0].id, "inline-3");
    }

    #[test]
    fn test_sanitize_bash_command_strips_prefixes() {
        assert_eq!(sanitize_bash_command("command: ls -la"), "ls -la");
        assert_eq!(sanitize_bash_command("bash: whoami"), "whoami");
        assert_eq!(sanitize_bash_command("sh: id"), "id");
        assert_eq!(sanitize_bash_command("plain"), "plain");
    }

    #[test]
    fn test_sanitize_bash_command_unwraps_json() {
        assert_eq!(
            sanitize_bash_command(r#"{"command": "curl http://t/"}"#),
            "curl http://t/"
        );
        // Unwrap then strip, in that order.
        assert_eq!(
            sanitize_bash_command(r#"{"command": "bash: ls"}"#),
            "ls"
        );
    }

    #[test]
    fn test_localhost_detection() {
        assert!(command_targets_localhost("curl http://localhost:8080/api"));
        assert!(command_targets_localhost("curl http://127.0.0.1/x"));
        assert!(!command_targets_localhost("curl http://203.0.113.10/x"));
        assert!(target_is_local("http://127.0.0.1:3000"));
        assert!(!target_is_local("https://app.example.com"));
    }
}
