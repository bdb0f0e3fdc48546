//! In-process core tools: shell, file access, deliverables, todo list.
//!
//! Every path-taking tool resolves through the workspace sandbox; the
//! shell runs with its working directory pinned to the workspace and the
//! configured proxy variables propagated.

use super::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry, resolve_in_workspace};
use crate::deliverables;
use crate::errors::KernelError;
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use walkdir::WalkDir;

/// Stdout/stderr cap per shell call.
const SHELL_OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Register the core in-process tools.
pub fn register_core(registry: &mut ToolRegistry) -> Result<(), KernelError> {
    registry.register(
        "bash",
        "Execute a shell command inside the session workspace. Times out after the configured limit.",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to run"}
            },
            "required": ["command"]
        }),
        Arc::new(BashTool),
    )?;

    registry.register(
        "read_file",
        "Read a file from the workspace. Large results are staged to disk by the kernel.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"}
            },
            "required": ["path"]
        }),
        Arc::new(ReadFileTool),
    )?;

    registry.register(
        "write_file",
        "Write a file inside the workspace, creating parent directories as needed.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        }),
        Arc::new(WriteFileTool),
    )?;

    registry.register(
        "search_files",
        "Search workspace files for a regular expression and return matching lines.",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Regular expression to search for"},
                "path": {"type": "string", "description": "Subdirectory to search, default workspace root"}
            },
            "required": ["query"]
        }),
        Arc::new(SearchFilesTool),
    )?;

    registry.register(
        "list_files",
        "List files under a workspace directory.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Subdirectory to list, default workspace root"}
            }
        }),
        Arc::new(ListFilesTool),
    )?;

    registry.register(
        "save_deliverable",
        "Save a typed deliverable into the workspace deliverables directory. \
         Provide the content inline, or the path of a workspace file to promote.",
        json!({
            "type": "object",
            "properties": {
                "deliverable_type": {"type": "string", "description": "Deliverable type tag, e.g. SQLI_ANALYSIS"},
                "content": {"type": "string"},
                "path": {"type": "string", "description": "Workspace file holding the content"}
            },
            "required": ["deliverable_type"]
        }),
        Arc::new(SaveDeliverableTool),
    )?;

    registry.register(
        "TodoWrite",
        "Replace the agent's persistent todo list.",
        json!({
            "type": "object",
            "properties": {
                "todo": {"type": "string", "description": "The full todo list, one item per line"}
            },
            "required": ["todo"]
        }),
        Arc::new(TodoWriteTool),
    )?;

    Ok(())
}

// --- bash -------------------------------------------------------------------

struct BashTool;

#[async_trait]
impl ToolHandler for BashTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let command = args["command"].as_str().unwrap_or_default();
        run_shell(command, ctx).await
    }
}

async fn run_shell(command: &str, ctx: &ToolContext) -> ToolOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in ctx.config.proxy_env() {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ToolOutcome::error(format!("Failed to spawn shell: {e}")),
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let reader = async move {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe {
            let _ = pipe
                .take(SHELL_OUTPUT_CAP as u64)
                .read_to_end(&mut stdout)
                .await;
        }
        if let Some(pipe) = stderr_pipe {
            let _ = pipe
                .take(SHELL_OUTPUT_CAP as u64)
                .read_to_end(&mut stderr)
                .await;
        }
        // Pipes are closed here; a child still writing past the cap gets
        // EPIPE instead of blocking wait() forever.
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    let (stdout, stderr, status) = match tokio::time::timeout(ctx.config.shell_timeout, reader).await
    {
        Ok(result) => result,
        Err(_) => {
            return ToolOutcome::retryable_error(format!(
                "Command timed out after {}s",
                ctx.config.shell_timeout.as_secs()
            ));
        }
    };

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => return ToolOutcome::error(format!("Failed to wait for command: {e}")),
    };

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    // ripgrep-style searches exit 1 on "no matches"; that is an empty
    // result, not a failure.
    let trimmed = command.trim_start();
    let is_search = trimmed.starts_with("rg ") || trimmed.starts_with("grep ");
    if exit_code == 1 && is_search && stderr.is_empty() {
        return ToolOutcome::ok(json!({
            "stdout": "",
            "stderr": "",
            "exit_code": 0,
            "note": "no matches"
        }));
    }

    if exit_code == 0 {
        ToolOutcome::ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": 0
        }))
    } else {
        ToolOutcome::error_with_exit(
            format!(
                "Command exited with code {exit_code}: {}",
                crate::util::truncate_with_marker(
                    &if stderr.is_empty() { stdout } else { stderr },
                    4000
                )
            ),
            exit_code,
        )
    }
}

// --- file tools -------------------------------------------------------------

struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let path = args["path"].as_str().unwrap_or_default();
        let resolved = match resolve_in_workspace(&ctx.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::error(e.to_string()),
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => ToolOutcome::ok(json!({"path": path, "content": content})),
            Err(e) => ToolOutcome::error(format!("Failed to read {path}: {e}")),
        }
    }
}

struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();
        let resolved = match resolve_in_workspace(&ctx.workspace, path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::error(e.to_string()),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutcome::error(format!("Failed to create parent of {path}: {e}"));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => ToolOutcome::ok(json!({"path": path, "bytes": content.len()})),
            Err(e) => ToolOutcome::error(format!("Failed to write {path}: {e}")),
        }
    }
}

struct SearchFilesTool;

/// Cap on reported matches to keep transcripts bounded.
const SEARCH_MATCH_CAP: usize = 200;

#[async_trait]
impl ToolHandler for SearchFilesTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let query = args["query"].as_str().unwrap_or_default();
        let sub = args["path"].as_str().unwrap_or(".");
        let root = match resolve_in_workspace(&ctx.workspace, sub) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::error(e.to_string()),
        };
        let regex = match RegexBuilder::new(query).case_insensitive(true).build() {
            Ok(r) => r,
            Err(e) => return ToolOutcome::error(format!("Invalid search pattern: {e}")),
        };

        let mut matches = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (lineno, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let rel = entry
                        .path()
                        .strip_prefix(&ctx.workspace)
                        .unwrap_or(entry.path());
                    matches.push(format!("{}:{}: {}", rel.display(), lineno + 1, line.trim()));
                    if matches.len() >= SEARCH_MATCH_CAP {
                        break;
                    }
                }
            }
            if matches.len() >= SEARCH_MATCH_CAP {
                break;
            }
        }

        ToolOutcome::ok(json!({
            "query": query,
            "match_count": matches.len(),
            "matches": matches,
            "truncated": matches.len() >= SEARCH_MATCH_CAP
        }))
    }
}

struct ListFilesTool;

#[async_trait]
impl ToolHandler for ListFilesTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let sub = args["path"].as_str().unwrap_or(".");
        let root = match resolve_in_workspace(&ctx.workspace, sub) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::error(e.to_string()),
        };
        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .max_depth(4)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&ctx.workspace)
                    .unwrap_or(entry.path());
                files.push(rel.display().to_string());
            }
        }
        files.sort();
        ToolOutcome::ok(json!({"count": files.len(), "files": files}))
    }
}

// --- deliverables and todo --------------------------------------------------

struct SaveDeliverableTool;

#[async_trait]
impl ToolHandler for SaveDeliverableTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let requested = args["deliverable_type"].as_str().unwrap_or_default();
        if requested.is_empty() {
            return ToolOutcome::error("deliverable_type must not be empty");
        }
        let content = match (args["content"].as_str(), args["path"].as_str()) {
            (Some(content), _) => content.to_string(),
            (None, Some(source)) => {
                let resolved = match resolve_in_workspace(&ctx.workspace, source) {
                    Ok(p) => p,
                    Err(e) => return ToolOutcome::error(e.to_string()),
                };
                match tokio::fs::read_to_string(&resolved).await {
                    Ok(content) => content,
                    Err(e) => {
                        return ToolOutcome::error(format!(
                            "Cannot promote {source} to a deliverable: {e}"
                        ));
                    }
                }
            }
            (None, None) => {
                return ToolOutcome::error("save_deliverable needs content or a workspace path");
            }
        };
        // The loop coerces before dispatch; coerce again here so a direct
        // call can still never mis-file an artifact.
        let type_tag = deliverables::coerce_type(&ctx.agent, requested);
        let path = deliverables::path_for(&ctx.workspace, &type_tag);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutcome::error(format!("Failed to create deliverables dir: {e}"));
            }
        }
        match tokio::fs::write(&path, &content).await {
            Ok(()) => ToolOutcome::ok(json!({
                "deliverable_type": type_tag,
                "path": path.display().to_string(),
                "bytes": content.len()
            })),
            Err(e) => ToolOutcome::error(format!("Failed to save deliverable {type_tag}: {e}")),
        }
    }
}

struct TodoWriteTool;

#[async_trait]
impl ToolHandler for TodoWriteTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let todo = args["todo"].as_str().unwrap_or_default();
        let path = ctx
            .workspace
            .join("deliverables/findings")
            .join(&ctx.agent)
            .join("todo.txt");
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutcome::error(format!("Failed to create findings dir: {e}"));
            }
        }
        match tokio::fs::write(&path, todo).await {
            Ok(()) => ToolOutcome::ok(json!({
                "path": path.display().to_string(),
                "items": todo.lines().filter(|l| !l.trim().is_empty()).count()
            })),
            Err(e) => ToolOutcome::error(format!("Failed to write todo: {e}")),
        }
    }
}
