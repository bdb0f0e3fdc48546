//! Tool registry: declaration, validation, and dispatch.
//!
//! Every tool visible to an agent is registered here with a description, a
//! JSON-Schema argument object, and a handler. `execute` validates the
//! arguments against the compiled schema before the handler ever runs; a
//! call with unknown fields or missing required fields is rejected at the
//! registry. Handlers are either in-process (`builtin`) or proxies for a
//! remote tool server (`remote`).

pub mod builtin;
pub mod http;
pub mod remote;
pub mod totp;

use crate::errors::KernelError;
use crate::llm::FunctionDeclaration;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Result of a tool execution, serialisable into the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Ok {
        #[serde(default)]
        value: serde_json::Value,
    },
    Error {
        message: String,
        #[serde(default)]
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl ToolOutcome {
    pub fn ok(value: serde_json::Value) -> Self {
        Self::Ok { value }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Ok {
            value: serde_json::Value::String(text.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retryable: false,
            exit_code: None,
        }
    }

    pub fn retryable_error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retryable: true,
            exit_code: None,
        }
    }

    pub fn error_with_exit(message: impl Into<String>, exit_code: i32) -> Self {
        Self::Error {
            message: message.into(),
            retryable: false,
            exit_code: Some(exit_code),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Render for the tool message appended to the transcript.
    pub fn render(&self) -> String {
        match self {
            Self::Ok { value } => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Error {
                message, exit_code, ..
            } => match exit_code {
                Some(code) => format!("status=error, output={message} (exit code {code})"),
                None => format!("status=error, output={message}"),
            },
        }
    }
}

/// Ambient state a handler needs: the sandbox root and run identity.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub agent: String,
    pub target: String,
    pub config: Arc<crate::config::KernelConfig>,
}

impl ToolContext {
    pub fn new(
        workspace: PathBuf,
        agent: impl Into<String>,
        target: impl Into<String>,
        config: Arc<crate::config::KernelConfig>,
    ) -> Self {
        Self {
            workspace,
            agent: agent.into(),
            target: target.into(),
            config,
        }
    }
}

/// An executable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome;
}

struct RegisteredTool {
    description: String,
    schema: serde_json::Value,
    compiled: JSONSchema,
    handler: Arc<dyn ToolHandler>,
}

/// The registry dispatched against by the agent loop.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    /// Empty registry with the default alias table.
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        for (alias, canonical) in [
            ("Bash", "bash"),
            ("execute_command", "bash"),
            ("shell", "bash"),
            ("run_command", "bash"),
            ("Todo", "TodoWrite"),
            ("todo_write", "TodoWrite"),
            ("update_todo", "TodoWrite"),
            ("open_file", "read_file"),
            ("cat", "read_file"),
            ("grep", "search_files"),
            ("save-deliverable", "save_deliverable"),
            ("SaveDeliverable", "save_deliverable"),
            ("sub_agent", "SubAgent"),
            ("subagent", "SubAgent"),
        ] {
            aliases.insert(alias.to_string(), canonical.to_string());
        }
        Self {
            tools: HashMap::new(),
            aliases,
        }
    }

    /// Register a tool. The schema is tightened to reject unknown fields
    /// before compilation, then compiled into a validator.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        schema: serde_json::Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), KernelError> {
        let schema = tighten_schema(schema);
        let compiled = JSONSchema::compile(&schema).map_err(|e| {
            KernelError::Config(format!("schema for tool {name} does not compile: {e}"))
        })?;
        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                description: description.to_string(),
                schema,
                compiled,
                handler,
            },
        );
        Ok(())
    }

    /// Add an alias pointing at a canonical tool name.
    pub fn alias(&mut self, alias: &str, canonical: &str) {
        self.aliases.insert(alias.to_string(), canonical.to_string());
    }

    /// Resolve an incoming tool name to its canonical form.
    pub fn canonical_name(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(&self.canonical_name(name))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Function declarations for the LLM's tool-calling surface.
    pub fn as_llm_catalog(&self) -> Vec<FunctionDeclaration> {
        let mut catalog: Vec<FunctionDeclaration> = self
            .tools
            .iter()
            .map(|(name, tool)| FunctionDeclaration {
                name: name.clone(),
                description: tool.description.clone(),
                parameters: tool.schema.clone(),
            })
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Validate and dispatch a tool call.
    ///
    /// Validation failures and unknown tools come back as error outcomes,
    /// not panics or kernel errors: the agent observes the failure in its
    /// transcript and can react.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let canonical = self.canonical_name(name);
        let Some(tool) = self.tools.get(&canonical) else {
            return ToolOutcome::error(format!("Unknown tool: {name}"));
        };

        let violations: Vec<String> = tool
            .compiled
            .validate(&args)
            .err()
            .map(|errors| errors.map(|e| e.to_string()).collect())
            .unwrap_or_default();
        if !violations.is_empty() {
            return ToolOutcome::error(format!(
                "Arguments for {canonical} failed validation: {}",
                violations.join("; ")
            ));
        }

        tool.handler.call(args, ctx).await
    }

    /// Build the full core tool set for an agent run.
    pub fn with_core_tools() -> Result<Self, KernelError> {
        let mut registry = Self::new();
        builtin::register_core(&mut registry)?;
        http::register(&mut registry)?;
        totp::register(&mut registry)?;
        Ok(registry)
    }

    /// Remove a tool and any aliases pointing at it.
    pub fn remove(&mut self, name: &str) {
        self.tools.remove(name);
        self.aliases.retain(|_, canonical| canonical != name);
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Force `additionalProperties: false` on object schemas so unknown fields
/// never reach a handler, and strip the meta-schema reference remote
/// servers tend to include.
pub fn tighten_schema(mut schema: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        let is_object_schema = obj.get("type").map(|t| t == "object").unwrap_or(false)
            || obj.contains_key("properties");
        if is_object_schema && !obj.contains_key("additionalProperties") {
            obj.insert(
                "additionalProperties".to_string(),
                serde_json::Value::Bool(false),
            );
        }
    }
    schema
}

/// Resolve a tool-supplied path inside the workspace sandbox.
///
/// Relative paths resolve against the workspace root; absolute paths must
/// already be inside it. `..` components are normalised lexically and any
/// traversal above the root is refused.
pub fn resolve_in_workspace(workspace: &Path, path: &str) -> Result<PathBuf, KernelError> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(KernelError::SandboxViolation {
                        path: path.to_string(),
                        workspace: workspace.to_path_buf(),
                    });
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(workspace) {
        return Err(KernelError::SandboxViolation {
            path: path.to_string(),
            workspace: workspace.to_path_buf(),
        });
    }
    Ok(normalized)
}
