//! Sub-agent executor: a short, tool-restricted conversation.
//!
//! An agent delegates a focused question to a sub-agent, which runs with a
//! restricted registry (no `save_deliverable`, so it can never signal
//! phase completion) and returns a single textual summary. The protocol is
//! fixed in the system prompt: finish with a trailing `## Summary` block,
//! or emit `CONTINUE: <reason>` when the turn budget is not enough. A
//! sub-agent that exits with neither marker gets its transcript salvaged:
//! a second short LLM call summarises the recent tool outputs, and if that
//! also fails the most recent tool result is truncated and returned.

use crate::config::KernelConfig;
use crate::llm::{ChatClient, Message, ToolChoice, TokenUsage};
use crate::tools::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
use crate::util::{collapse_repeated_lines, strip_control_chars, truncate_with_marker, unwrap_json_command};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const SUMMARY_MARKER: &str = "## Summary";
const CONTINUE_MARKER: &str = "CONTINUE:";

/// How many recent tool outputs feed the salvage summarisation.
const SALVAGE_WINDOW: usize = 10;

/// A delegated subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRequest {
    /// Free-text identity of the subtask, also the dedup key.
    pub task: String,
    /// The focused question.
    pub input: String,
}

/// Terminal status of a sub-agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentStatus {
    Complete,
    Incomplete,
    Error,
}

/// What the parent agent receives back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentOutcome {
    pub status: SubAgentStatus,
    pub result: String,
    pub turns: u32,
    pub needs_continuation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_reason: Option<String>,
    pub is_complete: bool,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl SubAgentOutcome {
    fn complete(result: String, turns: u32, usage: TokenUsage) -> Self {
        Self {
            status: SubAgentStatus::Complete,
            result,
            turns,
            needs_continuation: false,
            continue_reason: None,
            is_complete: true,
            usage,
        }
    }

    fn incomplete(result: String, reason: String, turns: u32, usage: TokenUsage) -> Self {
        Self {
            status: SubAgentStatus::Incomplete,
            result,
            turns,
            needs_continuation: true,
            continue_reason: Some(reason),
            is_complete: false,
            usage,
        }
    }

    fn error(message: String, turns: u32, usage: TokenUsage) -> Self {
        Self {
            status: SubAgentStatus::Error,
            result: message,
            turns,
            needs_continuation: false,
            continue_reason: None,
            is_complete: false,
            usage,
        }
    }
}

/// Runs sub-agent conversations at a given nesting depth.
pub struct SubAgentExecutor {
    client: Arc<dyn ChatClient>,
    config: Arc<KernelConfig>,
    depth: u32,
    concurrency: Arc<Semaphore>,
}

impl SubAgentExecutor {
    pub fn new(client: Arc<dyn ChatClient>, config: Arc<KernelConfig>, depth: u32) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.subagent_max_concurrent.max(1)));
        Self {
            client,
            config,
            depth,
            concurrency,
        }
    }

    /// Restricted registry for this depth. A further `SubAgent` tool is
    /// present only while the depth cap allows another level.
    fn build_registry(&self) -> Result<ToolRegistry, crate::errors::KernelError> {
        let mut registry = ToolRegistry::new();
        crate::tools::builtin::register_core(&mut registry)?;
        crate::tools::http::register(&mut registry)?;
        crate::tools::totp::register(&mut registry)?;
        registry.remove("save_deliverable");

        if self.depth + 1 < self.config.subagent_max_depth {
            let child = Arc::new(SubAgentExecutor::new(
                self.client.clone(),
                self.config.clone(),
                self.depth + 1,
            ));
            register_subagent_tool(&mut registry, child)?;
        }
        Ok(registry)
    }

    fn system_prompt(&self, task: &str) -> String {
        format!(
            "You are a focused investigator handling one subtask: {task}\n\
             Rules:\n\
             - Do not install packages or start long-running servers.\n\
             - Stay inside the provided workspace.\n\
             - When finished, end your final message with a `{SUMMARY_MARKER}` section containing your findings.\n\
             - If you cannot finish within your turn budget, reply with `{CONTINUE_MARKER} <reason>` instead.",
        )
    }

    /// Run one sub-agent conversation to completion.
    pub async fn run(&self, request: &SubAgentRequest, ctx: &ToolContext) -> SubAgentOutcome {
        let _permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("sub-agent semaphore closed");

        let registry = match self.build_registry() {
            Ok(r) => r,
            Err(e) => return SubAgentOutcome::error(e.to_string(), 0, TokenUsage::default()),
        };
        let catalog = registry.as_llm_catalog();

        let mut messages = vec![
            Message::system(self.system_prompt(&request.task)),
            Message::user(request.input.clone()),
        ];
        let mut usage = TokenUsage::default();
        let mut recent_tool_outputs: Vec<String> = Vec::new();
        let max_turns = self.config.subagent_max_turns;

        for turn in 1..=max_turns {
            let response = match self
                .client
                .chat(&messages, &catalog, ToolChoice::Auto)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(task = %request.task, error = %e, "sub-agent LLM call failed");
                    return self
                        .salvage(&request.task, &recent_tool_outputs, turn, usage)
                        .await;
                }
            };
            usage.add(&response.usage);

            if response.message.tool_calls.is_empty() {
                let content = response.message.content.clone();
                if let Some(reason) = extract_continue_reason(&content) {
                    let result = self.finalize(content.clone(), ctx).await;
                    return SubAgentOutcome::incomplete(result, reason, turn, usage);
                }
                if content.contains(SUMMARY_MARKER) {
                    let summary = extract_summary(&content);
                    let result = self.finalize(summary, ctx).await;
                    return SubAgentOutcome::complete(result, turn, usage);
                }
                // Natural stop without a marker: salvage from tool outputs.
                return self
                    .salvage(&request.task, &recent_tool_outputs, turn, usage)
                    .await;
            }

            messages.push(response.message.clone());
            for call in &response.message.tool_calls {
                let outcome = registry.execute(&call.name, call.arguments.clone(), ctx).await;
                let rendered = outcome.render();
                recent_tool_outputs.push(rendered.clone());
                if recent_tool_outputs.len() > SALVAGE_WINDOW {
                    recent_tool_outputs.remove(0);
                }
                messages.push(Message::tool_result(call.id.clone(), rendered));
            }
        }

        debug!(task = %request.task, "sub-agent exhausted its turn budget");
        self.salvage(&request.task, &recent_tool_outputs, max_turns, usage)
            .await
    }

    /// Synthesise a summary from recent tool outputs when the sub-agent
    /// exited without a marker; fall back to truncating the last output.
    async fn salvage(
        &self,
        task: &str,
        recent_tool_outputs: &[String],
        turns: u32,
        mut usage: TokenUsage,
    ) -> SubAgentOutcome {
        if recent_tool_outputs.is_empty() {
            return SubAgentOutcome::error(
                format!("sub-agent produced no output for task: {task}"),
                turns,
                usage,
            );
        }

        let joined = recent_tool_outputs.join("\n---\n");
        let prompt = vec![
            Message::system(
                "Summarise the following tool outputs into a short factual report. \
                 Do not speculate beyond what the outputs show.",
            ),
            Message::user(truncate_with_marker(&joined, 30_000)),
        ];
        match self.client.chat(&prompt, &[], ToolChoice::None).await {
            Ok(response) => {
                usage.add(&response.usage);
                let result = sanitize_result(
                    &response.message.content,
                    self.config.subagent_truncate_limit,
                );
                SubAgentOutcome::incomplete(
                    result,
                    "summary synthesised from tool outputs".to_string(),
                    turns,
                    usage,
                )
            }
            Err(e) => {
                warn!(error = %e, "salvage summarisation failed, truncating last output");
                let last = recent_tool_outputs.last().expect("non-empty");
                SubAgentOutcome::incomplete(
                    sanitize_result(last, self.config.subagent_truncate_limit),
                    "truncated last tool output".to_string(),
                    turns,
                    usage,
                )
            }
        }
    }

    /// Size-bound and sanitise the final result, compressing oversized
    /// results with one summarisation pass before giving up and truncating.
    async fn finalize(&self, result: String, _ctx: &ToolContext) -> String {
        let limit = self.config.subagent_truncate_limit;
        if result.len() <= limit {
            return sanitize_result(&result, limit);
        }
        let prompt = vec![
            Message::system(format!(
                "Compress this report to under {limit} bytes, keeping every concrete finding."
            )),
            Message::user(truncate_with_marker(&result, limit * 4)),
        ];
        match self.client.chat(&prompt, &[], ToolChoice::None).await {
            Ok(response) if response.message.content.len() <= limit => {
                sanitize_result(&response.message.content, limit)
            }
            _ => sanitize_result(&result, limit),
        }
    }
}

/// Sanitise a sub-agent result: collapse repeated lines, strip control
/// characters, unwrap JSON-wrapped commands, and bound the size.
fn sanitize_result(result: &str, limit: usize) -> String {
    let unwrapped = unwrap_json_command(result);
    let collapsed = collapse_repeated_lines(&unwrapped);
    let stripped = strip_control_chars(&collapsed);
    truncate_with_marker(&stripped, limit)
}

/// Text after the trailing `## Summary` marker, or the whole content.
fn extract_summary(content: &str) -> String {
    match content.rfind(SUMMARY_MARKER) {
        Some(idx) => content[idx + SUMMARY_MARKER.len()..].trim().to_string(),
        None => content.trim().to_string(),
    }
}

/// The reason following a `CONTINUE:` marker, if present.
fn extract_continue_reason(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        line.trim()
            .strip_prefix(CONTINUE_MARKER)
            .map(|reason| reason.trim().to_string())
    })
}

/// The `SubAgent` tool exposed to parent agents.
pub struct SubAgentTool {
    executor: Arc<SubAgentExecutor>,
}

impl SubAgentTool {
    pub fn new(executor: Arc<SubAgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for SubAgentTool {
    async fn call(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolOutcome {
        let request = SubAgentRequest {
            task: args["task"].as_str().unwrap_or_default().to_string(),
            input: args["input"].as_str().unwrap_or_default().to_string(),
        };
        if request.task.is_empty() {
            return ToolOutcome::error("SubAgent requires a non-empty task");
        }
        let outcome = self.executor.run(&request, ctx).await;
        match serde_json::to_value(&outcome) {
            Ok(mut value) => {
                // Echo the task so the parent loop can attribute the result.
                value["task"] = serde_json::Value::String(request.task);
                ToolOutcome::ok(value)
            }
            Err(e) => ToolOutcome::error(format!("cannot serialise sub-agent outcome: {e}")),
        }
    }
}

/// Register the `SubAgent` tool backed by an executor.
pub fn register_subagent_tool(
    registry: &mut ToolRegistry,
    executor: Arc<SubAgentExecutor>,
) -> Result<(), crate::errors::KernelError> {
    registry.register(
        "SubAgent",
        "Delegate a focused subtask to a bounded sub-agent and receive a textual summary.",
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "Short identity of the subtask"},
                "input": {"type": "string", "description": "The focused question to investigate"}
            },
            "required": ["task", "input"]
        }),
        Arc::new(SubAgentTool::new(executor)),
    )
}
