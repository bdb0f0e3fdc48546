//! The agent execution loop.
//!
//! Drives one bounded LLM conversation for one agent: builds messages,
//! calls the endpoint, extracts and dispatches tool calls (native and
//! smuggled), enforces budgets, detects loops, and refuses to terminate
//! until the agent's required deliverables exist. Termination is explicit
//! completion, turn exhaustion, or an irrecoverable error; everything else
//! is a nudge and another turn.

pub mod compress;
pub mod extract;
pub mod loop_detect;
pub mod mission;
pub mod nudges;
pub mod repair;

use crate::audit::{AuditLog, EventKind};
use crate::config::KernelConfig;
use crate::deliverables;
use crate::errors::LlmError;
use crate::llm::{ChatClient, Message, TokenUsage, ToolChoice};
use crate::pipeline;
use crate::subagent::SubAgentOutcome;
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};
use loop_detect::LoopDetector;
use nudges::NudgeSchedule;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Extra turns granted past the budget when deliverables are still owed.
const GRACE_TURNS: u32 = 5;

/// Silence nudges tolerated before the run fails.
const MAX_SILENCE_NUDGES: u32 = 2;

/// Observable events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Init { agent: String, max_turns: u32 },
    Assistant { turn: u32, content: String },
    ToolUse { turn: u32, tool: String },
    ToolResult { turn: u32, tool: String, ok: bool },
    Result { success: bool, turns: u32 },
}

/// Outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub success: bool,
    pub turns: u32,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub saved_types: BTreeSet<String>,
    pub error: Option<String>,
}

/// Drives agent conversations against a registry and an audit log.
pub struct AgentRunner {
    client: Arc<dyn ChatClient>,
    config: Arc<KernelConfig>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl AgentRunner {
    pub fn new(client: Arc<dyn ChatClient>, config: Arc<KernelConfig>) -> Self {
        Self {
            client,
            config,
            events: None,
        }
    }

    /// Attach an event channel for progress observation.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run one agent conversation to completion.
    pub async fn run(
        &self,
        agent: &str,
        registry: &ToolRegistry,
        ctx: &ToolContext,
        audit: &AuditLog,
        system_prompt: &str,
        user_prompt: &str,
    ) -> AgentRunResult {
        let started = Instant::now();
        let max_turns = self.config.max_turns_for(agent);
        let hard_limit = max_turns + GRACE_TURNS;
        self.emit(AgentEvent::Init {
            agent: agent.to_string(),
            max_turns,
        });
        let _ = audit.log_event(
            EventKind::AttemptStart,
            Some(agent),
            json!({"max_turns": max_turns}),
        );

        // Mission persistence: seed the todo and inject a resume block
        // when earlier progress exists on disk.
        if let Err(e) = mission::ensure_todo(&ctx.workspace, agent) {
            warn!(agent, error = %e, "cannot seed mission todo");
        }
        let mut messages = vec![Message::system(system_prompt), Message::user(user_prompt)];
        if let Some(resume) = mission::resume_block(&ctx.workspace, agent) {
            messages.push(Message::system(resume));
        }

        let catalog = registry.as_llm_catalog();
        let mut usage = TokenUsage::default();
        let mut saved_types: BTreeSet<String> = BTreeSet::new();
        let mut schedule = NudgeSchedule::new();
        let mut detector = LoopDetector::new(agent);
        let mut silence_count = 0u32;
        let mut turn = 0u32;

        loop {
            turn += 1;
            if turn > hard_limit {
                let missing = deliverables::missing_types(agent, &saved_types);
                let error = if missing.is_empty() {
                    format!("turn budget exhausted after {} turns", turn - 1)
                } else {
                    format!(
                        "no progress: deliverables still missing after grace turns: {}",
                        missing.join(", ")
                    )
                };
                return self.finish(agent, audit, started, turn - 1, usage, saved_types, Some(error));
            }

            // Budget nudges, at fixed fractions of the nominal budget.
            if let Some(nudge) = schedule.due(turn, max_turns) {
                messages.push(Message::system(nudge));
            }

            // Compression when the serialized transcript outgrows the limit.
            if compress::transcript_size(&messages) > self.config.compression_threshold {
                let window = if pipeline::is_exploitation_agent(agent) {
                    self.config.compression_window * 2
                } else {
                    self.config.compression_window
                };
                let marker = mission::status_marker(&ctx.workspace, agent);
                messages = compress::compress_history(&messages, window, &marker);
                debug!(agent, turn, "compressed transcript");
            }

            // The prompt window never exceeds the configured budget.
            let window = compress::prepare_messages(&messages, self.config.max_prompt_chars);
            let _ = audit.log_event(
                EventKind::PromptSize,
                Some(agent),
                json!({"turn": turn, "chars": compress::transcript_size(&window)}),
            );

            let response = match self.chat_with_recovery(&window, &catalog).await {
                Ok(response) => response,
                Err(e) => {
                    return self.finish(
                        agent,
                        audit,
                        started,
                        turn,
                        usage,
                        saved_types,
                        Some(format!("LLM call failed: {e}")),
                    );
                }
            };
            usage.add(&response.usage);

            // Native calls plus any smuggled in the content.
            let mut calls = response.message.tool_calls.clone();
            calls.extend(extract::extract_smuggled_calls(
                &response.message.content,
                calls.len(),
            ));

            self.emit(AgentEvent::Assistant {
                turn,
                content: response.message.content.clone(),
            });

            if calls.is_empty() {
                if response.message.content.trim().is_empty() {
                    silence_count += 1;
                    if silence_count > MAX_SILENCE_NUDGES {
                        return self.finish(
                            agent,
                            audit,
                            started,
                            turn,
                            usage,
                            saved_types,
                            Some("stuck in silence".to_string()),
                        );
                    }
                    messages.push(Message::system(nudges::silence_nudge(silence_count)));
                    continue;
                }
                silence_count = 0;

                // Natural stop: only acceptable with the deliverables written.
                let missing = deliverables::missing_types(agent, &saved_types);
                if missing.is_empty() {
                    messages.push(response.message.clone());
                    return self.finish(agent, audit, started, turn, usage, saved_types, None);
                }
                messages.push(response.message.clone());
                messages.push(Message::system(nudges::deliverable_nudge(agent, &missing)));
                info!(agent, turn, ?missing, "termination refused, deliverables missing");
                continue;
            }
            silence_count = 0;

            // Record the assistant turn with its full call set so results
            // line up, then run the pre-execute policy and dispatch.
            let mut assistant = response.message.clone();
            assistant.tool_calls = calls.clone();
            messages.push(assistant);

            let loop_reason = detector.observe(&calls);

            for call in &calls {
                let canonical = registry.canonical_name(&call.name);
                let mut arguments = call.arguments.clone();

                // Pre-execute policy, by canonical tool.
                let policy_block = match canonical.as_str() {
                    "save_deliverable" => {
                        if let Some(requested) =
                            arguments.get("deliverable_type").and_then(|t| t.as_str())
                        {
                            let coerced = deliverables::coerce_type(agent, requested);
                            arguments["deliverable_type"] = json!(coerced);
                        }
                        None
                    }
                    "bash" => {
                        if let Some(command) = arguments.get("command").and_then(|c| c.as_str()) {
                            let sanitized = extract::sanitize_bash_command(command);
                            arguments["command"] = json!(sanitized.clone());
                            self.api_fuzzer_block(agent, &sanitized, ctx)
                        } else {
                            None
                        }
                    }
                    "SubAgent" => {
                        let task = arguments.get("task").and_then(|t| t.as_str()).unwrap_or("");
                        if !task.is_empty()
                            && mission::load_done_tasks(&ctx.workspace, agent).contains(task)
                        {
                            Some(ToolOutcome::text(format!(
                                "Task already complete this session: {task}. See the \
                                 finding files under deliverables/findings/{agent}/."
                            )))
                        } else {
                            None
                        }
                    }
                    _ => None,
                };

                self.emit(AgentEvent::ToolUse {
                    turn,
                    tool: canonical.clone(),
                });
                let _ = audit.log_event(
                    EventKind::ToolCall,
                    Some(agent),
                    json!({"turn": turn, "tool": canonical.clone(), "args": arguments.clone()}),
                );

                let outcome = match policy_block {
                    Some(outcome) => outcome,
                    None => registry.execute(&call.name, arguments, ctx).await,
                };

                let rendered = self.post_process(agent, &canonical, &outcome, &mut saved_types, ctx);
                let _ = audit.log_event(
                    EventKind::ToolResult,
                    Some(agent),
                    json!({"turn": turn, "tool": canonical.clone(), "ok": outcome.is_ok()}),
                );
                self.emit(AgentEvent::ToolResult {
                    turn,
                    tool: canonical,
                    ok: outcome.is_ok(),
                });
                messages.push(Message::tool_result(call.id.clone(), rendered));
            }

            // After the turn's results are in, so tool messages stay
            // adjacent to the assistant message that requested them.
            if let Some(reason) = loop_reason {
                messages.push(Message::system(nudges::loop_nudge(&reason)));
            }
        }
    }

    /// Refuse localhost traffic from an api-fuzzer whose target is remote.
    fn api_fuzzer_block(
        &self,
        agent: &str,
        command: &str,
        ctx: &ToolContext,
    ) -> Option<ToolOutcome> {
        if agent == "api-fuzzer"
            && extract::command_targets_localhost(command)
            && !extract::target_is_local(&ctx.target)
        {
            return Some(ToolOutcome::error_with_exit(
                format!(
                    "Blocked: api-fuzzer must use target {} rather than localhost",
                    ctx.target
                ),
                2,
            ));
        }
        None
    }

    /// One chat call, recovering once from a server-side tool-call parse
    /// error by retrying with `tool_choice=none` and a fenced-JSON hint.
    async fn chat_with_recovery(
        &self,
        window: &[Message],
        catalog: &[crate::llm::FunctionDeclaration],
    ) -> Result<crate::llm::ChatResponse, LlmError> {
        match self.client.chat(window, catalog, ToolChoice::Auto).await {
            Ok(response) => Ok(response),
            Err(LlmError::MalformedResponse(first)) => {
                debug!(error = %first, "tool-call parse error, retrying with tool_choice=none");
                let mut retry_window = window.to_vec();
                retry_window.push(Message::system(
                    "Your previous tool call could not be parsed. Reply with exactly one \
                     tool call as a fenced ```json block containing the tool arguments.",
                ));
                self.client
                    .chat(&retry_window, catalog, ToolChoice::None)
                    .await
            }
            Err(other) => Err(other),
        }
    }

    /// Side effects after a tool outcome, returning the transcript text.
    fn post_process(
        &self,
        agent: &str,
        canonical: &str,
        outcome: &ToolOutcome,
        saved_types: &mut BTreeSet<String>,
        ctx: &ToolContext,
    ) -> String {
        let ToolOutcome::Ok { value } = outcome else {
            return outcome.render();
        };

        match canonical {
            "save_deliverable" => {
                if let Some(saved) = value.get("deliverable_type").and_then(|t| t.as_str()) {
                    saved_types.insert(saved.to_string());
                }
                outcome.render()
            }
            "SubAgent" => {
                if let Ok(sub) = serde_json::from_value::<SubAgentOutcome>(value.clone()) {
                    if sub.is_complete {
                        // Persist the finding and tick the matching todo line.
                        if let Some(task) = extract_task_from_value(value) {
                            let _ = mission::add_done_task(&ctx.workspace, agent, &task);
                            let _ =
                                mission::persist_finding(&ctx.workspace, agent, &task, &sub.result);
                            let _ = mission::tick_best_match(&ctx.workspace, agent, &task);
                        }
                    }
                    return sub.result;
                }
                outcome.render()
            }
            "read_file" => {
                let content = value.get("content").and_then(|c| c.as_str()).unwrap_or("");
                let source = value.get("path").and_then(|p| p.as_str()).unwrap_or("");
                if content.len() > mission::STAGE_THRESHOLD && !source.is_empty() {
                    if let Some(staged) = mission::staged_path_for(&ctx.workspace, agent, source) {
                        return format!(
                            "[served from stage: {}]\n{}",
                            staged.display(),
                            crate::util::truncate_with_marker(content, 1_000)
                        );
                    }
                    match mission::stage_large_output(&ctx.workspace, agent, source, content) {
                        Ok(staged) => {
                            return format!(
                                "[staged to {}]\n{}",
                                staged.display(),
                                crate::util::truncate_with_marker(content, 1_000)
                            );
                        }
                        Err(e) => warn!(agent, error = %e, "staging failed"),
                    }
                }
                outcome.render()
            }
            _ => outcome.render(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        agent: &str,
        audit: &AuditLog,
        started: Instant,
        turns: u32,
        usage: TokenUsage,
        saved_types: BTreeSet<String>,
        error: Option<String>,
    ) -> AgentRunResult {
        let success = error.is_none();
        self.emit(AgentEvent::Result { success, turns });
        if let Some(e) = &error {
            warn!(agent, turns, error = %e, "agent run failed");
        } else {
            info!(agent, turns, "agent run complete");
        }
        let _ = audit.log_event(
            EventKind::StatusTransition,
            Some(agent),
            json!({
                "result": if success { "complete" } else { "failed" },
                "turns": turns,
                "error": error,
            }),
        );
        AgentRunResult {
            success,
            turns,
            usage,
            duration_ms: started.elapsed().as_millis() as u64,
            saved_types,
            error,
        }
    }
}

/// The `task` a SubAgent outcome belonged to, recovered from the request
/// echo the handler embeds.
fn extract_task_from_value(value: &serde_json::Value) -> Option<String> {
    value
        .get("task")
        .and_then(|t| t.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, FunctionDeclaration, ToolCallRequest};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<ChatResponse, LlmError>>>,
        seen_windows: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(mut responses: Vec<Result<ChatResponse, LlmError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen_windows: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[FunctionDeclaration],
            _tool_choice: ToolChoice,
        ) -> Result<ChatResponse, LlmError> {
            self.seen_windows.lock().unwrap().push(messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LlmError::Connection("script exhausted".into())))
        }
    }

    fn assistant(content: &str) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse {
            message: Message::assistant(content),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
            },
            finish_reason: Some("stop".into()),
        })
    }

    fn tool_turn(name: &str, args: serde_json::Value) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse {
            message: Message::assistant_with_calls(
                "",
                vec![ToolCallRequest {
                    id: "c-1".into(),
                    name: name.into(),
                    arguments: args,
                }],
            ),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 10,
            },
            finish_reason: Some("tool_calls".into()),
        })
    }

    struct Fixture {
        runner: AgentRunner,
        registry: ToolRegistry,
        ctx: ToolContext,
        audit: AuditLog,
        client: Arc<ScriptedClient>,
        _dir: TempDir,
    }

    fn fixture(agent: &str, responses: Vec<Result<ChatResponse, LlmError>>) -> Fixture {
        fixture_with_target(agent, "https://203.0.113.10:8080", responses)
    }

    fn fixture_with_target(
        agent: &str,
        target: &str,
        responses: Vec<Result<ChatResponse, LlmError>>,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(KernelConfig::default());
        let client = Arc::new(ScriptedClient::new(responses));
        let runner = AgentRunner::new(client.clone(), config.clone());
        let registry = ToolRegistry::with_core_tools().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf(), agent, target, config);
        let audit = AuditLog::new(&dir.path().join("audit"));
        Fixture {
            runner,
            registry,
            ctx,
            audit,
            client,
            _dir: dir,
        }
    }

    async fn run(f: &Fixture, agent: &str) -> AgentRunResult {
        f.runner
            .run(agent, &f.registry, &f.ctx, &f.audit, "you are an assessor", "begin")
            .await
    }

    #[tokio::test]
    async fn test_ungated_agent_completes_on_natural_stop() {
        let f = fixture("pre-recon", vec![assistant("All surveyed. Done.")]);
        let result = run(&f, "pre-recon").await;
        assert!(result.success);
        assert_eq!(result.turns, 1);
        assert_eq!(result.usage.total(), 110);
    }

    #[tokio::test]
    async fn test_deliverable_enforcement_grants_grace_turns() {
        // Scenario S4: an analysis agent stops with only the ANALYSIS saved.
        let f = fixture(
            "sqli-vuln",
            vec![
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "SQLI_ANALYSIS", "content": "# notes"}),
                ),
                assistant("I consider the work complete."), // refused
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "SQLI_QUEUE", "content": "[]"}),
                ),
                assistant("Both deliverables saved."),
            ],
        );
        let result = run(&f, "sqli-vuln").await;
        assert!(result.success);
        assert!(result.saved_types.contains("SQLI_ANALYSIS"));
        assert!(result.saved_types.contains("SQLI_QUEUE"));

        // The refusal injected a critical nudge naming the missing type.
        let windows = f.client.seen_windows.lock().unwrap();
        let saw_nudge = windows.iter().flatten().any(|m| {
            m.content.contains("[CRITICAL]") && m.content.contains("SQLI_QUEUE")
        });
        assert!(saw_nudge, "critical nudge must name the missing queue");
    }

    #[tokio::test]
    async fn test_deliverable_type_coercion_applies_before_dispatch() {
        let f = fixture(
            "sqli-vuln",
            vec![
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "XSS_ANALYSIS", "content": "misfiled"}),
                ),
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "SQLI_QUEUE", "content": "[]"}),
                ),
                assistant("done"),
            ],
        );
        let result = run(&f, "sqli-vuln").await;
        assert!(result.success);
        // The misfiled type was coerced to the agent's own family.
        assert!(result.saved_types.contains("SQLI_ANALYSIS"));
        assert!(!result.saved_types.contains("XSS_ANALYSIS"));
        assert!(f.ctx.workspace.join("deliverables/sqli_analysis.md").exists());
    }

    #[tokio::test]
    async fn test_api_fuzzer_localhost_block() {
        // Scenario S5: remote target, localhost command.
        let f = fixture(
            "api-fuzzer",
            vec![
                tool_turn("bash", json!({"command": "curl http://localhost:8080/api/users"})),
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "FUZZING_ANALYSIS", "content": "x"}),
                ),
                assistant("done"),
            ],
        );
        let result = run(&f, "api-fuzzer").await;
        assert!(result.success);

        // The block surfaced to the agent as an error tool result.
        let windows = f.client.seen_windows.lock().unwrap();
        let saw_block = windows.iter().flatten().any(|m| {
            m.role == crate::llm::Role::Tool
                && m.content.contains("Blocked: api-fuzzer must use target")
                && m.content.contains("exit code 2")
        });
        assert!(saw_block);

        // And the refusal is in the audit log.
        let events = f.audit.events().unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::ToolResult
            && e.payload["tool"] == "bash"
            && e.payload["ok"] == false));
    }

    #[tokio::test]
    async fn test_api_fuzzer_local_target_not_blocked() {
        let f = fixture_with_target(
            "api-fuzzer",
            "http://127.0.0.1:3000",
            vec![
                tool_turn("bash", json!({"command": "curl -s http://localhost:3000/api || true"})),
                tool_turn(
                    "save_deliverable",
                    json!({"deliverable_type": "FUZZING_ANALYSIS", "content": "x"}),
                ),
                assistant("done"),
            ],
        );
        let result = run(&f, "api-fuzzer").await;
        assert!(result.success);
        let windows = f.client.seen_windows.lock().unwrap();
        assert!(!windows.iter().flatten().any(|m| m.content.contains("Blocked:")));
    }

    #[tokio::test]
    async fn test_smuggled_fenced_call_is_dispatched() {
        let f = fixture(
            "pre-recon",
            vec![
                assistant("Running a check:\n```json\n{\"command\": \"echo smuggled\"}\n```"),
                assistant("Finished."),
            ],
        );
        let result = run(&f, "pre-recon").await;
        assert!(result.success);
        assert_eq!(result.turns, 2);
        let windows = f.client.seen_windows.lock().unwrap();
        let saw_output = windows
            .iter()
            .flatten()
            .any(|m| m.role == crate::llm::Role::Tool && m.content.contains("smuggled"));
        assert!(saw_output, "smuggled call must execute and report back");
    }

    #[tokio::test]
    async fn test_hallucinated_prefix_stripped() {
        let f = fixture(
            "pre-recon",
            vec![
                tool_turn("bash", json!({"command": "bash: echo cleaned"})),
                assistant("done"),
            ],
        );
        let result = run(&f, "pre-recon").await;
        assert!(result.success);
        let windows = f.client.seen_windows.lock().unwrap();
        let saw = windows
            .iter()
            .flatten()
            .any(|m| m.role == crate::llm::Role::Tool && m.content.contains("cleaned"));
        assert!(saw);
    }

    #[tokio::test]
    async fn test_silence_fails_after_two_nudges() {
        let f = fixture(
            "pre-recon",
            vec![assistant(""), assistant(""), assistant("")],
        );
        let result = run(&f, "pre-recon").await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("stuck in silence"));

        let windows = f.client.seen_windows.lock().unwrap();
        let nudge_count = windows
            .last()
            .unwrap()
            .iter()
            .filter(|m| m.content.contains("[SILENCE]"))
            .count();
        assert_eq!(nudge_count, 2);
    }

    #[tokio::test]
    async fn test_loop_detection_injects_nudge() {
        // Scenario S3: the same search three turns running.
        let search = || tool_turn("search_files", json!({"query": "auth", "path": "."}));
        let f = fixture(
            "pre-recon",
            vec![search(), search(), search(), assistant("synthesising now")],
        );
        let result = run(&f, "pre-recon").await;
        assert!(result.success);

        let windows = f.client.seen_windows.lock().unwrap();
        // The fourth call's window carries the loop nudge.
        let final_window = windows.last().unwrap();
        assert!(
            final_window
                .iter()
                .any(|m| m.content.contains("[LOOP DETECTION]")),
            "loop nudge must be present on the next turn"
        );
    }

    #[tokio::test]
    async fn test_budget_nudges_fire_for_agents() {
        let mut config = KernelConfig::default();
        config.max_turns = 4;
        let config = Arc::new(config);
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            tool_turn("bash", json!({"command": "true"})),
            tool_turn("bash", json!({"command": "true"})),
            tool_turn("bash", json!({"command": "true"})),
            assistant("done"),
        ]));
        let runner = AgentRunner::new(client.clone(), config.clone());
        let registry = ToolRegistry::with_core_tools().unwrap();
        let ctx = ToolContext::new(
            dir.path().to_path_buf(),
            "pre-recon",
            "https://t.example.com",
            config,
        );
        let audit = AuditLog::new(&dir.path().join("audit"));
        let result = runner
            .run("pre-recon", &registry, &ctx, &audit, "sys", "go")
            .await;
        assert!(result.success);

        let windows = client.seen_windows.lock().unwrap();
        let saw_budget = windows.iter().flatten().any(|m| m.content.contains("[BUDGET]"));
        assert!(saw_budget, "budget nudges must fire on a 4-turn budget");
    }

    #[tokio::test]
    async fn test_large_read_is_staged_then_served_from_stage() {
        let f = fixture("pre-recon", vec![]);
        let big = "line of source\n".repeat(400); // > 3000 bytes
        std::fs::write(f.ctx.workspace.join("big.py"), &big).unwrap();

        let responses = vec![
            tool_turn("read_file", json!({"path": "big.py"})),
            tool_turn("read_file", json!({"path": "big.py"})),
            assistant("done"),
        ];
        *f.client.responses.lock().unwrap() = {
            let mut r = responses;
            r.reverse();
            r
        };

        let result = run(&f, "pre-recon").await;
        assert!(result.success);

        let windows = f.client.seen_windows.lock().unwrap();
        let tool_messages: Vec<&Message> = windows
            .last()
            .unwrap()
            .iter()
            .filter(|m| m.role == crate::llm::Role::Tool)
            .collect();
        assert!(tool_messages[0].content.starts_with("[staged to"));
        assert!(tool_messages[1].content.starts_with("[served from stage:"));
        // The staged file exists on disk.
        assert!(
            mission::staged_path_for(&f.ctx.workspace, "pre-recon", "big.py").is_some()
        );
    }

    #[tokio::test]
    async fn test_malformed_tool_call_retries_with_fenced_hint() {
        let f = fixture(
            "pre-recon",
            vec![
                Err(LlmError::MalformedResponse("bad tool json".into())),
                assistant("recovered and done"),
            ],
        );
        let result = run(&f, "pre-recon").await;
        assert!(result.success);
        assert_eq!(result.turns, 1);

        let windows = f.client.seen_windows.lock().unwrap();
        assert_eq!(windows.len(), 2);
        let retry_window = windows.last().unwrap();
        assert!(
            retry_window
                .iter()
                .any(|m| m.content.contains("fenced ```json block"))
        );
    }

    #[tokio::test]
    async fn test_fatal_llm_error_fails_run() {
        let f = fixture("pre-recon", vec![Err(LlmError::Auth("bad key".into()))]);
        let result = run(&f, "pre-recon").await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("LLM call failed"));
    }

    #[tokio::test]
    async fn test_turn_budget_exhaustion_with_missing_deliverables() {
        let mut config = KernelConfig::default();
        config.max_turns = 2;
        let config = Arc::new(config);
        let dir = TempDir::new().unwrap();
        let mut responses = Vec::new();
        for _ in 0..(2 + GRACE_TURNS + 1) {
            responses.push(tool_turn("bash", json!({"command": "true"})));
        }
        let client = Arc::new(ScriptedClient::new(responses));
        let runner = AgentRunner::new(client, config.clone());
        let registry = ToolRegistry::with_core_tools().unwrap();
        let ctx = ToolContext::new(
            dir.path().to_path_buf(),
            "sqli-vuln",
            "https://t.example.com",
            config,
        );
        let audit = AuditLog::new(&dir.path().join("audit"));
        let result = runner.run("sqli-vuln", &registry, &ctx, &audit, "sys", "go").await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("no progress"));
        assert!(error.contains("SQLI_ANALYSIS"));
    }

    #[tokio::test]
    async fn test_resume_block_injected_when_mission_has_progress() {
        let f = fixture("pre-recon", vec![assistant("done")]);
        mission::ensure_todo(&f.ctx.workspace, "pre-recon").unwrap();
        mission::tick_best_match(&f.ctx.workspace, "pre-recon", "survey the target surface")
            .unwrap();

        let result = run(&f, "pre-recon").await;
        assert!(result.success);
        let windows = f.client.seen_windows.lock().unwrap();
        assert!(
            windows[0].iter().any(|m| m.content.starts_with("[RESUME]")),
            "resume block must be in the first window"
        );
    }

    #[tokio::test]
    async fn test_mission_todo_seeded_on_first_turn() {
        let f = fixture("sqli-vuln", vec![
            tool_turn("save_deliverable", json!({"deliverable_type": "SQLI_ANALYSIS", "content": "x"})),
            tool_turn("save_deliverable", json!({"deliverable_type": "SQLI_QUEUE", "content": "[]"})),
            assistant("done"),
        ]);
        run(&f, "sqli-vuln").await;
        assert!(
            f.ctx
                .workspace
                .join("deliverables/findings/sqli-vuln/todo.txt")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_audit_trail_records_calls_and_results() {
        let f = fixture(
            "pre-recon",
            vec![tool_turn("bash", json!({"command": "echo x"})), assistant("done")],
        );
        run(&f, "pre-recon").await;
        let events = f.audit.events().unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::AttemptStart));
        assert!(events.iter().any(|e| e.kind == EventKind::ToolCall));
        assert!(events.iter().any(|e| e.kind == EventKind::ToolResult));
        assert!(events.iter().any(|e| e.kind == EventKind::PromptSize));
    }
}
