//! Phase scheduler: fixed phase order, prerequisites, bounded fan-out.
//!
//! Phases run in `PHASE_ORDER`. Sequential phases run their agents
//! strictly in order; the two fan-out phases (vulnerability-analysis and
//! exploitation) run eligible agents under a semaphore. An agent whose
//! prerequisites are not all completed is skipped, not failed; a failed
//! agent never aborts its phase, and the reporting phase is always
//! attempted.

use crate::agent_loop::AgentRunner;
use crate::audit::AttemptStatus;
use crate::deliverables;
use crate::errors::KernelError;
use crate::kernel::Kernel;
use crate::pipeline::{self, AgentSpec, PHASE_ORDER, PhaseKind};
use crate::session::Session;
use crate::tools::{ToolContext, ToolRegistry};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct PhaseScheduler {
    kernel: Arc<Kernel>,
}

/// What happened to one agent inside a phase run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentDisposition {
    Completed,
    Failed,
    Skipped,
    AlreadyDone,
}

/// Summary of a phase or pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl RunSummary {
    fn absorb(&mut self, agent: &str, disposition: &AgentDisposition) {
        match disposition {
            AgentDisposition::Completed => self.completed.push(agent.to_string()),
            AgentDisposition::Failed => self.failed.push(agent.to_string()),
            AgentDisposition::Skipped => self.skipped.push(agent.to_string()),
            AgentDisposition::AlreadyDone => {}
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.completed.extend(other.completed);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }
}

impl PhaseScheduler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Run every phase of the session's pipeline in order.
    ///
    /// Earlier failures never stop the walk; the reporting phase always
    /// gets its attempt.
    pub async fn run_all(&self, session_id: &str) -> Result<RunSummary, KernelError> {
        // One registry for the whole pipeline: remote tool-server proxies
        // are long-lived and shared across agents.
        let registry = Arc::new(self.kernel.build_registry().await?);
        let mut summary = RunSummary::default();
        for phase in PHASE_ORDER {
            let phase_summary = self
                .run_phase_with(phase, session_id, registry.clone())
                .await?;
            summary.merge(phase_summary);
        }
        Ok(summary)
    }

    /// Run one phase: compute eligible agents, honor prerequisites, and
    /// execute sequentially or fanned out by phase kind.
    pub async fn run_phase(
        &self,
        phase: PhaseKind,
        session_id: &str,
    ) -> Result<RunSummary, KernelError> {
        let registry = Arc::new(self.kernel.build_registry().await?);
        self.run_phase_with(phase, session_id, registry).await
    }

    async fn run_phase_with(
        &self,
        phase: PhaseKind,
        session_id: &str,
        registry: Arc<ToolRegistry>,
    ) -> Result<RunSummary, KernelError> {
        let session = self.session(session_id).await?;
        let agents = pipeline::agents_in_phase(session.pipeline, phase);
        let mut summary = RunSummary::default();
        if agents.is_empty() {
            return Ok(summary);
        }
        info!(phase = %phase, count = agents.len(), "running phase");

        if phase.is_fan_out() {
            let semaphore = Arc::new(Semaphore::new(self.kernel.config.parallel_limit));
            let mut handles = Vec::new();
            for agent in agents {
                let semaphore = semaphore.clone();
                let kernel = self.kernel.clone();
                let registry = registry.clone();
                let session_id = session_id.to_string();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let scheduler = PhaseScheduler::new(kernel);
                    let disposition = scheduler
                        .run_agent_spec(agent, &registry, &session_id)
                        .await;
                    (agent.name.to_string(), disposition)
                }));
            }
            for handle in handles {
                let (name, disposition) = handle
                    .await
                    .map_err(|e| KernelError::Other(anyhow::anyhow!("agent task panicked: {e}")))?;
                summary.absorb(&name, &disposition?);
            }
        } else {
            for agent in agents {
                let disposition = self.run_agent_spec(agent, &registry, session_id).await?;
                summary.absorb(agent.name, &disposition);
            }
        }
        Ok(summary)
    }

    /// Run one agent by name, regardless of phase membership.
    pub async fn run_agent(
        &self,
        agent_name: &str,
        session_id: &str,
    ) -> Result<AgentDisposition, KernelError> {
        let session = self.session(session_id).await?;
        let spec = pipeline::get_agent(session.pipeline, agent_name).ok_or_else(|| {
            KernelError::UnknownAgent {
                name: agent_name.to_string(),
            }
        })?;
        let registry = Arc::new(self.kernel.build_registry().await?);
        self.run_agent_spec(spec, &registry, session_id).await
    }

    async fn session(&self, session_id: &str) -> Result<Session, KernelError> {
        self.kernel
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| KernelError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    /// The per-agent wrapper: eligibility, prerequisites, markRunning →
    /// loop → markCompleted+checkpoint / markFailed, audit attempt.
    async fn run_agent_spec(
        &self,
        spec: &AgentSpec,
        registry: &ToolRegistry,
        session_id: &str,
    ) -> Result<AgentDisposition, KernelError> {
        let session = self.session(session_id).await?;
        let audit = self.kernel.audit_for(&session);

        if session.completed_agents.contains(spec.name) || session.skipped_agents.contains(spec.name)
        {
            return Ok(AgentDisposition::AlreadyDone);
        }

        let unmet: Vec<&str> = spec
            .prerequisites
            .iter()
            .filter(|p| !session.completed_agents.contains(**p))
            .copied()
            .collect();
        if !unmet.is_empty() {
            warn!(agent = spec.name, ?unmet, "prerequisites unmet, skipping");
            self.kernel.store.mark_skipped(session_id, spec.name).await?;
            let _ = audit.log_event(
                crate::audit::EventKind::StatusTransition,
                Some(spec.name),
                serde_json::json!({"action": "skipped", "unmet": unmet}),
            );
            return Ok(AgentDisposition::Skipped);
        }

        self.kernel.store.mark_running(session_id, spec.name).await?;
        let started_at = Utc::now();

        let ctx = ToolContext::new(
            session.workspace.clone(),
            spec.name,
            session.target.clone(),
            self.kernel.config.clone(),
        );
        let runner = AgentRunner::new(self.kernel.client.clone(), self.kernel.config.clone());
        let result = runner
            .run(
                spec.name,
                registry,
                &ctx,
                &audit,
                &system_prompt(spec, &session),
                &user_prompt(spec, &session),
            )
            .await;

        let cost = self
            .kernel
            .config
            .cost_usd(result.usage.prompt_tokens, result.usage.completion_tokens);

        if result.success {
            let checkpoint = match self.kernel.checkpoints.snapshot(&session) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(agent = spec.name, error = %e, "checkpoint failed");
                    None
                }
            };
            self.kernel
                .store
                .mark_completed(session_id, spec.name, checkpoint.clone())
                .await?;
            self.kernel
                .store
                .update(session_id, |s| {
                    s.timing_breakdown
                        .insert(spec.name.to_string(), result.duration_ms);
                    s.cost_breakdown.insert(spec.name.to_string(), cost);
                })
                .await?;
            audit
                .record_attempt(
                    spec.name,
                    started_at,
                    Utc::now(),
                    AttemptStatus::Success,
                    checkpoint,
                    cost,
                    Some(result.usage),
                )
                .map_err(KernelError::Other)?;
            Ok(AgentDisposition::Completed)
        } else {
            self.kernel.store.mark_failed(session_id, spec.name).await?;
            audit
                .record_attempt(
                    spec.name,
                    started_at,
                    Utc::now(),
                    AttemptStatus::Failed,
                    None,
                    cost,
                    Some(result.usage),
                )
                .map_err(KernelError::Other)?;
            Ok(AgentDisposition::Failed)
        }
    }
}

/// System prompt for one agent run. Template loading is out of scope for
/// the kernel; this fixes the identity and the hard rules.
fn system_prompt(spec: &AgentSpec, session: &Session) -> String {
    let mut prompt = format!(
        "You are the {} agent in an authorized security assessment of {}.\n\
         Work only inside the workspace at {}. Use the provided tools; save \
         your findings with save_deliverable.",
        spec.display_name,
        session.target,
        session.workspace.display(),
    );
    let required = deliverables::required_types(spec.name);
    if !required.is_empty() {
        prompt.push_str(&format!(
            "\nYou must save the following deliverable type(s) before finishing: {}.",
            required.join(", ")
        ));
    }
    if let Some(config_path) = &session.config_path {
        prompt.push_str(&format!(
            "\nA target profile with authentication hints is at {}.",
            config_path.display()
        ));
    }
    prompt
}

fn user_prompt(spec: &AgentSpec, session: &Session) -> String {
    format!(
        "Begin the {} phase work for target {}.",
        spec.phase, session.target
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::llm::{
        ChatClient, ChatResponse, FunctionDeclaration, Message, Role, TokenUsage, ToolCallRequest,
        ToolChoice,
    };
    use crate::pipeline::Pipeline;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Stateless client: first turn saves both deliverable kinds (type
    /// coercion files them correctly per agent), then stops naturally.
    /// Tracks the number of chats in flight for the fan-out cap test.
    struct SavingClient {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay_ms: u64,
    }

    impl SavingClient {
        fn new(delay_ms: u64) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl ChatClient for SavingClient {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: &[FunctionDeclaration],
            _tool_choice: ToolChoice,
        ) -> Result<ChatResponse, crate::errors::LlmError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let already_saved = messages.iter().any(|m| m.role == Role::Tool);
            let response = if already_saved {
                ChatResponse {
                    message: Message::assistant("work complete"),
                    usage: TokenUsage::default(),
                    finish_reason: Some("stop".into()),
                }
            } else {
                ChatResponse {
                    message: Message::assistant_with_calls(
                        "",
                        vec![
                            ToolCallRequest {
                                id: "s-1".into(),
                                name: "save_deliverable".into(),
                                arguments: serde_json::json!({
                                    "deliverable_type": "GENERIC_ANALYSIS",
                                    "content": "# findings"
                                }),
                            },
                            ToolCallRequest {
                                id: "s-2".into(),
                                name: "save_deliverable".into(),
                                arguments: serde_json::json!({
                                    "deliverable_type": "GENERIC_QUEUE",
                                    "content": "[]"
                                }),
                            },
                        ],
                    ),
                    usage: TokenUsage::default(),
                    finish_reason: Some("tool_calls".into()),
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(response)
        }
    }

    /// Client that fails every conversation with a fatal error.
    struct FailingClient;

    #[async_trait]
    impl ChatClient for FailingClient {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[FunctionDeclaration],
            _tool_choice: ToolChoice,
        ) -> Result<ChatResponse, crate::errors::LlmError> {
            Err(crate::errors::LlmError::Auth("no key".into()))
        }
    }

    struct Fixture {
        kernel: Arc<Kernel>,
        scheduler: PhaseScheduler,
        session_id: String,
        _dir: TempDir,
    }

    async fn fixture_with(client: Arc<dyn ChatClient>, config: KernelConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let kernel = Arc::new(Kernel::with_client(dir.path(), config, client));
        let session = kernel
            .store
            .create("https://t.example.com", &ws, None, Pipeline::Main)
            .await
            .unwrap();
        Fixture {
            scheduler: PhaseScheduler::new(kernel.clone()),
            kernel,
            session_id: session.id,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_sequential_phase_runs_in_order_and_completes() {
        let f = fixture_with(Arc::new(SavingClient::new(0)), KernelConfig::default()).await;
        let summary = f
            .scheduler
            .run_phase(PhaseKind::PreReconnaissance, &f.session_id)
            .await
            .unwrap();

        assert_eq!(summary.completed, vec!["pre-recon", "login-check"]);
        let session = f.kernel.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.completed_agents.contains("pre-recon"));
        assert!(session.checkpoints.contains_key("pre-recon"));
    }

    #[tokio::test]
    async fn test_prerequisite_skip_is_recorded_not_failed() {
        let f = fixture_with(Arc::new(SavingClient::new(0)), KernelConfig::default()).await;
        // recon never ran, so recon-verify's prerequisite is unmet.
        let disposition = f
            .scheduler
            .run_agent("recon-verify", &f.session_id)
            .await
            .unwrap();
        assert_eq!(disposition, AgentDisposition::Skipped);

        let session = f.kernel.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.skipped_agents.contains("recon-verify"));
        assert!(!session.failed_agents.contains("recon-verify"));
    }

    #[tokio::test]
    async fn test_failed_agent_marks_failed_and_phase_continues() {
        let f = fixture_with(Arc::new(FailingClient), KernelConfig::default()).await;
        let summary = f
            .scheduler
            .run_phase(PhaseKind::PreReconnaissance, &f.session_id)
            .await
            .unwrap();

        // pre-recon failed; login-check is then skipped on prerequisites.
        assert_eq!(summary.failed, vec!["pre-recon"]);
        assert_eq!(summary.skipped, vec!["login-check"]);

        let session = f.kernel.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.failed_agents.contains("pre-recon"));

        // The attempt is in the audit log as failed.
        let audit = f.kernel.audit_for(&session);
        let metrics = audit.get_metrics().unwrap();
        assert_eq!(metrics.agents["pre-recon"].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_agent_is_not_rerun() {
        let f = fixture_with(Arc::new(SavingClient::new(0)), KernelConfig::default()).await;
        f.kernel
            .store
            .mark_completed(&f.session_id, "pre-recon", None)
            .await
            .unwrap();

        let disposition = f
            .scheduler
            .run_agent("pre-recon", &f.session_id)
            .await
            .unwrap();
        assert_eq!(disposition, AgentDisposition::AlreadyDone);
    }

    #[tokio::test]
    async fn test_fan_out_respects_parallel_limit() {
        let mut config = KernelConfig::default();
        config.parallel_limit = 3;
        let client = Arc::new(SavingClient::new(25));
        let f = fixture_with(client.clone(), config).await;

        // Make the fan-out agents eligible.
        f.kernel
            .store
            .mark_completed(&f.session_id, "recon", None)
            .await
            .unwrap();

        let summary = f
            .scheduler
            .run_phase(PhaseKind::VulnerabilityAnalysis, &f.session_id)
            .await
            .unwrap();

        // All eight vuln agents completed.
        assert_eq!(summary.completed.len(), 8);
        // The concurrency cap held: never more than 3 chats in flight.
        let max = client.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "observed {max} concurrent LLM calls");
        assert!(max >= 2, "fan-out never ran in parallel (max {max})");
    }

    #[tokio::test]
    async fn test_run_all_attempts_reporting_despite_failures() {
        let f = fixture_with(Arc::new(FailingClient), KernelConfig::default()).await;
        let summary = f.scheduler.run_all(&f.session_id).await.unwrap();

        // Everything failed or was skipped, but report got its attempt.
        assert!(summary.failed.contains(&"report".to_string()));
        let session = f.kernel.store.get(&f.session_id).await.unwrap().unwrap();
        let audit = f.kernel.audit_for(&session);
        assert!(audit.get_metrics().unwrap().agents.contains_key("report"));
    }

    #[tokio::test]
    async fn test_run_all_happy_path_completes_pipeline() {
        let f = fixture_with(Arc::new(SavingClient::new(0)), KernelConfig::default()).await;
        let summary = f.scheduler.run_all(&f.session_id).await.unwrap();
        assert!(summary.failed.is_empty(), "failed: {:?}", summary.failed);

        let session = f.kernel.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.is_pipeline_complete());
        assert_eq!(session.status, crate::session::SessionStatus::Completed);
        // Timing and cost carried onto the session.
        assert!(session.timing_breakdown.contains_key("recon"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_validation_error() {
        let f = fixture_with(Arc::new(SavingClient::new(0)), KernelConfig::default()).await;
        let err = f
            .scheduler
            .run_agent("nonexistent", &f.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownAgent { .. }));
    }

    #[test]
    fn test_system_prompt_names_required_deliverables() {
        let spec = pipeline::get_agent(Pipeline::Main, "sqli-vuln").unwrap();
        let session = Session::new(
            "s-1",
            "https://t.example.com",
            std::path::PathBuf::from("/ws"),
            None,
            Pipeline::Main,
        );
        let prompt = system_prompt(spec, &session);
        assert!(prompt.contains("SQL Injection Analysis"));
        assert!(prompt.contains("SQLI_ANALYSIS"));
        assert!(prompt.contains("SQLI_QUEUE"));
    }
}
