//! CLI command implementations.
//!
//! Each submodule owns one command surface:
//!
//! | Module    | Commands handled                                  |
//! |-----------|---------------------------------------------------|
//! | `run`     | `run`, `re`, `osv` pipeline entry points          |
//! | `status`  | `--status`, `--list-agents`                       |
//! | `cleanup` | `--cleanup`                                       |
//!
//! Developer commands (`--run-phase`, `--rerun`, `--run-all`,
//! `--rollback-to`) live here in `mod.rs`; all of them reconcile the
//! session from its audit log before acting.

pub mod cleanup;
pub mod run;
pub mod status;

pub use cleanup::cmd_cleanup;
pub use run::{RunOptions, cmd_osv, cmd_re, cmd_run};
pub use status::{cmd_list_agents, cmd_status};

use crate::checkpoint;
use crate::errors::KernelError;
use crate::kernel::Kernel;
use crate::pipeline::PhaseKind;
use crate::reconcile::{self, ReconcileOptions};
use crate::scheduler::PhaseScheduler;
use crate::session::Session;
use std::sync::Arc;

/// Resolve the session a developer command acts on: `--session <id>` when
/// given, otherwise the most recently active session.
pub async fn resolve_session(
    kernel: &Kernel,
    session_id: Option<&str>,
) -> Result<Session, KernelError> {
    match session_id {
        Some(id) => kernel
            .store
            .get(id)
            .await?
            .ok_or_else(|| KernelError::SessionNotFound { id: id.to_string() }),
        None => kernel
            .store
            .latest()
            .await?
            .ok_or_else(|| KernelError::SessionNotFound {
                id: "(no sessions exist)".to_string(),
            }),
    }
}

/// Reconcile a session from its audit log. Every developer command runs
/// this first so the store mirrors reality before anything acts on it.
pub async fn reconcile_session(
    kernel: &Kernel,
    session: &Session,
    apply_stale_running: bool,
) -> Result<(), KernelError> {
    let audit = kernel.audit_for(session);
    let options = ReconcileOptions {
        apply_stale_running,
        stale_after: kernel.config.running_stale_after,
    };
    let report = reconcile::reconcile(&kernel.store, &audit, &session.id, &options).await?;
    if !report.is_noop() {
        tracing::info!(
            session = %session.id,
            promoted = report.promoted.len(),
            demoted = report.demoted.len(),
            failed = report.failed.len(),
            stale = report.stale_running.len(),
            "session reconciled"
        );
    }
    Ok(())
}

/// `--run-phase <name>`: run one phase of the resolved session.
pub async fn cmd_run_phase(
    kernel: Arc<Kernel>,
    phase_name: &str,
    session_id: Option<&str>,
) -> Result<(), KernelError> {
    let phase = PhaseKind::parse(phase_name).ok_or_else(|| KernelError::UnknownPhase {
        name: phase_name.to_string(),
    })?;
    let session = resolve_session(&kernel, session_id).await?;
    reconcile_session(&kernel, &session, true).await?;

    let scheduler = PhaseScheduler::new(kernel);
    let summary = scheduler.run_phase(phase, &session.id).await?;
    status::print_summary(&summary);
    Ok(())
}

/// `--rerun <agent>`: clear an agent's completion and run it again.
pub async fn cmd_rerun(
    kernel: Arc<Kernel>,
    agent: &str,
    session_id: Option<&str>,
) -> Result<(), KernelError> {
    let session = resolve_session(&kernel, session_id).await?;
    reconcile_session(&kernel, &session, true).await?;

    let agent_name = agent.to_string();
    kernel
        .store
        .update(&session.id, move |s| {
            s.completed_agents.remove(&agent_name);
            s.checkpoints.remove(&agent_name);
        })
        .await?;

    let scheduler = PhaseScheduler::new(kernel);
    let disposition = scheduler.run_agent(agent, &session.id).await?;
    println!("{agent}: {disposition:?}");
    Ok(())
}

/// `--run-all`: run everything still outstanding in the resolved session.
pub async fn cmd_run_all(kernel: Arc<Kernel>, session_id: Option<&str>) -> Result<(), KernelError> {
    let session = resolve_session(&kernel, session_id).await?;
    reconcile_session(&kernel, &session, true).await?;

    let scheduler = PhaseScheduler::new(kernel);
    let summary = scheduler.run_all(&session.id).await?;
    status::print_summary(&summary);
    Ok(())
}

/// `--rollback-to <agent>`: restore the workspace to that agent's
/// checkpoint and clear it plus everything later.
pub async fn cmd_rollback_to(
    kernel: Arc<Kernel>,
    agent: &str,
    session_id: Option<&str>,
) -> Result<(), KernelError> {
    let session = resolve_session(&kernel, session_id).await?;
    reconcile_session(&kernel, &session, true).await?;

    let session = resolve_session(&kernel, Some(&session.id)).await?;
    let audit = kernel.audit_for(&session);
    let after = checkpoint::rollback_to(&kernel.checkpoints, &kernel.store, &audit, &session, agent)
        .await?;
    println!(
        "Rolled back to {agent}; {} agent(s) remain completed.",
        after.completed_agents.len()
    );
    Ok(())
}
