//! Pipeline entry points: `run`, `re`, and `osv`.
//!
//! All three share the same shape: create or resume the session,
//! reconcile it from the audit log, then drive the scheduler to the end
//! while watching for an interrupt signal. SIGINT/SIGTERM mark the
//! session interrupted, migrate running agents to failed, and exit 0.

use super::{reconcile_session, status};
use crate::audit::EventKind;
use crate::errors::KernelError;
use crate::kernel::Kernel;
use crate::pipeline::Pipeline;
use crate::scheduler::PhaseScheduler;
use crate::session::Session;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Options shared by the pipeline commands.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    /// Create/resume and reconcile the session, then stop.
    pub setup_only: bool,
    /// Skip the startup banner. The kernel has no banner, so this only
    /// exists for CLI compatibility.
    pub disable_loader: bool,
}

/// Exit code for the process: 0 on success and clean interrupt, 1 on error.
pub type ExitCode = i32;

/// `run <target> <workspace>`: the main web-assessment pipeline.
pub async fn cmd_run(
    kernel: Arc<Kernel>,
    target: &str,
    workspace: &Path,
    options: RunOptions,
) -> Result<ExitCode, KernelError> {
    let workspace = workspace
        .canonicalize()
        .map_err(|e| KernelError::Config(format!("workspace does not exist: {e}")))?;
    if let Some(config) = &options.config_path {
        // Fail early on an unreadable profile rather than mid-pipeline.
        crate::config::TargetProfile::load(config)
            .map_err(|e| KernelError::Config(e.to_string()))?;
    }
    let session = kernel
        .store
        .create(target, &workspace, options.config_path.clone(), Pipeline::Main)
        .await?;
    drive(kernel, session, &options).await
}

/// `re <binary>`: the standalone reverse-engineering pipeline. The binary
/// is copied into a dedicated workspace so sandboxed tools can reach it.
pub async fn cmd_re(
    kernel: Arc<Kernel>,
    binary: &Path,
    options: RunOptions,
) -> Result<ExitCode, KernelError> {
    let binary = binary
        .canonicalize()
        .map_err(|e| KernelError::Config(format!("binary does not exist: {e}")))?;
    let name = binary
        .file_name()
        .map(|n| crate::util::sanitize_for_path(&n.to_string_lossy()))
        .unwrap_or_else(|| "binary".to_string());

    let workspace = kernel.root.join("repos").join(format!("re-{name}"));
    std::fs::create_dir_all(&workspace)
        .context("Failed to create RE workspace")
        .map_err(KernelError::Other)?;
    std::fs::copy(&binary, workspace.join(&name))
        .context("Failed to copy binary into workspace")
        .map_err(KernelError::Other)?;

    let session = kernel
        .store
        .create(
            &binary.display().to_string(),
            &workspace,
            options.config_path.clone(),
            Pipeline::ReverseEngineering,
        )
        .await?;
    drive(kernel, session, &options).await
}

/// `osv <repository>`: the standalone open-source-vulnerability pipeline.
pub async fn cmd_osv(
    kernel: Arc<Kernel>,
    repository: &Path,
    options: RunOptions,
) -> Result<ExitCode, KernelError> {
    let repository = repository
        .canonicalize()
        .map_err(|e| KernelError::Config(format!("repository does not exist: {e}")))?;
    let session = kernel
        .store
        .create(
            &repository.display().to_string(),
            &repository,
            options.config_path.clone(),
            Pipeline::OpenSourceVuln,
        )
        .await?;
    drive(kernel, session, &options).await
}

/// Shared driver: reconcile, optionally stop after setup, then run the
/// scheduler to completion under the interrupt watcher.
async fn drive(
    kernel: Arc<Kernel>,
    session: Session,
    options: &RunOptions,
) -> Result<ExitCode, KernelError> {
    reconcile_session(&kernel, &session, true).await?;
    info!(session = %session.id, target = %session.target, "session ready");

    if options.setup_only {
        println!("Session {} ready (setup only)", session.id);
        return Ok(0);
    }

    let scheduler = PhaseScheduler::new(kernel.clone());
    let session_id = session.id.clone();

    tokio::select! {
        result = scheduler.run_all(&session_id) => {
            let summary = result?;
            status::print_summary(&summary);
            let finished = kernel.store.get(&session_id).await?;
            if let Some(finished) = finished {
                info!(session = %session_id, status = %finished.status, "pipeline finished");
            }
            Ok(if summary.failed.is_empty() { 0 } else { 1 })
        }
        _ = shutdown_signal() => {
            warn!(session = %session_id, "interrupt received, shutting down");
            let interrupted = kernel.store.interrupt(&session_id).await?;
            let audit = kernel.audit_for(&interrupted);
            let _ = audit.log_event(
                EventKind::StatusTransition,
                None,
                serde_json::json!({"action": "interrupted"}),
            );
            println!("Interrupted; session {session_id} saved for resume.");
            Ok(0)
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
