//! Per-agent workspace checkpoints.
//!
//! After an agent completes, the manager records a content-addressed
//! snapshot of the workspace and stores its identifier on the session.
//! Rollback restores the workspace to an agent's snapshot and clears that
//! agent plus everything later in the pipeline, leaving `rolled-back`
//! attempts in the audit log for the reconciler to observe.

use crate::audit::{AttemptStatus, AuditLog, EventKind};
use crate::errors::KernelError;
use crate::pipeline;
use crate::session::{Session, SessionStore};
use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Anything that can snapshot and restore a workspace by content id.
pub trait SnapshotProvider: Send + Sync {
    /// Snapshot the workspace and return a content-addressed identifier.
    fn snapshot(&self, workspace: &Path) -> Result<String>;
    /// Restore the workspace to a previously taken snapshot.
    fn restore(&self, workspace: &Path, id: &str) -> Result<()>;
    /// Whether a snapshot exists.
    fn exists(&self, id: &str) -> bool;
}

/// Default provider: SHA-256 content manifest plus a stored file archive.
///
/// The identifier is a hash over the sorted relative paths and contents of
/// every file, so identical workspace states share one archive.
pub struct ContentSnapshotProvider {
    snapshots_dir: PathBuf,
}

impl ContentSnapshotProvider {
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
        }
    }

    fn archive_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(id)
    }

    fn hash_workspace(workspace: &Path) -> Result<String> {
        let mut files: Vec<PathBuf> = WalkDir::new(workspace)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let mut hasher = Sha256::new();
        for file in &files {
            let rel = file
                .strip_prefix(workspace)
                .context("file outside workspace during hash")?;
            let content = fs::read(file)
                .with_context(|| format!("Failed to read {} for snapshot", file.display()))?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
        Ok(hex_digest(&hasher.finalize()))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).into_iter().filter_map(|e| e.ok()) {
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("entry outside source tree")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to copy to {}", dest.display()))?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).context("Failed to list workspace")? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

impl SnapshotProvider for ContentSnapshotProvider {
    fn snapshot(&self, workspace: &Path) -> Result<String> {
        let id = Self::hash_workspace(workspace)?;
        let archive = self.archive_dir(&id);
        if archive.exists() {
            debug!(snapshot = %id, "snapshot already archived");
            return Ok(id);
        }
        let staging = self.snapshots_dir.join(format!("{id}.staging"));
        if staging.exists() {
            fs::remove_dir_all(&staging).context("Failed to clear stale staging dir")?;
        }
        fs::create_dir_all(&staging).context("Failed to create snapshot staging dir")?;
        copy_tree(workspace, &staging)?;
        fs::rename(&staging, &archive).context("Failed to finalize snapshot archive")?;
        Ok(id)
    }

    fn restore(&self, workspace: &Path, id: &str) -> Result<()> {
        let archive = self.archive_dir(id);
        if !archive.exists() {
            anyhow::bail!("snapshot {id} not found under {}", self.snapshots_dir.display());
        }
        clear_dir(workspace)?;
        copy_tree(&archive, workspace)
    }

    fn exists(&self, id: &str) -> bool {
        self.archive_dir(id).exists()
    }
}

/// Records checkpoints after successful agents and performs rollback.
pub struct CheckpointManager {
    provider: Box<dyn SnapshotProvider>,
}

impl CheckpointManager {
    pub fn new(provider: Box<dyn SnapshotProvider>) -> Self {
        Self { provider }
    }

    /// Default manager archiving under `<root>/snapshots/`.
    pub fn with_root(root: &Path) -> Self {
        Self::new(Box::new(ContentSnapshotProvider::new(root.join("snapshots"))))
    }

    /// Snapshot a session's workspace; the caller records the returned id
    /// via `mark_completed`.
    pub fn snapshot(&self, session: &Session) -> Result<String> {
        let id = self.provider.snapshot(&session.workspace)?;
        info!(session = %session.id, snapshot = %id, "workspace checkpoint taken");
        Ok(id)
    }

}

/// Computed rollback: which agents to clear and which snapshot to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    pub restore_snapshot: String,
    pub cleared_agents: Vec<String>,
}

/// Compute the rollback plan for an agent on a session.
pub fn plan_rollback(session: &Session, agent: &str) -> Result<RollbackPlan, KernelError> {
    let spec =
        pipeline::get_agent(session.pipeline, agent).ok_or_else(|| KernelError::UnknownAgent {
            name: agent.to_string(),
        })?;
    let snapshot = session
        .checkpoints
        .get(agent)
        .cloned()
        .ok_or_else(|| KernelError::Config(format!("agent {agent} has no checkpoint to roll back to")))?;

    let mut cleared: Vec<String> = vec![spec.name.to_string()];
    cleared.extend(
        pipeline::agents_after(session.pipeline, agent)
            .into_iter()
            .filter(|a| {
                session.completed_agents.contains(a.name) || session.checkpoints.contains_key(a.name)
            })
            .map(|a| a.name.to_string()),
    );
    Ok(RollbackPlan {
        restore_snapshot: snapshot,
        cleared_agents: cleared,
    })
}

/// Execute a rollback end to end: restore the workspace, record audit
/// entries, and rewrite the session sets.
pub async fn rollback_to(
    manager: &CheckpointManager,
    store: &SessionStore,
    audit: &AuditLog,
    session: &Session,
    agent: &str,
) -> Result<Session, KernelError> {
    let plan = plan_rollback(session, agent)?;

    manager
        .provider
        .restore(&session.workspace, &plan.restore_snapshot)
        .map_err(KernelError::Other)?;

    let now = Utc::now();
    for cleared in &plan.cleared_agents {
        audit
            .record_attempt(cleared, now, now, AttemptStatus::RolledBack, None, 0.0, None)
            .map_err(KernelError::Other)?;
    }
    audit
        .log_event(
            EventKind::StatusTransition,
            Some(agent),
            serde_json::json!({
                "action": "rollback",
                "snapshot": plan.restore_snapshot.clone(),
                "cleared": plan.cleared_agents.clone(),
            }),
        )
        .map_err(KernelError::Other)?;

    let cleared = plan.cleared_agents.clone();
    store
        .update(&session.id, move |s| {
            for name in &cleared {
                s.completed_agents.remove(name);
                s.checkpoints.remove(name);
            }
        })
        .await
}
