//! The kernel handle: every long-lived collaborator in one place.
//!
//! Passed explicitly into scheduler and command code instead of living in
//! module-level statics, so tests and multi-session operation stay
//! tractable.

use crate::audit::AuditLog;
use crate::checkpoint::CheckpointManager;
use crate::config::KernelConfig;
use crate::errors::KernelError;
use crate::llm::{ChatClient, HttpChatClient};
use crate::session::{Session, SessionStore};
use crate::subagent::{SubAgentExecutor, register_subagent_tool};
use crate::tools::{ToolRegistry, remote};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub store: Arc<SessionStore>,
    pub client: Arc<dyn ChatClient>,
    pub checkpoints: Arc<CheckpointManager>,
    pub root: PathBuf,
}

impl Kernel {
    /// Assemble a kernel rooted at `root` with an HTTP chat client.
    pub fn new(root: &Path, config: KernelConfig) -> Result<Self, KernelError> {
        let client = HttpChatClient::new(&config)
            .map_err(|e| KernelError::Config(format!("cannot build LLM client: {e}")))?;
        Ok(Self::with_client(root, config, Arc::new(client)))
    }

    /// Assemble a kernel with an explicit chat client (tests inject mocks).
    pub fn with_client(root: &Path, config: KernelConfig, client: Arc<dyn ChatClient>) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(SessionStore::new(root, config.session_stale_after));
        let checkpoints = Arc::new(CheckpointManager::with_root(root));
        Self {
            config,
            store,
            client,
            checkpoints,
            root: root.to_path_buf(),
        }
    }

    /// The audit log for a session.
    pub fn audit_for(&self, session: &Session) -> AuditLog {
        AuditLog::new(&self.store.audit_dir(session))
    }

    /// Build the full tool registry for agent runs: core tools, the
    /// `SubAgent` executor, and any configured remote tool servers.
    pub async fn build_registry(&self) -> Result<ToolRegistry, KernelError> {
        let mut registry = ToolRegistry::with_core_tools()?;

        let executor = Arc::new(SubAgentExecutor::new(
            self.client.clone(),
            self.config.clone(),
            0,
        ));
        register_subagent_tool(&mut registry, executor)?;

        if let Some(manifest_path) = &self.config.toolservers_file {
            if manifest_path.exists() {
                let configs = remote::load_manifest(manifest_path)?;
                let attached = remote::attach_from_manifest(&mut registry, &configs).await;
                tracing::info!(count = attached, "remote tools attached");
            }
        }
        Ok(registry)
    }
}
