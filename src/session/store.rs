//! Durable session store.
//!
//! One JSON document on disk holds every session. Writes go to a sibling
//! temp file and are renamed into place, so a reader always observes a
//! complete document. Cross-process writers serialize on an `fs2` advisory
//! lock; within the process, every read-modify-write of a session holds
//! that session's mutex.

use super::{Session, SessionDocument, SessionStatus};
use crate::errors::KernelError;
use crate::pipeline::Pipeline;
use crate::util::target_hostname;
use chrono::Utc;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Store file name under the process root.
const STORE_FILE: &str = "sessions.json";

/// Sibling lock file guarding cross-process writes.
const LOCK_FILE: &str = "sessions.lock";

pub struct SessionStore {
    root: PathBuf,
    store_path: PathBuf,
    stale_after: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open (or lazily create) the store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        let root = root.into();
        let store_path = root.join(STORE_FILE);
        Self {
            root,
            store_path,
            stale_after,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the on-disk document.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Audit directory for a session, under `<root>/audit-logs/`.
    pub fn audit_dir(&self, session: &Session) -> PathBuf {
        self.root
            .join("audit-logs")
            .join(format!("{}_{}", target_hostname(&session.target), session.id))
    }

    /// Browser automation log directory for a session.
    pub fn browser_log_dir(&self, session: &Session) -> PathBuf {
        self.root.join("browser-logs").join(&session.id)
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_document(&self) -> Result<SessionDocument, KernelError> {
        if !self.store_path.exists() {
            return Ok(SessionDocument::default());
        }
        let content = fs::read_to_string(&self.store_path).map_err(|source| {
            KernelError::StoreWriteFailed {
                path: self.store_path.clone(),
                source,
            }
        })?;
        serde_json::from_str(&content).map_err(|e| {
            KernelError::Config(format!(
                "session store at {} is corrupt: {e}",
                self.store_path.display()
            ))
        })
    }

    fn write_document(&self, doc: &SessionDocument) -> Result<(), KernelError> {
        fs::create_dir_all(&self.root).map_err(|source| KernelError::StoreWriteFailed {
            path: self.root.clone(),
            source,
        })?;

        // Advisory lock serializes writers across processes. The lock file
        // is separate so the rename below never replaces a locked inode.
        let lock_path = self.root.join(LOCK_FILE);
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| KernelError::StoreWriteFailed {
                path: lock_path.clone(),
                source,
            })?;
        lock_file
            .lock_exclusive()
            .map_err(|source| KernelError::StoreWriteFailed {
                path: lock_path.clone(),
                source,
            })?;

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| KernelError::Config(format!("failed to serialize session store: {e}")))?;

        let tmp_path = self
            .store_path
            .with_file_name(format!("{STORE_FILE}.{}.tmp", std::process::id()));
        let result = fs::write(&tmp_path, &json)
            .and_then(|_| fs::rename(&tmp_path, &self.store_path))
            .map_err(|source| KernelError::StoreWriteFailed {
                path: self.store_path.clone(),
                source,
            });

        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    /// Create a session, or resume the existing non-complete one for the
    /// same `(target, workspace)` pair.
    ///
    /// Creation also sweeps: any `in-progress`/`running` session whose last
    /// activity is older than the staleness threshold is demoted to
    /// `interrupted`, migrating its running agents into failed.
    pub async fn create(
        &self,
        target: &str,
        workspace: &Path,
        config_path: Option<PathBuf>,
        pipeline: Pipeline,
    ) -> Result<Session, KernelError> {
        let mut doc = self.read_document()?;

        self.sweep_stale(&mut doc);

        let existing = doc
            .sessions
            .values()
            .find(|s| {
                s.target == target && s.workspace == workspace && !s.is_pipeline_complete()
            })
            .map(|s| s.id.clone());

        let session = if let Some(id) = existing {
            let s = doc.sessions.get_mut(&id).expect("session present");
            debug!(session = %id, "resuming existing session");
            s.status = SessionStatus::InProgress;
            s.last_activity = Utc::now();
            if let Some(cfg) = config_path {
                s.config_path = Some(cfg);
            }
            s.clone()
        } else {
            let id = Uuid::new_v4().to_string();
            let s = Session::new(id.clone(), target, workspace.to_path_buf(), config_path, pipeline);
            doc.sessions.insert(id, s.clone());
            s
        };

        self.write_document(&doc)?;
        Ok(session)
    }

    fn sweep_stale(&self, doc: &mut SessionDocument) {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(45));
        for session in doc.sessions.values_mut() {
            let idle = now - session.last_activity;
            let active = matches!(
                session.status,
                SessionStatus::InProgress | SessionStatus::Running
            );
            if active && idle > threshold {
                warn!(
                    session = %session.id,
                    idle_mins = idle.num_minutes(),
                    "demoting stale session to interrupted"
                );
                session.interrupt();
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, KernelError> {
        Ok(self.read_document()?.sessions.get(id).cloned())
    }

    /// Most recently active session, if any.
    pub async fn latest(&self) -> Result<Option<Session>, KernelError> {
        Ok(self
            .read_document()?
            .sessions
            .values()
            .max_by_key(|s| s.last_activity)
            .cloned())
    }

    pub async fn list(&self) -> Result<Vec<Session>, KernelError> {
        let mut sessions: Vec<Session> = self.read_document()?.sessions.into_values().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Atomic read-modify-write under the session's mutex.
    ///
    /// Recomputes status and stamps `last_activity` after the mutation, so
    /// callers mutating the agent sets directly still leave a consistent
    /// record behind.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Session, KernelError>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut doc = self.read_document()?;
        let session = doc
            .sessions
            .get_mut(id)
            .ok_or_else(|| KernelError::SessionNotFound { id: id.to_string() })?;
        mutate(session);
        session.touch();
        let updated = session.clone();
        self.write_document(&doc)?;
        Ok(updated)
    }

    /// Like `update`, but leaves status and timestamps fully under the
    /// mutation's control (the interrupt path pins `Interrupted`, which
    /// `touch` would erase).
    pub async fn update_pinned<F>(&self, id: &str, mutate: F) -> Result<Session, KernelError>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut doc = self.read_document()?;
        let session = doc
            .sessions
            .get_mut(id)
            .ok_or_else(|| KernelError::SessionNotFound { id: id.to_string() })?;
        mutate(session);
        let updated = session.clone();
        self.write_document(&doc)?;
        Ok(updated)
    }

    pub async fn mark_running(&self, id: &str, agent: &str) -> Result<Session, KernelError> {
        self.update(id, |s| s.mark_running(agent)).await
    }

    pub async fn mark_completed(
        &self,
        id: &str,
        agent: &str,
        checkpoint: Option<String>,
    ) -> Result<Session, KernelError> {
        self.update(id, |s| s.mark_completed(agent, checkpoint)).await
    }

    pub async fn mark_failed(&self, id: &str, agent: &str) -> Result<Session, KernelError> {
        self.update(id, |s| s.mark_failed(agent)).await
    }

    pub async fn mark_skipped(&self, id: &str, agent: &str) -> Result<Session, KernelError> {
        self.update(id, |s| s.mark_skipped(agent)).await
    }

    /// Signal path: pin the session to `interrupted`.
    pub async fn interrupt(&self, id: &str) -> Result<Session, KernelError> {
        self.update_pinned(id, |s| s.interrupt()).await
    }

    /// Delete a session and its durable artifacts.
    ///
    /// Filesystem cleanup failures are logged as warnings; the record is
    /// removed regardless. Returns false when the session did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, KernelError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut doc = self.read_document()?;
        let Some(session) = doc.sessions.remove(id) else {
            return Ok(false);
        };
        self.write_document(&doc)?;

        for dir in [
            session.workspace.join("deliverables"),
            session.workspace.join("outputs"),
            self.audit_dir(&session),
            self.browser_log_dir(&session),
        ] {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(path = %dir.display(), error = %e, "cleanup failed");
                }
            }
        }
        Ok(true)
    }

    /// Delete every session.
    pub async fn delete_all(&self) -> Result<usize, KernelError> {
        let ids: Vec<String> = self.read_document()?.sessions.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.delete(&id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
