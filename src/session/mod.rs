//! Session records and status derivation.
//!
//! A session is one pipeline run against a `(target, workspace)` pair. The
//! four agent-name sets are kept pairwise disjoint by construction: every
//! mutation goes through `mark_*`, which removes the name from the other
//! three sets before inserting. `status` is recomputed from the sets on
//! every write; the only sticky value is `Interrupted`, which the signal
//! path applies after migrating running agents into failed.

mod store;

pub use store::SessionStore;

use crate::pipeline::{self, Pipeline};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Derived session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Work remains and nothing is currently executing.
    InProgress,
    /// At least one agent is executing.
    Running,
    /// Every pipeline agent is completed or skipped.
    Completed,
    /// Work remains, nothing is running, and at least one agent failed.
    Failed,
    /// The process was stopped by an external signal.
    Interrupted,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One pipeline run against a `(target, workspace)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub target: String,
    pub workspace: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub pipeline: Pipeline,
    pub status: SessionStatus,
    #[serde(default)]
    pub completed_agents: BTreeSet<String>,
    #[serde(default)]
    pub skipped_agents: BTreeSet<String>,
    #[serde(default)]
    pub failed_agents: BTreeSet<String>,
    #[serde(default)]
    pub running_agents: BTreeSet<String>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Per-agent wall-clock milliseconds, carried from the audit log.
    #[serde(default)]
    pub timing_breakdown: BTreeMap<String, u64>,
    /// Per-agent USD cost, carried from the audit log.
    #[serde(default)]
    pub cost_breakdown: BTreeMap<String, f64>,
}

impl Session {
    /// Create a fresh session record.
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        workspace: PathBuf,
        config_path: Option<PathBuf>,
        pipeline: Pipeline,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            target: target.into(),
            workspace,
            config_path,
            pipeline,
            status: SessionStatus::InProgress,
            completed_agents: BTreeSet::new(),
            skipped_agents: BTreeSet::new(),
            failed_agents: BTreeSet::new(),
            running_agents: BTreeSet::new(),
            checkpoints: BTreeMap::new(),
            created_at: now,
            last_activity: now,
            timing_breakdown: BTreeMap::new(),
            cost_breakdown: BTreeMap::new(),
        }
    }

    /// Every agent of the pipeline is completed or skipped.
    pub fn is_pipeline_complete(&self) -> bool {
        pipeline::agent_names(self.pipeline)
            .iter()
            .all(|name| self.completed_agents.contains(*name) || self.skipped_agents.contains(*name))
    }

    /// Pure derivation of status from the four agent sets.
    pub fn derive_status(&self) -> SessionStatus {
        if !self.running_agents.is_empty() {
            SessionStatus::Running
        } else if self.is_pipeline_complete() {
            SessionStatus::Completed
        } else if !self.failed_agents.is_empty() {
            SessionStatus::Failed
        } else {
            SessionStatus::InProgress
        }
    }

    /// Recompute `status` and stamp `last_activity`.
    pub fn touch(&mut self) {
        self.status = self.derive_status();
        self.last_activity = Utc::now();
    }

    fn remove_everywhere(&mut self, agent: &str) {
        self.completed_agents.remove(agent);
        self.skipped_agents.remove(agent);
        self.failed_agents.remove(agent);
        self.running_agents.remove(agent);
    }

    /// Move an agent into the running set.
    pub fn mark_running(&mut self, agent: &str) {
        self.remove_everywhere(agent);
        self.running_agents.insert(agent.to_string());
        self.touch();
    }

    /// Move an agent into the completed set, recording its checkpoint.
    pub fn mark_completed(&mut self, agent: &str, checkpoint: Option<String>) {
        self.remove_everywhere(agent);
        self.completed_agents.insert(agent.to_string());
        if let Some(cp) = checkpoint {
            self.checkpoints.insert(agent.to_string(), cp);
        }
        self.touch();
    }

    /// Move an agent into the failed set.
    pub fn mark_failed(&mut self, agent: &str) {
        self.remove_everywhere(agent);
        self.failed_agents.insert(agent.to_string());
        self.touch();
    }

    /// Move an agent into the skipped set.
    pub fn mark_skipped(&mut self, agent: &str) {
        self.remove_everywhere(agent);
        self.skipped_agents.insert(agent.to_string());
        self.touch();
    }

    /// Signal path: migrate running agents into failed and pin the status.
    pub fn interrupt(&mut self) {
        let running: Vec<String> = self.running_agents.iter().cloned().collect();
        for agent in running {
            self.mark_failed(&agent);
        }
        self.status = SessionStatus::Interrupted;
        self.last_activity = Utc::now();
    }

    /// The four sets never share an agent name.
    pub fn sets_are_disjoint(&self) -> bool {
        let total = self.completed_agents.len()
            + self.skipped_agents.len()
            + self.failed_agents.len()
            + self.running_agents.len();
        let mut union = BTreeSet::new();
        union.extend(self.completed_agents.iter());
        union.extend(self.skipped_agents.iter());
        union.extend(self.failed_agents.iter());
        union.extend(self.running_agents.iter());
        union.len() == total
    }
}

/// The single on-disk document: every session keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub sessions: BTreeMap<String, Session>,
}
