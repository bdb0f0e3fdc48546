//! Per-session audit records.
//!
//! The audit log is the source of truth for agent status, attempts,
//! timing, cost, and checkpoints. The session store mirrors it and is
//! re-synchronised from here by the reconciler after crashes or
//! out-of-band edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::llm::TokenUsage;

/// Kinds of append-only events in `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    AttemptStart,
    AttemptEnd,
    ToolCall,
    ToolResult,
    PromptSize,
    Checkpoint,
    StatusTransition,
}

/// One append-only audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: EventKind, agent: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            agent: agent.map(String::from),
            payload,
        }
    }
}

/// Terminal status of one agent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Success,
    Failed,
    RolledBack,
}

impl AttemptStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
        }
    }
}

/// One attempt at running an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl AttemptRecord {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Aggregated per-agent metrics; `status` reflects the latest attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub status: AttemptStatus,
    pub attempts: Vec<AttemptRecord>,
    pub total_cost_usd: f64,
    pub final_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

/// The `metrics.json` document for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentMetrics>,
}

impl SessionMetrics {
    /// Apply one attempt: append to the agent's history, recompute the
    /// aggregates, and let the latest attempt win the status. A rolled-back
    /// attempt clears the stored checkpoint.
    pub fn apply_attempt(&mut self, agent: &str, record: AttemptRecord) {
        let entry = self.agents.entry(agent.to_string()).or_insert(AgentMetrics {
            status: record.status,
            attempts: Vec::new(),
            total_cost_usd: 0.0,
            final_duration_ms: 0,
            checkpoint: None,
        });
        entry.status = record.status;
        entry.total_cost_usd += record.cost_usd;
        entry.final_duration_ms = record.duration_ms();
        match record.status {
            AttemptStatus::RolledBack => entry.checkpoint = None,
            _ => {
                if let Some(cp) = &record.checkpoint {
                    entry.checkpoint = Some(cp.clone());
                }
            }
        }
        entry.attempts.push(record);
    }
}

pub mod logger;
pub use logger::AuditLog;
