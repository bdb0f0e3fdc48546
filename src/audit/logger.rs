use super::{AgentMetrics, AttemptRecord, AttemptStatus, AuditEvent, EventKind, SessionMetrics};
use crate::llm::TokenUsage;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const EVENTS_FILE: &str = "events.jsonl";
const METRICS_FILE: &str = "metrics.json";

/// Append-only audit log for one session.
///
/// Events go to `events.jsonl`, one JSON document per line, in emission
/// order. Per-agent aggregates live in `metrics.json` and are rewritten on
/// every attempt. Both files sit in the session's audit directory next to
/// `console.log`.
pub struct AuditLog {
    audit_dir: PathBuf,
    events_path: PathBuf,
    metrics_path: PathBuf,
}

impl AuditLog {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
            events_path: audit_dir.join(EVENTS_FILE),
            metrics_path: audit_dir.join(METRICS_FILE),
        }
    }

    pub fn audit_dir(&self) -> &Path {
        &self.audit_dir
    }

    /// Append one event. Creates the audit directory on first use.
    pub fn log_event(
        &self,
        kind: EventKind,
        agent: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<()> {
        fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        let event = AuditEvent::new(kind, agent, payload);
        let line = serde_json::to_string(&event).context("Failed to serialize audit event")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .context("Failed to open audit event log")?;
        writeln!(file, "{line}").context("Failed to append audit event")?;
        Ok(())
    }

    /// Record one agent attempt and update the aggregates.
    #[allow(clippy::too_many_arguments)]
    pub fn record_attempt(
        &self,
        agent: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        status: AttemptStatus,
        checkpoint: Option<String>,
        cost_usd: f64,
        token_usage: Option<TokenUsage>,
    ) -> Result<()> {
        let record = AttemptRecord {
            started_at,
            ended_at,
            status,
            checkpoint: checkpoint.clone(),
            cost_usd,
            token_usage,
        };

        let mut metrics = self.get_metrics()?;
        metrics.apply_attempt(agent, record);
        self.write_metrics(&metrics)?;

        self.log_event(
            EventKind::AttemptEnd,
            Some(agent),
            serde_json::json!({
                "status": status.label(),
                "checkpoint": checkpoint,
                "cost_usd": cost_usd,
            }),
        )
    }

    /// Load the metrics document, or an empty one when none exists yet.
    pub fn get_metrics(&self) -> Result<SessionMetrics> {
        if !self.metrics_path.exists() {
            return Ok(SessionMetrics::default());
        }
        let content =
            fs::read_to_string(&self.metrics_path).context("Failed to read metrics file")?;
        serde_json::from_str(&content).context("Failed to parse metrics file")
    }

    fn write_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        let json =
            serde_json::to_string_pretty(metrics).context("Failed to serialize metrics")?;
        let tmp = self.metrics_path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write metrics temp file")?;
        fs::rename(&tmp, &self.metrics_path).context("Failed to move metrics into place")?;
        Ok(())
    }

    /// Per-agent metrics for one agent, if recorded.
    pub fn agent_metrics(&self, agent: &str) -> Result<Option<AgentMetrics>> {
        Ok(self.get_metrics()?.agents.get(agent).cloned())
    }

    /// Read back every event in emission order.
    pub fn events(&self) -> Result<Vec<AuditEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.events_path).context("Failed to open audit event log")?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read audit event line")?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash is skipped, not fatal.
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, "skipping malformed audit event"),
            }
        }
        Ok(events)
    }

    /// Timestamp of the last event attributed to an agent.
    pub fn last_event_time(&self, agent: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .events()?
            .iter()
            .rev()
            .find(|e| e.agent.as_deref() == Some(agent))
            .map(|e| e.timestamp))
    }
}
