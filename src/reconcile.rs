//! Session/audit reconciliation.
//!
//! The audit log is authoritative; the session store is a mirror that may
//! drift after crashes or out-of-band edits. Reconciliation reads the
//! per-agent metrics and applies four disjoint corrections:
//!
//! 1. Promotions — latest audit status `success`, agent missing from
//!    `completed`: add it together with its checkpoint.
//! 2. Demotions — latest audit status `rolled-back`, agent still in
//!    `completed`: remove it and its checkpoint entry.
//! 3. Failures — latest audit status `failed`, agent missing from
//!    `failed`: add it.
//! 4. Stale running — agent in `running` whose last audit event is older
//!    than the threshold: move it to `failed`. Optional, default on;
//!    status-only commands pass `apply_stale_running: false` and report
//!    drift without persisting it.
//!
//! Running reconciliation twice yields the same session state.

use crate::audit::{AttemptStatus, AuditLog};
use crate::errors::KernelError;
use crate::session::{Session, SessionStore};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

/// Options controlling a reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Apply the stale-running correction (default on).
    pub apply_stale_running: bool,
    /// Threshold for the stale-running correction.
    pub stale_after: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            apply_stale_running: true,
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
    pub failed: Vec<String>,
    pub stale_running: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.promoted.is_empty()
            && self.demoted.is_empty()
            && self.failed.is_empty()
            && self.stale_running.is_empty()
    }
}

/// Compute the corrections without applying them.
pub fn plan(
    session: &Session,
    audit: &AuditLog,
    options: &ReconcileOptions,
) -> Result<ReconcileReport, KernelError> {
    let metrics = audit.get_metrics().map_err(KernelError::Other)?;
    let mut report = ReconcileReport::default();

    for (agent, agent_metrics) in &metrics.agents {
        match agent_metrics.status {
            AttemptStatus::Success => {
                if !session.completed_agents.contains(agent) {
                    report.promoted.push(agent.clone());
                }
            }
            AttemptStatus::RolledBack => {
                if session.completed_agents.contains(agent) {
                    report.demoted.push(agent.clone());
                }
            }
            AttemptStatus::Failed => {
                if !session.failed_agents.contains(agent) {
                    report.failed.push(agent.clone());
                }
            }
        }
    }

    if options.apply_stale_running {
        let threshold = chrono::Duration::from_std(options.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let now = Utc::now();
        for agent in &session.running_agents {
            // Already being corrected for another reason; keep actions disjoint.
            if report.promoted.contains(agent) || report.failed.contains(agent) {
                continue;
            }
            let last = audit.last_event_time(agent).map_err(KernelError::Other)?;
            let stale = match last {
                Some(ts) => now - ts > threshold,
                // Running with no audit trace at all counts as stale.
                None => true,
            };
            if stale {
                report.stale_running.push(agent.clone());
            }
        }
    }

    Ok(report)
}

/// Reconcile one session from its audit log and persist the corrections.
pub async fn reconcile(
    store: &SessionStore,
    audit: &AuditLog,
    session_id: &str,
    options: &ReconcileOptions,
) -> Result<ReconcileReport, KernelError> {
    let session = store
        .get(session_id)
        .await?
        .ok_or_else(|| KernelError::SessionNotFound {
            id: session_id.to_string(),
        })?;

    let metrics = audit.get_metrics().map_err(KernelError::Other)?;
    let report = plan(&session, audit, options)?;
    if report.is_noop() {
        debug!(session = %session_id, "reconciliation: no drift");
        return Ok(report);
    }

    info!(
        session = %session_id,
        promoted = report.promoted.len(),
        demoted = report.demoted.len(),
        failed = report.failed.len(),
        stale = report.stale_running.len(),
        "reconciling session from audit log"
    );

    let applied = report.clone();
    store
        .update(session_id, move |s| {
            for agent in &applied.promoted {
                let checkpoint = metrics
                    .agents
                    .get(agent)
                    .and_then(|m| m.checkpoint.clone());
                s.mark_completed(agent, checkpoint);
            }
            for agent in &applied.demoted {
                s.completed_agents.remove(agent);
                s.checkpoints.remove(agent);
            }
            for agent in &applied.failed {
                s.mark_failed(agent);
            }
            for agent in &applied.stale_running {
                s.mark_failed(agent);
            }
            // Carry timing and cost aggregates forward from the audit log.
            for (agent, m) in &metrics.agents {
                if m.status == AttemptStatus::Success {
                    s.timing_breakdown
                        .insert(agent.clone(), m.final_duration_ms);
                    s.cost_breakdown.insert(agent.clone(), m.total_cost_usd);
                }
            }
        })
        .await?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        store: SessionStore,
        audit: AuditLog,
        session_id: String,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path(), Duration::from_secs(3600));
        let ws = dir.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        let session = store
            .create("https://t.example.com", &ws, None, Pipeline::Main)
            .await
            .unwrap();
        let audit = AuditLog::new(&store.audit_dir(&session));
        Fixture {
            store,
            audit,
            session_id: session.id,
            _dir: dir,
        }
    }

    fn record(audit: &AuditLog, agent: &str, status: AttemptStatus, checkpoint: Option<&str>) {
        let now = Utc::now();
        audit
            .record_attempt(
                agent,
                now - chrono::Duration::seconds(5),
                now,
                status,
                checkpoint.map(String::from),
                0.25,
                None,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_promotion_from_audit_success() {
        let f = fixture().await;
        // Session thinks nothing completed; audit says recon succeeded.
        record(&f.audit, "recon", AttemptStatus::Success, Some("cp-1"));

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.promoted, vec!["recon"]);
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.completed_agents.contains("recon"));
        assert_eq!(session.checkpoints["recon"], "cp-1");
        // Cost and timing carried forward.
        assert!(session.cost_breakdown["recon"] > 0.0);
    }

    #[tokio::test]
    async fn test_demotion_of_rolled_back_agent() {
        let f = fixture().await;
        f.store
            .mark_completed(&f.session_id, "recon", Some("cp-1".into()))
            .await
            .unwrap();
        record(&f.audit, "recon", AttemptStatus::Success, Some("cp-1"));
        record(&f.audit, "recon", AttemptStatus::RolledBack, None);

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.demoted, vec!["recon"]);
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(!session.completed_agents.contains("recon"));
        assert!(!session.checkpoints.contains_key("recon"));
    }

    #[tokio::test]
    async fn test_failure_correction() {
        let f = fixture().await;
        record(&f.audit, "api-fuzzer", AttemptStatus::Failed, None);

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failed, vec!["api-fuzzer"]);
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.failed_agents.contains("api-fuzzer"));
    }

    #[tokio::test]
    async fn test_stale_running_moved_to_failed() {
        let f = fixture().await;
        f.store.mark_running(&f.session_id, "recon").await.unwrap();
        // No audit events at all for recon: counts as stale.

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();

        assert_eq!(report.stale_running, vec!["recon"]);
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.failed_agents.contains("recon"));
        assert!(session.running_agents.is_empty());
    }

    #[tokio::test]
    async fn test_recent_running_agent_left_alone() {
        let f = fixture().await;
        f.store.mark_running(&f.session_id, "recon").await.unwrap();
        f.audit
            .log_event(
                crate::audit::EventKind::ToolCall,
                Some("recon"),
                serde_json::json!({}),
            )
            .unwrap();

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();

        assert!(report.stale_running.is_empty());
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.running_agents.contains("recon"));
    }

    #[tokio::test]
    async fn test_stale_running_skipped_when_disabled() {
        let f = fixture().await;
        f.store.mark_running(&f.session_id, "recon").await.unwrap();

        let options = ReconcileOptions {
            apply_stale_running: false,
            ..Default::default()
        };
        let report = reconcile(&f.store, &f.audit, &f.session_id, &options)
            .await
            .unwrap();

        assert!(report.is_noop());
        let session = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert!(session.running_agents.contains("recon"));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let f = fixture().await;
        record(&f.audit, "pre-recon", AttemptStatus::Success, Some("cp-0"));
        record(&f.audit, "recon", AttemptStatus::Failed, None);

        let first = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(!first.is_noop());

        let second = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(second.is_noop(), "second pass must be a no-op: {second:?}");

        let after_first = f.store.get(&f.session_id).await.unwrap().unwrap();
        let third = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(third.is_noop());
        let after_third = f.store.get(&f.session_id).await.unwrap().unwrap();
        assert_eq!(after_first.completed_agents, after_third.completed_agents);
        assert_eq!(after_first.failed_agents, after_third.failed_agents);
    }

    #[tokio::test]
    async fn test_reconcile_after_rollback_is_noop() {
        // Scenario S2 tail: post-rollback state already mirrors the audit log.
        let f = fixture().await;
        f.store
            .mark_completed(&f.session_id, "pre-recon", None)
            .await
            .unwrap();
        record(&f.audit, "pre-recon", AttemptStatus::Success, None);
        record(&f.audit, "recon", AttemptStatus::RolledBack, None);
        record(&f.audit, "recon-verify", AttemptStatus::RolledBack, None);

        let report = reconcile(&f.store, &f.audit, &f.session_id, &ReconcileOptions::default())
            .await
            .unwrap();
        assert!(report.is_noop(), "rollback already reconciled: {report:?}");
    }

    #[tokio::test]
    async fn test_missing_session_is_validation_error() {
        let f = fixture().await;
        let err = reconcile(&f.store, &f.audit, "missing", &ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::SessionNotFound { .. }));
    }
}
