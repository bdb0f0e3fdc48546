//! `--status` and `--list-agents` rendering.

use super::{reconcile_session, resolve_session};
use crate::errors::KernelError;
use crate::kernel::Kernel;
use crate::pipeline::{self, Pipeline};
use crate::scheduler::RunSummary;
use crate::session::Session;
use console::style;

/// `--status [--session <id>]`: print the reconciled session status.
///
/// Promotions, demotions, and failures from the audit log are applied;
/// the stale-running correction is computed but not persisted here, so a
/// status query never changes what a concurrently running orchestrator
/// believes.
pub async fn cmd_status(kernel: &Kernel, session_id: Option<&str>) -> Result<(), KernelError> {
    let session = resolve_session(kernel, session_id).await?;
    reconcile_session(kernel, &session, false).await?;
    let session = resolve_session(kernel, Some(&session.id)).await?;

    print_session(&session);
    Ok(())
}

fn print_session(session: &Session) {
    println!("{}", style(format!("Session {}", session.id)).bold());
    println!("  target:    {}", session.target);
    println!("  workspace: {}", session.workspace.display());
    println!("  status:    {}", style(session.status).cyan());
    println!("  created:   {}", session.created_at.to_rfc3339());
    println!("  activity:  {}", session.last_activity.to_rfc3339());
    println!();

    for spec in pipeline::agents_for(session.pipeline) {
        let state = if session.completed_agents.contains(spec.name) {
            style("done").green()
        } else if session.running_agents.contains(spec.name) {
            style("running").cyan()
        } else if session.failed_agents.contains(spec.name) {
            style("failed").red()
        } else if session.skipped_agents.contains(spec.name) {
            style("skipped").yellow()
        } else {
            style("pending").dim()
        };

        let timing = session
            .timing_breakdown
            .get(spec.name)
            .map(|ms| format!(" {:.1}s", *ms as f64 / 1000.0))
            .unwrap_or_default();
        let cost = session
            .cost_breakdown
            .get(spec.name)
            .filter(|c| **c > 0.0)
            .map(|c| format!(" ${c:.2}"))
            .unwrap_or_default();
        let checkpoint = session
            .checkpoints
            .get(spec.name)
            .map(|cp| format!(" [{}]", &cp[..cp.len().min(8)]))
            .unwrap_or_default();

        println!("  {:24} {:8}{timing}{cost}{checkpoint}", spec.name, state);
    }
}

/// `--list-agents`: the full agent catalogue across all pipelines.
pub fn cmd_list_agents() {
    for (pipeline, label) in [
        (Pipeline::Main, "main pipeline"),
        (Pipeline::ReverseEngineering, "re pipeline"),
        (Pipeline::OpenSourceVuln, "osv pipeline"),
    ] {
        println!("{}", style(label).bold());
        for spec in pipeline::agents_for(pipeline) {
            let prereqs = if spec.prerequisites.is_empty() {
                String::new()
            } else {
                format!(" (requires {})", spec.prerequisites.join(", "))
            };
            println!(
                "  {:16} {:10} {}{prereqs}",
                spec.name,
                spec.phase.name(),
                spec.display_name
            );
        }
        println!();
    }
}

/// Print a scheduler run summary.
pub fn print_summary(summary: &RunSummary) {
    if !summary.completed.is_empty() {
        println!(
            "{} {}",
            style("completed:").green(),
            summary.completed.join(", ")
        );
    }
    if !summary.skipped.is_empty() {
        println!(
            "{} {}",
            style("skipped:").yellow(),
            summary.skipped.join(", ")
        );
    }
    if !summary.failed.is_empty() {
        println!("{} {}", style("failed:").red(), summary.failed.join(", "));
    }
    if summary.completed.is_empty() && summary.skipped.is_empty() && summary.failed.is_empty() {
        println!("nothing to do");
    }
}
