//! `--cleanup`: delete sessions and their durable artifacts.

use crate::errors::KernelError;
use crate::kernel::Kernel;
use console::style;
use dialoguer::Confirm;

/// `--cleanup [<session-id>]`.
///
/// With an id, delete that one session. Without, confirm and delete all.
/// Deletion removes the session record plus the workspace `deliverables/`
/// and `outputs/` directories and the session's audit directory.
pub async fn cmd_cleanup(
    kernel: &Kernel,
    session_id: Option<&str>,
    assume_yes: bool,
) -> Result<(), KernelError> {
    match session_id {
        Some(id) => {
            if kernel.store.delete(id).await? {
                println!("Deleted session {id}");
            } else {
                println!("No session {id}");
            }
        }
        None => {
            let sessions = kernel.store.list().await?;
            if sessions.is_empty() {
                println!("No sessions to delete");
                return Ok(());
            }
            println!(
                "{}",
                style(format!("About to delete {} session(s):", sessions.len())).bold()
            );
            for session in &sessions {
                println!("  {} -> {}", session.id, session.target);
            }
            let confirmed = assume_yes
                || Confirm::new()
                    .with_prompt("Delete all sessions and their artifacts?")
                    .default(false)
                    .interact()
                    .map_err(|e| KernelError::Config(format!("prompt failed: {e}")))?;
            if !confirmed {
                println!("Aborted");
                return Ok(());
            }
            let removed = kernel.store.delete_all().await?;
            println!("Deleted {removed} session(s)");
        }
    }
    Ok(())
}
