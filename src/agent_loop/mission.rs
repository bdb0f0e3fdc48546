//! On-disk mission state for one agent.
//!
//! Everything an agent run needs to survive a restart lives under
//! `workspace/deliverables/findings/<agent>/`: the working `todo.txt`,
//! `finding_*.md` files from completed sub-agent tasks, staged
//! `staged_source_*.md` copies of large file reads, and the persisted
//! `done_tasks.json` dedup set for sub-agent delegation.

use crate::pipeline;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const TODO_FILE: &str = "todo.txt";
const DONE_TASKS_FILE: &str = "done_tasks.json";

/// Byte threshold above which a file read is staged to disk.
pub const STAGE_THRESHOLD: usize = 3_000;

/// The mission directory for an agent.
pub fn mission_dir(workspace: &Path, agent: &str) -> PathBuf {
    workspace.join("deliverables/findings").join(agent)
}

/// Ensure `todo.txt` exists, seeding a default checklist derived from the
/// agent's identity when missing. Returns the current todo content.
pub fn ensure_todo(workspace: &Path, agent: &str) -> Result<String> {
    let dir = mission_dir(workspace, agent);
    fs::create_dir_all(&dir).context("Failed to create mission directory")?;
    let path = dir.join(TODO_FILE);
    if path.exists() {
        return fs::read_to_string(&path).context("Failed to read todo.txt");
    }
    let default = default_checklist(agent);
    fs::write(&path, &default).context("Failed to seed todo.txt")?;
    Ok(default)
}

/// Default checklist for an agent kind.
fn default_checklist(agent: &str) -> String {
    let items: &[&str] = if pipeline::is_reporting_agent(agent) {
        &[
            "Read every deliverable under deliverables/",
            "Cross-reference confirmed findings with their evidence",
            "Write the final report deliverable",
        ]
    } else if pipeline::is_exploitation_agent(agent) {
        &[
            "Read the analysis queue for this vulnerability class",
            "Attempt each queued candidate against the target",
            "Record working proof for every confirmed finding",
            "Save the evidence deliverable",
        ]
    } else if pipeline::is_deep_analysis_agent(agent) {
        &[
            "Map candidate entry points in the source tree",
            "Trace untrusted input to dangerous sinks",
            "Rank candidates by exploitability",
            "Save the analysis and queue deliverables",
        ]
    } else {
        &[
            "Survey the target surface",
            "Record observations as findings",
            "Save the required deliverables",
        ]
    };
    let mut todo = String::new();
    for item in items {
        todo.push_str("[ ] ");
        todo.push_str(item);
        todo.push('\n');
    }
    todo
}

/// Persist a new todo list verbatim.
pub fn write_todo(workspace: &Path, agent: &str, todo: &str) -> Result<()> {
    let dir = mission_dir(workspace, agent);
    fs::create_dir_all(&dir).context("Failed to create mission directory")?;
    fs::write(dir.join(TODO_FILE), todo).context("Failed to write todo.txt")
}

/// Tick the unchecked todo line that best matches `task`.
///
/// Scoring is word overlap between the task and each `[ ]` line; ties go
/// to the earliest line. Returns the ticked line when anything changed.
pub fn tick_best_match(workspace: &Path, agent: &str, task: &str) -> Result<Option<String>> {
    let path = mission_dir(workspace, agent).join(TODO_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).context("Failed to read todo.txt")?;

    let task_words: BTreeSet<String> = words_of(task);
    let mut best: Option<(usize, usize)> = None; // (line index, score)
    for (index, line) in content.lines().enumerate() {
        if !line.trim_start().starts_with("[ ]") {
            continue;
        }
        let score = words_of(line).intersection(&task_words).count();
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((index, score));
        }
    }

    let Some((line_index, _)) = best else {
        return Ok(None);
    };
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    lines[line_index] = lines[line_index].replacen("[ ]", "[x]", 1);
    let ticked = lines[line_index].clone();
    fs::write(&path, lines.join("\n") + "\n").context("Failed to update todo.txt")?;
    Ok(Some(ticked))
}

fn words_of(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Persist a completed sub-agent investigation as a finding file.
pub fn persist_finding(workspace: &Path, agent: &str, task: &str, result: &str) -> Result<PathBuf> {
    let dir = mission_dir(workspace, agent);
    fs::create_dir_all(&dir).context("Failed to create mission directory")?;
    let slug = slugify(task);
    let mut path = dir.join(format!("finding_{slug}.md"));
    let mut counter = 2;
    while path.exists() {
        path = dir.join(format!("finding_{slug}_{counter}.md"));
        counter += 1;
    }
    let body = format!("# {task}\n\n{result}\n");
    fs::write(&path, body).context("Failed to write finding file")?;
    Ok(path)
}

/// Stage a large file read to disk. Returns the staged path; identical
/// reads of the same source are served from the same stage file.
pub fn stage_large_output(
    workspace: &Path,
    agent: &str,
    source: &str,
    content: &str,
) -> Result<PathBuf> {
    let dir = mission_dir(workspace, agent);
    fs::create_dir_all(&dir).context("Failed to create mission directory")?;
    let path = dir.join(format!("staged_source_{}.md", slugify(source)));
    if !path.exists() {
        fs::write(&path, content).context("Failed to stage output")?;
    }
    Ok(path)
}

/// Whether a source file already has a staged copy.
pub fn staged_path_for(workspace: &Path, agent: &str, source: &str) -> Option<PathBuf> {
    let path = mission_dir(workspace, agent).join(format!("staged_source_{}.md", slugify(source)));
    path.exists().then_some(path)
}

fn slugify(text: &str) -> String {
    let slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let collapsed = slug.split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_");
    let mut out = collapsed;
    out.truncate(60);
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

/// Load the persisted set of completed sub-agent tasks.
pub fn load_done_tasks(workspace: &Path, agent: &str) -> BTreeSet<String> {
    let path = mission_dir(workspace, agent).join(DONE_TASKS_FILE);
    fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

/// Record a completed sub-agent task.
pub fn add_done_task(workspace: &Path, agent: &str, task: &str) -> Result<()> {
    let dir = mission_dir(workspace, agent);
    fs::create_dir_all(&dir).context("Failed to create mission directory")?;
    let mut done = load_done_tasks(workspace, agent);
    done.insert(task.to_string());
    let json = serde_json::to_string_pretty(&done).context("Failed to serialize done tasks")?;
    fs::write(dir.join(DONE_TASKS_FILE), json).context("Failed to write done tasks")
}

/// Synthesised status recovered from disk for the compression marker.
pub fn status_marker(workspace: &Path, agent: &str) -> String {
    let dir = mission_dir(workspace, agent);
    let mut completed: Vec<String> = Vec::new();
    if let Ok(todo) = fs::read_to_string(dir.join(TODO_FILE)) {
        completed = todo
            .lines()
            .filter(|l| l.trim_start().starts_with("[x]"))
            .map(|l| l.trim().to_string())
            .collect();
    }
    let mut staged: Vec<String> = Vec::new();
    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("staged_source_") || name.starts_with("finding_") {
                staged.push(name);
            }
        }
    }
    staged.sort();

    let mut marker = String::new();
    if completed.is_empty() {
        marker.push_str("Completed tasks: none recorded.\n");
    } else {
        marker.push_str("Completed tasks:\n");
        for line in &completed {
            marker.push_str(&format!("  {line}\n"));
        }
    }
    if staged.is_empty() {
        marker.push_str("Staged files: none.");
    } else {
        marker.push_str(&format!("Staged files: {}", staged.join(", ")));
    }
    marker
}

/// The RESUME block injected when an agent restarts mid-mission.
pub fn resume_block(workspace: &Path, agent: &str) -> Option<String> {
    let dir = mission_dir(workspace, agent);
    let todo = fs::read_to_string(dir.join(TODO_FILE)).ok()?;
    let has_progress = todo.lines().any(|l| l.trim_start().starts_with("[x]"))
        || fs::read_dir(&dir)
            .map(|mut entries| entries.any(|e| {
                e.map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    name.starts_with("finding_") || name.starts_with("staged_source_")
                })
                .unwrap_or(false)
            }))
            .unwrap_or(false);
    if !has_progress {
        return None;
    }
    Some(format!(
        "[RESUME] This mission was interrupted and is resuming.\n{}\nCurrent todo list:\n{todo}",
        status_marker(workspace, agent)
    ))
}
