//! Detection of repetitive tool-call patterns.
//!
//! Three heuristics, checked after each assistant turn:
//!
//! (a) the same non-empty tool-call fingerprint set three turns running;
//! (b) too many search/open/read-class calls inside the recent window
//!     (12 assistant turns, 25 for deep-analysis agents);
//! (c) a reporting agent re-reading the same file over and over.
//!
//! A detection produces one corrective nudge and resets the history so the
//! agent gets a clean window to change behaviour.

use crate::llm::ToolCallRequest;
use crate::pipeline;
use std::collections::{HashMap, VecDeque};

/// Window of assistant turns considered for redundancy checks.
const WINDOW: usize = 12;
/// Wider window for agents doing deep source analysis.
const DEEP_WINDOW: usize = 25;
/// Search-class calls tolerated inside the window.
const SEARCH_THRESHOLD: usize = 10;
/// Search-class calls tolerated inside the deep window.
const DEEP_SEARCH_THRESHOLD: usize = 20;
/// Identical consecutive fingerprint sets that trigger (a).
const REPEAT_RUN: usize = 3;
/// Same-file reads by a reporting agent that trigger (c).
const REREAD_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
struct TurnRecord {
    /// Sorted fingerprints of this turn's tool calls.
    fingerprint: Vec<String>,
    /// Names of search-class calls in this turn.
    search_calls: usize,
    /// Paths read this turn (for the reread check).
    read_paths: Vec<String>,
}

/// Per-agent-run loop detector.
pub struct LoopDetector {
    agent: String,
    window: usize,
    search_threshold: usize,
    history: VecDeque<TurnRecord>,
}

impl LoopDetector {
    pub fn new(agent: &str) -> Self {
        let deep = pipeline::is_deep_analysis_agent(agent);
        Self {
            agent: agent.to_string(),
            window: if deep { DEEP_WINDOW } else { WINDOW },
            search_threshold: if deep {
                DEEP_SEARCH_THRESHOLD
            } else {
                SEARCH_THRESHOLD
            },
            history: VecDeque::new(),
        }
    }

    /// Record an assistant turn and report a detection, if any.
    pub fn observe(&mut self, calls: &[ToolCallRequest]) -> Option<String> {
        let mut fingerprint: Vec<String> = calls.iter().map(|c| c.fingerprint()).collect();
        fingerprint.sort();

        let search_calls = calls.iter().filter(|c| is_search_class(&c.name)).count();
        let read_paths = calls
            .iter()
            .filter(|c| is_read_class(&c.name))
            .filter_map(|c| c.arguments.get("path").and_then(|p| p.as_str()))
            .map(String::from)
            .collect();

        self.history.push_back(TurnRecord {
            fingerprint,
            search_calls,
            read_paths,
        });
        while self.history.len() > self.window {
            self.history.pop_front();
        }

        let detection = self
            .detect_identical_run()
            .or_else(|| self.detect_search_churn())
            .or_else(|| self.detect_report_reread());
        if detection.is_some() {
            // One nudge per pattern; give the agent a clean window.
            self.history.clear();
        }
        detection
    }

    /// (a) The same non-empty call set, `REPEAT_RUN` turns in a row.
    fn detect_identical_run(&self) -> Option<String> {
        if self.history.len() < REPEAT_RUN {
            return None;
        }
        let recent: Vec<&TurnRecord> = self.history.iter().rev().take(REPEAT_RUN).collect();
        let first = &recent[0].fingerprint;
        if first.is_empty() {
            return None;
        }
        if recent.iter().all(|r| &r.fingerprint == first) {
            return Some(format!(
                "The exact same tool call(s) ran {REPEAT_RUN} turns in a row."
            ));
        }
        None
    }

    /// (b) Too many search-class calls inside the window.
    fn detect_search_churn(&self) -> Option<String> {
        let total: usize = self.history.iter().map(|r| r.search_calls).sum();
        if total > self.search_threshold {
            return Some(format!(
                "{total} search/read calls in the last {} turns without converging.",
                self.history.len()
            ));
        }
        None
    }

    /// (c) A reporting agent re-reading the same file repeatedly.
    fn detect_report_reread(&self) -> Option<String> {
        if !pipeline::is_reporting_agent(&self.agent) {
            return None;
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in &self.history {
            for path in &record.read_paths {
                *counts.entry(path.as_str()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= REREAD_THRESHOLD)
            .map(|(path, count)| {
                format!("You have read {path} {count} times; its contents have not changed.")
            })
    }
}

fn is_search_class(name: &str) -> bool {
    matches!(
        name,
        "search_files" | "grep" | "list_files" | "read_file" | "open_file" | "cat"
    )
}

fn is_read_class(name: &str) -> bool {
    matches!(name, "read_file" | "open_file" | "cat")
}
