//! Kernel-authored nudges injected into agent transcripts.
//!
//! At fixed fractions of the turn budget the loop reminds the agent where
//! it stands; each milestone fires once. Loop detection, silence, and
//! missing-deliverable enforcement have their own messages. Sub-agent runs
//! receive none of the budget nudges.

use std::collections::BTreeSet;

/// Budget milestones, in percent of the turn budget.
pub const MILESTONES: [u8; 6] = [50, 70, 85, 90, 95, 100];

/// Tracks which milestones already fired for one agent run.
#[derive(Debug, Default)]
pub struct NudgeSchedule {
    fired: BTreeSet<u8>,
}

impl NudgeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The nudge due at this turn, if any. Returns the highest unfired
    /// milestone at or below the current budget fraction, so a long jump
    /// (e.g. compression ate turns) fires one message, not five.
    pub fn due(&mut self, turn: u32, max_turns: u32) -> Option<String> {
        if max_turns == 0 {
            return None;
        }
        let percent = (turn.saturating_mul(100) / max_turns).min(100) as u8;
        let milestone = MILESTONES
            .iter()
            .rev()
            .find(|m| **m <= percent && !self.fired.contains(*m))
            .copied()?;
        // Mark everything at or below as fired so skipped milestones
        // never fire late.
        for m in MILESTONES.iter().filter(|m| **m <= milestone) {
            self.fired.insert(*m);
        }
        Some(milestone_text(milestone).to_string())
    }

    #[cfg(test)]
    fn fired_count(&self) -> usize {
        self.fired.len()
    }
}

fn milestone_text(milestone: u8) -> &'static str {
    match milestone {
        50 => {
            "[BUDGET] You have used half of your turn budget. Review your todo list \
             and make sure the remaining work fits the remaining turns."
        }
        70 => {
            "[BUDGET] 70% of your turn budget is spent. Start organising what you \
             have found; close out low-value investigations."
        }
        85 => {
            "[BUDGET] 85% of your turn budget is spent. Begin writing your summary \
             now and only verify what the summary depends on."
        }
        90 => {
            "[BUDGET] 90% of your turn budget is spent. Stop opening new \
             investigations; finish the ones needed for your deliverables."
        }
        95 => {
            "[BUDGET] 95% of your turn budget is spent. Emergency finalisation: \
             write your deliverables with what you have."
        }
        _ => {
            "[BUDGET] Your turn budget is exhausted. Call save_deliverable NOW with \
             your current findings; nothing else."
        }
    }
}

/// The corrective message appended when loop detection fires.
pub fn loop_nudge(reason: &str) -> String {
    format!(
        "[LOOP DETECTION] {reason} Stop repeating this pattern. Synthesise what \
         you already know and move to the next item on your todo list."
    )
}

/// Critical enforcement message for missing required deliverables.
pub fn deliverable_nudge(agent: &str, missing: &[String]) -> String {
    format!(
        "[CRITICAL] You are not done: agent {agent} must still save the following \
         deliverable type(s) before it may finish: {}. Call save_deliverable for \
         each of them now.",
        missing.join(", ")
    )
}

/// Message after an empty assistant turn. At most two are sent before the
/// run fails as stuck in silence.
pub fn silence_nudge(count: u32) -> String {
    match count {
        1 => "[SILENCE] Your last message was empty. Continue with your next tool \
              call or state your findings."
            .to_string(),
        _ => "[SILENCE] Second empty message. If you have nothing further to \
              investigate, save your deliverables and finish."
            .to_string(),
    }
}
