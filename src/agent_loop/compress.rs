//! Transcript compression and prompt-window preparation.
//!
//! Two distinct concerns:
//!
//! - `compress_history` runs when the serialized transcript outgrows the
//!   configured threshold: keep the first message, keep the recent window,
//!   and stand a synthesised status marker in for everything dropped.
//! - `prepare_messages` runs every turn: strip unmatched tool-call/result
//!   pairs, coalesce consecutive same-role messages, scrub control and
//!   model-control tokens, then shrink until the serialized size fits the
//!   prompt budget. The loop never sends a prompt above the budget.

use crate::llm::{Message, Role};
use crate::util::strip_control_chars;
use std::collections::HashSet;

/// Model-specific control tokens scrubbed from content.
const CONTROL_TOKENS: [&str; 6] = [
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|start_header_id|>",
    "<|end_header_id|>",
];

/// Serialized size of a transcript, used against the compression threshold.
pub fn transcript_size(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.approximate_chars() + 32).sum()
}

/// Compress an oversized transcript.
///
/// Keeps the first message, then a synthesised status marker, then the
/// last `keep_recent` messages. The marker text is recovered from disk by
/// the mission module so compression itself stays pure.
pub fn compress_history(
    messages: &[Message],
    keep_recent: usize,
    status_marker: &str,
) -> Vec<Message> {
    if messages.len() <= keep_recent + 1 {
        return messages.to_vec();
    }
    let mut compressed = Vec::with_capacity(keep_recent + 2);
    compressed.push(messages[0].clone());
    compressed.push(Message::system(format!(
        "[CONTEXT COMPRESSED] Older turns were dropped to stay within limits.\n{status_marker}"
    )));

    let mut tail: Vec<Message> = messages[messages.len() - keep_recent..].to_vec();
    // Never begin the window with orphaned tool results.
    while tail
        .first()
        .map(|m| m.role == Role::Tool)
        .unwrap_or(false)
    {
        tail.remove(0);
    }
    compressed.extend(tail);
    compressed
}

/// Prepare the prompt window for one LLM call.
pub fn prepare_messages(messages: &[Message], max_prompt_chars: usize) -> Vec<Message> {
    let stripped = strip_unmatched_pairs(messages);
    let coalesced = coalesce_same_role(&stripped);
    let mut cleaned: Vec<Message> = coalesced.into_iter().map(scrub_message).collect();
    shrink_to_budget(&mut cleaned, max_prompt_chars);
    cleaned
}

/// Remove tool results with no matching assistant call, and drop declared
/// calls whose results never arrived (except on the final message, whose
/// results are still pending).
fn strip_unmatched_pairs(messages: &[Message]) -> Vec<Message> {
    let result_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let call_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
        .collect();

    let last_index = messages.len().saturating_sub(1);
    let mut kept = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        match message.role {
            Role::Tool => {
                let matched = message
                    .tool_call_id
                    .as_deref()
                    .map(|id| call_ids.contains(id))
                    .unwrap_or(false);
                if matched {
                    kept.push(message.clone());
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() && index != last_index => {
                let answered: Vec<_> = message
                    .tool_calls
                    .iter()
                    .filter(|c| result_ids.contains(c.id.as_str()))
                    .cloned()
                    .collect();
                if answered.is_empty() && message.content.is_empty() {
                    continue; // nothing useful survives
                }
                let mut cloned = message.clone();
                cloned.tool_calls = answered;
                kept.push(cloned);
            }
            _ => kept.push(message.clone()),
        }
    }
    kept
}

/// Merge consecutive same-role messages that carry no tool linkage.
fn coalesce_same_role(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let mergeable = message.tool_calls.is_empty() && message.tool_call_id.is_none();
        if let Some(last) = out.last_mut() {
            let last_mergeable = last.tool_calls.is_empty() && last.tool_call_id.is_none();
            if mergeable && last_mergeable && last.role == message.role {
                if !message.content.is_empty() {
                    if !last.content.is_empty() {
                        last.content.push_str("\n\n");
                    }
                    last.content.push_str(&message.content);
                }
                continue;
            }
        }
        out.push(message.clone());
    }
    out
}

/// Strip control characters and model control tokens from one message.
fn scrub_message(mut message: Message) -> Message {
    let mut content = strip_control_chars(&message.content);
    for token in CONTROL_TOKENS {
        if content.contains(token) {
            content = content.replace(token, "");
        }
    }
    message.content = content;
    message
}

/// Shrink until the serialized size fits the budget: first shorten the
/// oldest long contents, then slide the window forward.
fn shrink_to_budget(messages: &mut Vec<Message>, max_prompt_chars: usize) {
    const SHORTEN_FLOOR: usize = 600;

    if transcript_size(messages) <= max_prompt_chars {
        return;
    }

    // Pass 1: shorten long message bodies, oldest first, sparing the
    // first (system) message.
    for index in 1..messages.len() {
        if transcript_size(messages) <= max_prompt_chars {
            return;
        }
        let message = &mut messages[index];
        if message.content.len() > SHORTEN_FLOOR {
            message.content =
                crate::util::truncate_with_marker(&message.content, SHORTEN_FLOOR);
        }
    }

    // Pass 2: drop the oldest non-system messages. Leading orphaned tool
    // results go with the assistant message that owned them.
    while transcript_size(messages) > max_prompt_chars && messages.len() > 2 {
        messages.remove(1);
        while messages
            .get(1)
            .map(|m| m.role == Role::Tool)
            .unwrap_or(false)
        {
            messages.remove(1);
        }
    }
}
