//! Message formatter — stored history to LLM wire messages, and validation
//! of draft sequences before they are appended.
//!
//! The provider contract is strict: an assistant message that declares tool
//! calls must be followed by one tool message per call id before the next
//! assistant turn, or the provider rejects the whole request. The append
//! path runs [`validate_drafts`] so stored histories always satisfy this;
//! [`to_wire`] additionally repairs by dropping any orphaned pair it finds
//! in old rows, as a last line of defense.

use std::collections::HashSet;

use td_domain::message::{MessageDraft, Role, StoredMessage, WireMessage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored → wire
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert stored messages into wire messages for the LLM.
///
/// Orphan handling: an assistant-with-tool-calls whose calls are not all
/// answered by the immediately following tool messages is dropped together
/// with whatever partial answers it has; stray tool messages with no
/// preceding assistant call are dropped too. Both are logged — they can
/// only appear through historic bugs, never through the current append
/// path.
pub fn to_wire(stored: &[StoredMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(stored.len());
    let mut i = 0;

    while i < stored.len() {
        let msg = &stored[i];
        match msg.role {
            Role::User => {
                wire.push(WireMessage::user(&msg.content));
                i += 1;
            }
            Role::Assistant if msg.tool_calls.is_empty() => {
                wire.push(WireMessage::assistant(&msg.content));
                i += 1;
            }
            Role::Assistant => {
                let mut remaining: HashSet<&str> =
                    msg.tool_calls.iter().map(|c| c.call_id.as_str()).collect();
                let mut answers = Vec::with_capacity(remaining.len());

                let mut j = i + 1;
                while j < stored.len() && stored[j].role == Role::Tool && !remaining.is_empty() {
                    let tool_msg = &stored[j];
                    match tool_msg.tool_call_id.as_deref() {
                        Some(call_id) if remaining.remove(call_id) => {
                            answers.push(WireMessage::tool_result(call_id, &tool_msg.content));
                        }
                        _ => {
                            tracing::warn!(
                                message_id = %tool_msg.id,
                                "dropping tool message that answers no pending call"
                            );
                        }
                    }
                    j += 1;
                }

                if remaining.is_empty() {
                    wire.push(WireMessage::assistant_with_calls(
                        &msg.content,
                        msg.tool_calls.clone(),
                    ));
                    wire.extend(answers);
                } else {
                    tracing::warn!(
                        message_id = %msg.id,
                        unanswered = remaining.len(),
                        "dropping orphaned assistant tool-call message"
                    );
                }
                i = j;
            }
            Role::Tool => {
                tracing::warn!(
                    message_id = %msg.id,
                    "dropping stray tool message with no preceding assistant call"
                );
                i += 1;
            }
            // The system prompt is never persisted; skip defensively.
            Role::System => i += 1,
        }
    }

    wire
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Draft validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check that a draft sequence, appended as-is, keeps the stored history
/// provider-valid. Returns a description of the first violation.
pub fn validate_drafts(drafts: &[MessageDraft]) -> Result<(), String> {
    let mut idx = 0;

    while idx < drafts.len() {
        let draft = &drafts[idx];
        match draft.role {
            Role::System => return Err(format!("draft {idx}: system messages are never stored")),
            Role::User => {
                if !draft.tool_calls.is_empty()
                    || draft.tool_call_id.is_some()
                    || draft.tool_name.is_some()
                {
                    return Err(format!("draft {idx}: user message carries tool fields"));
                }
                idx += 1;
            }
            Role::Tool => {
                return Err(format!(
                    "draft {idx}: tool message without a preceding assistant call"
                ));
            }
            Role::Assistant if draft.tool_calls.is_empty() => idx += 1,
            Role::Assistant => {
                let mut remaining: HashSet<&str> = HashSet::new();
                for call in &draft.tool_calls {
                    if call.call_id.is_empty() {
                        return Err(format!("draft {idx}: empty tool call id"));
                    }
                    if !remaining.insert(call.call_id.as_str()) {
                        return Err(format!(
                            "draft {idx}: duplicate tool call id '{}'",
                            call.call_id
                        ));
                    }
                }

                let mut j = idx + 1;
                while !remaining.is_empty() {
                    let Some(tool_draft) = drafts.get(j) else {
                        return Err(format!(
                            "draft {idx}: {} tool call(s) left unanswered",
                            remaining.len()
                        ));
                    };
                    if tool_draft.role != Role::Tool {
                        return Err(format!(
                            "draft {j}: expected a tool response, found {:?}",
                            tool_draft.role
                        ));
                    }
                    let Some(call_id) = tool_draft.tool_call_id.as_deref() else {
                        return Err(format!("draft {j}: tool message without tool_call_id"));
                    };
                    if tool_draft.tool_name.is_none() {
                        return Err(format!("draft {j}: tool message without tool_name"));
                    }
                    if !remaining.remove(call_id) {
                        return Err(format!(
                            "draft {j}: tool response for undeclared call '{call_id}'"
                        ));
                    }
                    j += 1;
                }
                idx = j;
            }
        }
    }

    Ok(())
}

/// Length of the longest draft prefix made of complete units (a unit is a
/// user message, a plain assistant message, or an assistant-with-calls plus
/// all its tool responses). Used to cut a turn that was interrupted
/// mid-pair before persisting it.
pub fn complete_prefix_len(drafts: &[MessageDraft]) -> usize {
    let mut idx = 0;
    let mut last_complete = 0;

    while idx < drafts.len() {
        let draft = &drafts[idx];
        match draft.role {
            Role::User => {
                idx += 1;
                last_complete = idx;
            }
            Role::Assistant if draft.tool_calls.is_empty() => {
                idx += 1;
                last_complete = idx;
            }
            Role::Assistant => {
                let mut remaining: HashSet<&str> =
                    draft.tool_calls.iter().map(|c| c.call_id.as_str()).collect();
                let mut j = idx + 1;
                while let Some(tool_draft) = drafts.get(j) {
                    if tool_draft.role != Role::Tool {
                        break;
                    }
                    if let Some(call_id) = tool_draft.tool_call_id.as_deref() {
                        remaining.remove(call_id);
                    }
                    j += 1;
                    if remaining.is_empty() {
                        break;
                    }
                }
                if !remaining.is_empty() {
                    // Incomplete pair: everything from the assistant on is cut.
                    return last_complete;
                }
                idx = j;
                last_complete = idx;
            }
            _ => return last_complete,
        }
    }

    last_complete
}
