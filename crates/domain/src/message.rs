use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single tool invocation requested by the model.
///
/// The same record is used on the wire (provider adapters convert it
/// to/from the provider format) and inside the stored `tool_calls` column,
/// so persisted histories round-trip losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Parse a stored role string. Only the persisted roles are accepted;
    /// the system prompt is never written to the store.
    pub fn from_stored(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message in provider-agnostic wire form. Adapters translate this into
/// the provider's chat-completions message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set only for `Role::Tool`: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message draft: everything needed to persist one message, minus the
/// identifiers and timestamp the store assigns at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl MessageDraft {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: calls,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// A persisted message, as read back from the conversation store.
/// Chronological order within a conversation is `(created_at, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// True for an assistant message that declared at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// A conversation: an ordered, per-user sequence of messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub owner: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// tool_calls column round-trip
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize a tool-call list for the `tool_calls` column. Empty lists are
/// stored as NULL so absence and emptiness stay equivalent.
pub fn tool_calls_to_column(calls: &[ToolCall]) -> Option<String> {
    if calls.is_empty() {
        return None;
    }
    // ToolCall contains only JSON-representable fields.
    serde_json::to_string(calls).ok()
}

/// Parse the `tool_calls` column back into structured records. A NULL or
/// unparseable column yields an empty list; corruption is logged, not fatal.
pub fn tool_calls_from_column(raw: Option<&str>) -> Vec<ToolCall> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(calls) => calls,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable tool_calls column, treating as empty");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_column_round_trip() {
        let calls = vec![
            ToolCall {
                call_id: "call_1".into(),
                tool_name: "add_task".into(),
                arguments: serde_json::json!({ "title": "Buy milk" }),
            },
            ToolCall {
                call_id: "call_2".into(),
                tool_name: "list_tasks".into(),
                arguments: serde_json::json!({}),
            },
        ];

        let column = tool_calls_to_column(&calls).unwrap();
        let parsed = tool_calls_from_column(Some(&column));
        assert_eq!(parsed, calls);
    }

    #[test]
    fn empty_tool_calls_store_as_null() {
        assert_eq!(tool_calls_to_column(&[]), None);
        assert!(tool_calls_from_column(None).is_empty());
    }

    #[test]
    fn corrupt_tool_calls_column_is_empty_not_fatal() {
        assert!(tool_calls_from_column(Some("not json")).is_empty());
    }

    #[test]
    fn stored_roles_exclude_system() {
        assert_eq!(Role::from_stored("user"), Some(Role::User));
        assert_eq!(Role::from_stored("assistant"), Some(Role::Assistant));
        assert_eq!(Role::from_stored("tool"), Some(Role::Tool));
        assert_eq!(Role::from_stored("system"), None);
    }

    #[test]
    fn tool_draft_carries_call_id_and_name() {
        let draft = MessageDraft::tool("call_9", "delete_task", "{\"success\":true}");
        assert_eq!(draft.role, Role::Tool);
        assert_eq!(draft.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(draft.tool_name.as_deref(), Some("delete_task"));
    }
}
