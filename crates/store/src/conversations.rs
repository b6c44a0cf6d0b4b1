//! Append-only conversation log.
//!
//! Appends are serialized per conversation: the transaction first updates
//! the conversation row, which both asserts ownership and takes the row
//! lock, then inserts the drafts in order. Each message gets a strictly
//! increasing `created_at` so `(created_at, id)` is a total order even when
//! a whole turn lands within one clock millisecond.

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use td_domain::message::{
    tool_calls_from_column, tool_calls_to_column, Conversation, MessageDraft, Role, StoredMessage,
};

use crate::{Result, StoreError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, FromRow)]
struct ConversationRow {
    id: String,
    owner: String,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| StoreError::Corrupt(format!("conversation id {}: {e}", row.id)))?;
        Ok(Conversation {
            id,
            owner: row.owner,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    tool_calls: Option<String>,
    tool_call_id: Option<String>,
    tool_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| StoreError::Corrupt(format!("message id {}: {e}", row.id)))?;
        let conversation_id = Uuid::parse_str(&row.conversation_id)
            .map_err(|e| StoreError::Corrupt(format!("conversation id: {e}")))?;
        let role = Role::from_stored(&row.role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown role {:?}", row.role)))?;
        Ok(StoredMessage {
            id,
            conversation_id,
            role,
            content: row.content,
            tool_calls: tool_calls_from_column(row.tool_calls.as_deref()),
            tool_call_id: row.tool_call_id,
            tool_name: row.tool_name,
            created_at: row.created_at,
        })
    }
}

const SELECT_MESSAGE: &str = "SELECT id, conversation_id, role, content, tool_calls, \
     tool_call_id, tool_name, created_at FROM messages";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConversationStore<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConversationStore<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, owner: &str, title: Option<&str>) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO conversations (id, owner, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(owner)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(Conversation {
            id,
            owner: owner.to_string(),
            title: title.map(String::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// `None` for both "no such conversation" and "someone else's
    /// conversation".
    pub async fn get(&self, id: Uuid, owner: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, owner, title, created_at, updated_at FROM conversations \
             WHERE id = ? AND owner = ?",
        )
        .bind(id.to_string())
        .bind(owner)
        .fetch_optional(self.pool)
        .await?;

        row.map(Conversation::try_from).transpose()
    }

    /// Most recently active first, for the conversation sidebar.
    pub async fn list(&self, owner: &str, limit: u32) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, owner, title, created_at, updated_at FROM conversations \
             WHERE owner = ? ORDER BY updated_at DESC, id DESC LIMIT ?",
        )
        .bind(owner)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    /// Append a turn's drafts as one atomic unit.
    ///
    /// The leading UPDATE asserts ownership and serializes concurrent
    /// appends to the same conversation; either every draft lands or none
    /// does.
    pub async fn append_messages(
        &self,
        conversation_id: Uuid,
        owner: &str,
        drafts: &[MessageDraft],
    ) -> Result<Vec<StoredMessage>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let touched =
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ? AND owner = ?")
                .bind(now)
                .bind(conversation_id.to_string())
                .bind(owner)
                .execute(&mut *tx)
                .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound);
        }

        // Start strictly after the newest stored message so appends never
        // tie or regress on created_at.
        let last: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.to_string())
                .fetch_one(&mut *tx)
                .await?;
        let mut ts = match last {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };

        let mut appended = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let id = Uuid::new_v4();
            let tool_calls_column = tool_calls_to_column(&draft.tool_calls);

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, tool_calls, \
                 tool_call_id, tool_name, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(conversation_id.to_string())
            .bind(draft.role.as_str())
            .bind(&draft.content)
            .bind(&tool_calls_column)
            .bind(&draft.tool_call_id)
            .bind(&draft.tool_name)
            .bind(ts)
            .execute(&mut *tx)
            .await?;

            appended.push(StoredMessage {
                id,
                conversation_id,
                role: draft.role,
                content: draft.content.clone(),
                tool_calls: draft.tool_calls.clone(),
                tool_call_id: draft.tool_call_id.clone(),
                tool_name: draft.tool_name.clone(),
                created_at: ts,
            });
            ts += Duration::milliseconds(1);
        }

        tx.commit().await?;
        Ok(appended)
    }

    /// Read the `limit` most recent messages, re-sorted into ascending
    /// chronological order, from one snapshot.
    pub async fn read_history(
        &self,
        conversation_id: Uuid,
        owner: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut tx = self.pool.begin().await?;

        let owned: Option<String> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = ? AND owner = ?")
                .bind(conversation_id.to_string())
                .bind(owner)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(StoreError::ConversationNotFound);
        }

        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "{SELECT_MESSAGE} WHERE conversation_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(conversation_id.to_string())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut messages: Vec<StoredMessage> = rows
            .into_iter()
            .map(StoredMessage::try_from)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use td_domain::message::ToolCall;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn create_and_get_are_owner_scoped() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .conversations()
            .create("u1", Some("groceries"))
            .await
            .unwrap();

        let mine = store.conversations().get(conv.id, "u1").await.unwrap();
        assert_eq!(mine.unwrap().title.as_deref(), Some("groceries"));

        let foreign = store.conversations().get(conv.id, "u2").await.unwrap();
        assert!(foreign.is_none());
    }

    #[tokio::test]
    async fn append_preserves_draft_order() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        let drafts = vec![
            MessageDraft::user("Add a task to buy milk"),
            MessageDraft::assistant_with_calls("", vec![call("call_1", "add_task")]),
            MessageDraft::tool("call_1", "add_task", "{\"success\":true}"),
            MessageDraft::assistant("Added \"Buy milk\"."),
        ];
        store
            .conversations()
            .append_messages(conv.id, "u1", &drafts)
            .await
            .unwrap();

        let history = store
            .conversations()
            .read_history(conv.id, "u1", 100)
            .await
            .unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].tool_calls[0].call_id, "call_1");
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(history[3].content, "Added \"Buy milk\".");

        // created_at is strictly increasing even within one append.
        for pair in history.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn append_advances_conversation_updated_at() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        store
            .conversations()
            .append_messages(conv.id, "u1", &[MessageDraft::user("hi")])
            .await
            .unwrap();

        let after = store
            .conversations()
            .get(conv.id, "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(after.updated_at >= conv.updated_at);
    }

    #[tokio::test]
    async fn append_to_foreign_conversation_writes_nothing() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        let result = store
            .conversations()
            .append_messages(conv.id, "u2", &[MessageDraft::user("intrusion")])
            .await;
        assert!(matches!(result, Err(StoreError::ConversationNotFound)));

        let history = store
            .conversations()
            .read_history(conv.id, "u1", 100)
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn read_history_window_keeps_most_recent_ascending() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        for i in 0..6 {
            store
                .conversations()
                .append_messages(conv.id, "u1", &[MessageDraft::user(format!("msg {i}"))])
                .await
                .unwrap();
        }

        let window = store
            .conversations()
            .read_history(conv.id, "u1", 3)
            .await
            .unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["msg 3", "msg 4", "msg 5"]);
    }

    #[tokio::test]
    async fn read_history_for_foreign_owner_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        let result = store.conversations().read_history(conv.id, "u2", 100).await;
        assert!(matches!(result, Err(StoreError::ConversationNotFound)));
    }

    #[tokio::test]
    async fn tool_calls_survive_the_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let conv = store.conversations().create("u1", None).await.unwrap();

        let calls = vec![ToolCall {
            call_id: "call_x".into(),
            tool_name: "update_task".into(),
            arguments: serde_json::json!({ "task_id": 7, "title": "renamed" }),
        }];
        store
            .conversations()
            .append_messages(
                conv.id,
                "u1",
                &[MessageDraft::assistant_with_calls("working on it", calls.clone())],
            )
            .await
            .unwrap();

        let history = store
            .conversations()
            .read_history(conv.id, "u1", 10)
            .await
            .unwrap();
        assert_eq!(history[0].tool_calls, calls);
        assert_eq!(history[0].content, "working on it");
    }

    #[tokio::test]
    async fn listing_orders_by_recent_activity() {
        let store = Store::in_memory().await.unwrap();
        let first = store.conversations().create("u1", Some("a")).await.unwrap();
        let second = store.conversations().create("u1", Some("b")).await.unwrap();
        store.conversations().create("u2", Some("c")).await.unwrap();

        // Touch the older conversation; it should rise to the top.
        store
            .conversations()
            .append_messages(first.id, "u1", &[MessageDraft::user("ping")])
            .await
            .unwrap();

        let listed = store.conversations().list("u1", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }
}
