//! Chat API — the one endpoint that runs agent turns, plus read-only
//! conversation views for the chat UI.
//!
//! `POST /chat/{user_id}` is a one-shot request/response: authenticate,
//! resolve the conversation, replay history, run the tool loop, persist
//! the whole turn atomically, answer with the final text and a flattened
//! record of the tool calls.

use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use td_domain::message::{Conversation, MessageDraft};
use td_store::StoreError;

use crate::runtime::{history, TurnInput, TurnRunner};
use crate::state::AppState;

use super::{api_error, auth};

/// Messages fetched for the transcript view.
const TRANSCRIPT_LIMIT: u32 = 1000;
/// Conversations returned to the sidebar.
const CONVERSATION_LIST_LIMIT: u32 = 50;
/// Characters of the first message used as the conversation title.
const TITLE_CHARS: usize = 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    /// User message text.
    pub message: String,
    /// Continue an existing conversation; absent = start a new one.
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat/:user_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    // 1-2. Credential first, then path agreement. The path segment itself
    // is never trusted for anything.
    let caller = match auth::authenticate(&state.token_key, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if caller != user_id {
        return api_error(
            StatusCode::FORBIDDEN,
            "path user does not match the authenticated user",
        );
    }

    // 3. Body validation, before anything touches the store or the LLM.
    let message = body.message.trim();
    if message.is_empty() {
        return api_error(StatusCode::UNPROCESSABLE_ENTITY, "message must not be empty");
    }
    if message.chars().count() > state.config.chat.max_message_chars {
        return api_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "message exceeds {} characters",
                state.config.chat.max_message_chars
            ),
        );
    }

    // 4. Conversation resolution. Unknown and foreign are the same 404.
    let conversation = match resolve_conversation(&state, &caller, body.conversation_id, message)
        .await
    {
        Ok(conv) => conv,
        Err(resp) => return resp,
    };

    // 5. History replay.
    let history = match state
        .store
        .conversations()
        .read_history(conversation.id, &caller, state.config.chat.history_window)
        .await
    {
        Ok(messages) => messages,
        Err(e) => return store_failure(e),
    };

    // 6. Run the turn under the request deadline.
    let runner = TurnRunner::new(
        state.store.clone(),
        state.llm.clone(),
        state.config.llm.clone(),
    );
    let input = TurnInput {
        user_id: caller.clone(),
        user_text: message.to_string(),
        history,
    };
    let deadline = Instant::now() + Duration::from_secs(state.config.server.request_timeout_secs);

    match runner.run(&input, deadline).await {
        Ok(outcome) if outcome.timed_out => {
            // Persist the user message plus every complete pair so the next
            // turn replays a valid history, then report the timeout.
            persist_partial_turn(&state, &conversation, &caller, message, outcome.drafts).await;
            api_error(
                StatusCode::GATEWAY_TIMEOUT,
                "the assistant did not finish in time; completed steps were saved",
            )
        }
        Ok(outcome) => {
            let mut drafts = Vec::with_capacity(outcome.drafts.len() + 2);
            drafts.push(MessageDraft::user(message));
            drafts.extend(outcome.drafts);
            // The final assistant message never repeats tool_calls; those
            // live on the intermediate drafts.
            drafts.push(MessageDraft::assistant(&outcome.final_text));

            if let Err(violation) = history::validate_drafts(&drafts) {
                tracing::error!(%violation, "turn produced an invalid draft sequence");
                // Still record the user message and the complete pairs so
                // the conversation is not poisoned for the next turn.
                drafts.pop();
                drafts.remove(0);
                persist_partial_turn(&state, &conversation, &caller, message, drafts).await;
                return api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error while recording the turn",
                );
            }

            if let Err(e) = state
                .store
                .conversations()
                .append_messages(conversation.id, &caller, &drafts)
                .await
            {
                tracing::error!(error = %e, conversation = %conversation.id, "turn append failed");
                return store_failure(e);
            }

            Json(serde_json::json!({
                "conversation_id": conversation.id,
                "message": outcome.final_text,
                "tool_calls": outcome.tool_activity,
                "usage": {
                    "prompt_tokens": outcome.usage.prompt_tokens,
                    "completion_tokens": outcome.usage.completion_tokens,
                    "total_tokens": outcome.usage.total_tokens,
                },
            }))
            .into_response()
        }
        Err(turn_err) => {
            persist_partial_turn(&state, &conversation, &caller, message, turn_err.drafts).await;
            tracing::error!(error = %turn_err.source, "turn failed");
            match turn_err.source {
                td_domain::Error::Transport(_) => api_error(
                    StatusCode::BAD_GATEWAY,
                    "the language model is unreachable right now; please retry",
                ),
                _ => api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error interrupted the turn",
                ),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /chat/:user_id/conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match auth::authenticate(&state.token_key, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if caller != user_id {
        return api_error(
            StatusCode::FORBIDDEN,
            "path user does not match the authenticated user",
        );
    }

    match state
        .store
        .conversations()
        .list(&caller, CONVERSATION_LIST_LIMIT)
        .await
    {
        Ok(conversations) => Json(serde_json::json!({
            "conversations": conversations,
            "count": conversations.len(),
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /chat/:user_id/conversations/:conversation_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn conversation_transcript(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Response {
    let caller = match auth::authenticate(&state.token_key, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if caller != user_id {
        return api_error(
            StatusCode::FORBIDDEN,
            "path user does not match the authenticated user",
        );
    }

    match state
        .store
        .conversations()
        .read_history(conversation_id, &caller, TRANSCRIPT_LIMIT)
        .await
    {
        Ok(messages) => Json(serde_json::json!({
            "conversation_id": conversation_id,
            "messages": messages,
            "count": messages.len(),
        }))
        .into_response(),
        Err(e) => store_failure(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn resolve_conversation(
    state: &AppState,
    caller: &str,
    conversation_id: Option<Uuid>,
    first_message: &str,
) -> Result<Conversation, Response> {
    match conversation_id {
        Some(id) => match state.store.conversations().get(id, caller).await {
            Ok(Some(conv)) => Ok(conv),
            Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "conversation not found")),
            Err(e) => Err(store_failure(e)),
        },
        None => {
            let title: String = first_message.chars().take(TITLE_CHARS).collect();
            state
                .store
                .conversations()
                .create(caller, Some(&title))
                .await
                .map_err(store_failure)
        }
    }
}

/// Record the user message and whatever complete pairs a failed or
/// timed-out turn produced, so the stored history stays provider-valid.
/// Persistence failures here are logged, not surfaced — the client already
/// gets an error status for the turn itself.
async fn persist_partial_turn(
    state: &AppState,
    conversation: &Conversation,
    caller: &str,
    message: &str,
    intermediate: Vec<MessageDraft>,
) {
    let keep = history::complete_prefix_len(&intermediate);
    if keep < intermediate.len() {
        tracing::warn!(
            dropped = intermediate.len() - keep,
            "discarding trailing incomplete tool-call pair"
        );
    }

    let mut drafts = Vec::with_capacity(keep + 1);
    drafts.push(MessageDraft::user(message));
    drafts.extend(intermediate.into_iter().take(keep));

    if let Err(violation) = history::validate_drafts(&drafts) {
        tracing::error!(%violation, "partial turn still invalid after truncation; keeping user message only");
        drafts.truncate(1);
    }

    if let Err(e) = state
        .store
        .conversations()
        .append_messages(conversation.id, caller, &drafts)
        .await
    {
        tracing::error!(error = %e, conversation = %conversation.id, "failed to persist partial turn");
    }
}

fn store_failure(e: StoreError) -> Response {
    match e {
        StoreError::ConversationNotFound => {
            api_error(StatusCode::NOT_FOUND, "conversation not found")
        }
        StoreError::Validation(msg) => api_error(StatusCode::UNPROCESSABLE_ENTITY, msg),
        other => {
            tracing::error!(error = %other, "store failure");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "the conversation store is unavailable right now",
            )
        }
    }
}
