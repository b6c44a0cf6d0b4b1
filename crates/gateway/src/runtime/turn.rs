//! Turn execution loop — one chat request end to end: build wire messages,
//! call the LLM, dispatch tool calls in emitted order, loop until the model
//! stops or the hop budget runs out.
//!
//! A fresh [`TurnRunner`] is built per HTTP request and holds nothing but
//! borrowed handles; every fact about the conversation comes from the
//! history passed in, so a process restart between turns cannot change an
//! outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use td_domain::config::LlmConfig;
use td_domain::error::Error;
use td_domain::message::{MessageDraft, StoredMessage, WireMessage};
use td_providers::{ChatRequest, ChatResponse, LlmProvider, Usage};
use td_store::Store;

use super::{history, prompt, tools};

/// What the runner says when the model keeps calling tools past the budget.
const HOP_BUDGET_APOLOGY: &str = "I'm sorry — this request needed more steps than I'm \
     allowed to take in one turn. Nothing beyond the actions I already reported was done. \
     Could you break it into smaller requests?";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs and outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to a single turn.
pub struct TurnInput {
    pub user_id: String,
    pub user_text: String,
    /// Prior messages, ascending, as read from the store.
    pub history: Vec<StoredMessage>,
}

/// One tool invocation as surfaced to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ToolActivity {
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    pub success: bool,
}

/// Result of a completed turn.
///
/// `drafts` holds the intermediate messages only (assistant-with-calls and
/// tool responses, in emitted order); the final assistant text travels
/// separately so the orchestrator appends it without tool_calls attached.
pub struct TurnOutcome {
    pub final_text: String,
    pub drafts: Vec<MessageDraft>,
    pub tool_activity: Vec<ToolActivity>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    /// The deadline expired before the model stopped. `drafts` still holds
    /// only complete assistant/tool pairs.
    pub timed_out: bool,
}

/// A turn that failed mid-flight. The drafts produced so far are complete
/// pairs and must still be persisted so the next turn replays cleanly.
pub struct TurnError {
    pub source: Error,
    pub drafts: Vec<MessageDraft>,
    pub tool_activity: Vec<ToolActivity>,
    pub usage: Usage,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnRunner {
    store: Store,
    llm: Arc<dyn LlmProvider>,
    config: LlmConfig,
}

enum ChatAttempt {
    Response(ChatResponse),
    DeadlineExpired,
}

impl TurnRunner {
    pub fn new(store: Store, llm: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self { store, llm, config }
    }

    /// Run one turn to completion or to the deadline.
    pub async fn run(&self, input: &TurnInput, deadline: Instant) -> Result<TurnOutcome, TurnError> {
        let tool_defs = tools::catalog();

        let mut wire = Vec::with_capacity(input.history.len() + 2);
        wire.push(WireMessage::system(prompt::SYSTEM_PROMPT));
        wire.extend(history::to_wire(&input.history));
        wire.push(WireMessage::user(&input.user_text));

        let mut drafts: Vec<MessageDraft> = Vec::new();
        let mut tool_activity: Vec<ToolActivity> = Vec::new();
        let mut usage = Usage::default();

        for hop in 0..self.config.max_tool_hops {
            tracing::debug!(hop, "turn loop iteration");

            let req = ChatRequest {
                messages: wire.clone(),
                tools: tool_defs.clone(),
                temperature: Some(self.config.temperature),
                max_tokens: Some(self.config.max_tokens),
                model: None,
            };

            let resp = match self.chat_with_retry(&req, deadline).await {
                Ok(ChatAttempt::Response(resp)) => resp,
                Ok(ChatAttempt::DeadlineExpired) => {
                    tracing::warn!(hop, "turn deadline expired mid-call");
                    return Ok(TurnOutcome {
                        final_text: String::new(),
                        drafts,
                        tool_activity,
                        usage,
                        finish_reason: None,
                        timed_out: true,
                    });
                }
                Err(source) => {
                    return Err(TurnError {
                        source,
                        drafts,
                        tool_activity,
                        usage,
                    });
                }
            };

            if let Some(u) = &resp.usage {
                usage.accumulate(u);
            }

            // No tool calls: the model is done talking.
            if resp.tool_calls.is_empty() {
                return Ok(TurnOutcome {
                    final_text: resp.content,
                    drafts,
                    tool_activity,
                    usage,
                    finish_reason: resp.finish_reason,
                    timed_out: false,
                });
            }

            let calls = resp.tool_calls;
            drafts.push(MessageDraft::assistant_with_calls(
                &resp.content,
                calls.clone(),
            ));
            wire.push(WireMessage::assistant_with_calls(
                &resp.content,
                calls.clone(),
            ));

            // Execute in emitted order, one at a time. A failed tool
            // produces an error envelope; the rest of the batch still runs
            // so the model can react to partial failure on the next hop.
            for tc in &calls {
                let envelope =
                    tools::invoke(&self.store, &tc.tool_name, &tc.arguments, &input.user_id).await;
                let success = envelope
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let content = envelope.to_string();

                tracing::debug!(
                    tool = %tc.tool_name,
                    call_id = %tc.call_id,
                    success,
                    "tool dispatched"
                );

                tool_activity.push(ToolActivity {
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                    result: envelope,
                    success,
                });
                drafts.push(MessageDraft::tool(&tc.call_id, &tc.tool_name, &content));
                wire.push(WireMessage::tool_result(&tc.call_id, &content));
            }
        }

        tracing::warn!(
            max_tool_hops = self.config.max_tool_hops,
            "hop budget exhausted, answering with apology"
        );
        Ok(TurnOutcome {
            final_text: HOP_BUDGET_APOLOGY.to_string(),
            drafts,
            tool_activity,
            usage,
            finish_reason: Some("tool_hops_exhausted".into()),
            timed_out: false,
        })
    }

    /// One LLM call with bounded retries and full-jitter backoff. Only
    /// transport failures retry; provider-reported HTTP errors do not.
    async fn chat_with_retry(
        &self,
        req: &ChatRequest,
        deadline: Instant,
    ) -> Result<ChatAttempt, Error> {
        let mut attempt: u32 = 0;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(ChatAttempt::DeadlineExpired);
            };

            match tokio::time::timeout(remaining, self.llm.chat(req)).await {
                Err(_elapsed) => return Ok(ChatAttempt::DeadlineExpired),
                Ok(Ok(resp)) => return Ok(ChatAttempt::Response(resp)),
                Ok(Err(Error::Http(msg))) if attempt < self.config.max_retries => {
                    let backoff = self.jittered_backoff(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %msg,
                        "LLM transport error, retrying"
                    );
                    tokio::time::sleep(backoff.min(remaining)).await;
                    attempt += 1;
                }
                Ok(Err(Error::Http(msg))) => {
                    return Err(Error::Transport(format!(
                        "LLM unreachable after {} attempt(s): {msg}",
                        attempt + 1
                    )));
                }
                Ok(Err(Error::Provider { provider, message })) => {
                    return Err(Error::Transport(format!("{provider}: {message}")));
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Full jitter: uniform in `[0, base * 2^attempt]`.
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let cap = self
            .config
            .retry_backoff_ms
            .saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use td_domain::message::{Role, ToolCall};

    /// A provider that replays a fixed script of responses.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Step>>,
    }

    enum Step {
        Reply(ChatResponse),
        TransportFail(String),
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: &ChatRequest) -> td_domain::Result<ChatResponse> {
            match self.script.lock().unwrap().pop_front() {
                Some(Step::Reply(resp)) => Ok(resp),
                Some(Step::TransportFail(msg)) => Err(Error::Http(msg)),
                None => panic!("scripted provider exhausted"),
            }
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn reply_with_calls(calls: Vec<ToolCall>) -> Step {
        Step::Reply(ChatResponse {
            content: String::new(),
            tool_calls: calls,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "scripted".into(),
            finish_reason: Some("tool_calls".into()),
        })
    }

    fn reply_text(text: &str) -> Step {
        Step::Reply(ChatResponse {
            content: text.into(),
            tool_calls: Vec::new(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    fn runner(llm: Arc<dyn LlmProvider>, store: Store, hops: u32, retries: u32) -> TurnRunner {
        let config = LlmConfig {
            max_tool_hops: hops,
            max_retries: retries,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        TurnRunner::new(store, llm, config)
    }

    fn input(text: &str) -> TurnInput {
        TurnInput {
            user_id: "u1".into(),
            user_text: text.into(),
            history: Vec::new(),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn single_tool_turn_produces_one_pair_and_final_text() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![
            reply_with_calls(vec![call(
                "c1",
                "add_task",
                serde_json::json!({ "title": "Buy milk" }),
            )]),
            reply_text("Added \"Buy milk\" as task 1."),
        ]);

        let outcome = runner(llm, store.clone(), 8, 0)
            .run(&input("Add a task to buy milk"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert_eq!(outcome.final_text, "Added \"Buy milk\" as task 1.");
        assert!(!outcome.timed_out);
        assert_eq!(outcome.drafts.len(), 2);
        assert_eq!(outcome.drafts[0].role, Role::Assistant);
        assert_eq!(outcome.drafts[0].tool_calls[0].call_id, "c1");
        assert_eq!(outcome.drafts[1].role, Role::Tool);
        assert_eq!(outcome.drafts[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(outcome.tool_activity.len(), 1);
        assert!(outcome.tool_activity[0].success);
        assert_eq!(outcome.usage.total_tokens, 30);

        // The task really exists, owned by the caller.
        let page = store
            .tasks()
            .list("u1", &td_store::TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].title, "Buy milk");
    }

    #[tokio::test]
    async fn multi_hop_chain_runs_tools_in_order() {
        let store = Store::in_memory().await.unwrap();
        store.tasks().create("u1", "first", None).await.unwrap();

        let llm = ScriptedProvider::new(vec![
            reply_with_calls(vec![call("c1", "list_tasks", serde_json::json!({}))]),
            reply_with_calls(vec![call(
                "c2",
                "delete_task",
                serde_json::json!({ "task_id": 1 }),
            )]),
            reply_text("Deleted the first task."),
        ]);

        let outcome = runner(llm, store.clone(), 8, 0)
            .run(&input("List tasks and delete the first one"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert_eq!(outcome.tool_activity.len(), 2);
        assert_eq!(outcome.tool_activity[0].tool_name, "list_tasks");
        assert_eq!(outcome.tool_activity[1].tool_name, "delete_task");
        assert!(outcome.tool_activity.iter().all(|a| a.success));
        // Two pairs: assistant+tool, assistant+tool.
        assert_eq!(outcome.drafts.len(), 4);
        assert!(super::super::history::validate_drafts(&outcome.drafts).is_ok());

        let page = store
            .tasks()
            .list("u1", &td_store::TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn failed_tool_does_not_abort_the_turn() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![
            reply_with_calls(vec![call(
                "c1",
                "delete_task",
                serde_json::json!({ "task_id": 999_999 }),
            )]),
            reply_text("That task doesn't exist. Want me to list your tasks?"),
        ]);

        let outcome = runner(llm, store, 8, 0)
            .run(&input("Delete task 999999"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert_eq!(outcome.tool_activity.len(), 1);
        assert!(!outcome.tool_activity[0].success);
        assert_eq!(outcome.tool_activity[0].result["error"], "TASK_NOT_FOUND");
        // The tool response still landed as a draft, keeping the pair whole.
        assert_eq!(outcome.drafts.len(), 2);
        assert!(outcome.final_text.contains("doesn't exist"));
    }

    #[tokio::test]
    async fn partial_batch_failure_still_runs_the_rest() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![
            reply_with_calls(vec![
                call("c1", "delete_task", serde_json::json!({ "task_id": 42 })),
                call("c2", "add_task", serde_json::json!({ "title": "still added" })),
            ]),
            reply_text("One failed, one worked."),
        ]);

        let outcome = runner(llm, store.clone(), 8, 0)
            .run(&input("delete 42 and add a task"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert!(!outcome.tool_activity[0].success);
        assert!(outcome.tool_activity[1].success);

        let page = store
            .tasks()
            .list("u1", &td_store::TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn hop_budget_exhaustion_yields_apology_and_complete_pairs() {
        let store = Store::in_memory().await.unwrap();
        let hops = 3;
        let steps: Vec<Step> = (0..hops)
            .map(|i| {
                reply_with_calls(vec![call(
                    &format!("c{i}"),
                    "list_tasks",
                    serde_json::json!({}),
                )])
            })
            .collect();
        let llm = ScriptedProvider::new(steps);

        let outcome = runner(llm, store, hops, 0)
            .run(&input("loop forever"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert_eq!(outcome.finish_reason.as_deref(), Some("tool_hops_exhausted"));
        assert!(outcome.final_text.contains("sorry"));
        // One pair per hop, every pair complete.
        assert_eq!(outcome.drafts.len(), hops as usize * 2);
        assert!(super::super::history::validate_drafts(&outcome.drafts).is_ok());
        assert_eq!(outcome.tool_activity.len(), hops as usize);
    }

    #[tokio::test]
    async fn transport_failure_retries_then_succeeds() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![
            Step::TransportFail("connection reset".into()),
            reply_text("fine now"),
        ]);

        let outcome = runner(llm, store, 8, 2)
            .run(&input("hello"), far_deadline())
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));
        assert_eq!(outcome.final_text, "fine now");
    }

    #[tokio::test]
    async fn transport_failure_exhausts_retries_into_turn_error() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![
            reply_with_calls(vec![call(
                "c1",
                "add_task",
                serde_json::json!({ "title": "kept" }),
            )]),
            Step::TransportFail("down".into()),
            Step::TransportFail("still down".into()),
        ]);

        let err = runner(llm, store, 8, 1)
            .run(&input("add then crash"), far_deadline())
            .await
            .err()
            .expect("turn should fail");

        assert!(matches!(err.source, Error::Transport(_)));
        // The completed first pair is preserved for persistence.
        assert_eq!(err.drafts.len(), 2);
        assert!(super::super::history::validate_drafts(&err.drafts).is_ok());
        assert_eq!(err.tool_activity.len(), 1);
    }

    #[tokio::test]
    async fn expired_deadline_times_out_with_complete_pairs_only() {
        let store = Store::in_memory().await.unwrap();
        let llm = ScriptedProvider::new(vec![reply_text("never reached")]);

        let outcome = runner(llm, store, 8, 0)
            .run(&input("hello"), Instant::now() - Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("turn failed: {}", e.source));

        assert!(outcome.timed_out);
        assert!(outcome.drafts.is_empty());
        assert!(outcome.final_text.is_empty());
    }
}
