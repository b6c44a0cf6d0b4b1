//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract with tool
//! calling.

use serde::Deserialize;
use serde_json::Value;

use td_domain::config::LlmConfig;
use td_domain::error::{Error, Result};
use td_domain::message::{Role, ToolCall, ToolDefinition, WireMessage};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider, Usage};

const PROVIDER_ID: &str = "openai_compat";

/// Characters of an upstream error body kept in our error message.
const ERROR_SNIPPET_CHARS: usize = 2000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new provider from config plus the resolved API key.
    ///
    /// The key is read from the env var named in config once at startup;
    /// it never travels through config files.
    pub fn from_config(cfg: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: PROVIDER_ID.into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            client,
        })
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_openai(msg: &WireMessage) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content,
        }),
        Role::Assistant => assistant_to_openai(msg),
        _ => serde_json::json!({
            "role": msg.role.as_str(),
            "content": msg.content,
        }),
    }
}

fn assistant_to_openai(msg: &WireMessage) -> Value {
    let mut obj = serde_json::json!({ "role": "assistant" });

    // The wire format wants null content on a pure tool-call message.
    if msg.content.is_empty() && !msg.tool_calls.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(msg.content.clone());
    }

    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.tool_name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// The slice of the chat-completions response this service consumes, as
// typed serde structs. Fields the contract marks optional (null content on
// tool-call turns, absent usage on some proxies) default rather than fail;
// anything else undecodable is a protocol error from this provider.

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::Provider {
        provider: PROVIDER_ID.into(),
        message: message.into(),
    }
}

/// Decode a successful chat-completions body into [`ChatResponse`].
fn decode_chat_response(raw: &str) -> Result<ChatResponse> {
    let api: ApiResponse = serde_json::from_str(raw)
        .map_err(|e| protocol_error(format!("undecodable response body: {e}")))?;

    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| protocol_error("response carried no choices"))?;

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(into_tool_call)
            .collect(),
        usage: api.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        model: api.model.unwrap_or_else(|| "unknown".into()),
        finish_reason: choice.finish_reason,
    })
}

/// Arguments travel as a JSON string inside the function object. A model
/// that emits broken JSON still gets its call dispatched — with empty
/// arguments, which the tool registry answers with a validation envelope
/// the model can react to on the next hop.
fn into_tool_call(tc: ApiToolCall) -> ToolCall {
    let arguments = match tc.function.arguments.as_deref() {
        None => Value::Object(Default::default()),
        Some(raw) if raw.trim().is_empty() => Value::Object(Default::default()),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(
                call_id = %tc.id,
                tool = %tc.function.name,
                error = %e,
                "tool call arguments are not valid JSON; defaulting to empty object"
            );
            Value::Object(Default::default())
        }),
    };
    ToolCall {
        call_id: tc.id,
        tool_name: tc.function.name,
        arguments,
    }
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(ERROR_SNIPPET_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        tracing::debug!(
            provider = %self.id,
            url = %url,
            model = %self.effective_model(req),
            "chat request"
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_chat_body(req))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(protocol_error(format!(
                "HTTP {}: {}",
                status.as_u16(),
                snippet(&body)
            )));
        }

        decode_chat_response(&body)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_with_message(message: Value) -> String {
        serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{ "message": message, "finish_reason": "tool_calls" }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19 }
        })
        .to_string()
    }

    #[test]
    fn decodes_tool_calls_in_order() {
        let body = body_with_message(serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                { "id": "call_a", "type": "function",
                  "function": { "name": "list_tasks", "arguments": "{}" } },
                { "id": "call_b", "type": "function",
                  "function": { "name": "delete_task", "arguments": "{\"task_id\": 3}" } }
            ]
        }));

        let parsed = decode_chat_response(&body).unwrap();
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_eq!(parsed.tool_calls[0].call_id, "call_a");
        assert_eq!(parsed.tool_calls[1].tool_name, "delete_task");
        assert_eq!(
            parsed.tool_calls[1].arguments,
            serde_json::json!({ "task_id": 3 })
        );
        assert_eq!(parsed.usage.unwrap().total_tokens, 19);
    }

    #[test]
    fn malformed_arguments_degrade_to_empty_object() {
        let body = body_with_message(serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                { "id": "call_a", "type": "function",
                  "function": { "name": "add_task", "arguments": "{not json" } }
            ]
        }));

        let parsed = decode_chat_response(&body).unwrap();
        assert_eq!(parsed.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn absent_arguments_become_an_empty_object() {
        let body = body_with_message(serde_json::json!({
            "role": "assistant",
            "tool_calls": [
                { "id": "call_a", "type": "function",
                  "function": { "name": "list_tasks" } }
            ]
        }));

        let parsed = decode_chat_response(&body).unwrap();
        assert_eq!(parsed.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn missing_choices_is_a_provider_error() {
        let err = decode_chat_response(r#"{ "model": "x" }"#).unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[test]
    fn non_json_body_is_a_provider_error() {
        let err = decode_chat_response("<html>upstream proxy error</html>").unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[test]
    fn plain_text_reply_decodes_without_usage() {
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "hi" },
                          "finish_reason": "stop" }]
        })
        .to_string();

        let parsed = decode_chat_response(&body).unwrap();
        assert_eq!(parsed.content, "hi");
        assert!(parsed.tool_calls.is_empty());
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.model, "unknown");
    }

    #[test]
    fn assistant_with_calls_serializes_null_content() {
        let msg = WireMessage::assistant_with_calls(
            "",
            vec![ToolCall {
                call_id: "call_1".into(),
                tool_name: "add_task".into(),
                arguments: serde_json::json!({ "title": "Buy milk" }),
            }],
        );
        let v = msg_to_openai(&msg);
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["id"], "call_1");
        // Arguments go over the wire as a JSON string, not an object.
        assert!(v["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = WireMessage::tool_result("call_9", "{\"success\":true}");
        let v = msg_to_openai(&msg);
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_9");
    }
}
