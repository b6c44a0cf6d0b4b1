use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_8080")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Deadline for one chat turn, LLM hops included. On expiry the turn
    /// is aborted, complete pairs are persisted, and 504 is returned.
    #[serde(default = "d_120")]
    pub request_timeout_secs: u64,
    /// Raw request bodies above this size are rejected with 413 before
    /// any parsing.
    #[serde(default = "d_65536")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".into(),
            cors_origins: d_cors_origins(),
            request_timeout_secs: 120,
            max_body_bytes: 65_536,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    /// Environment variable holding the API key. Read once at startup.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_1024")]
    pub max_tokens: u32,
    /// Tool-call hops allowed within one turn before the runner gives up
    /// and answers with a synthetic apology.
    #[serde(default = "d_8")]
    pub max_tool_hops: u32,
    /// Transport retries per LLM call (provider 4xx is not retried).
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Base backoff between retries; grows exponentially with full jitter.
    #[serde(default = "d_250")]
    pub retry_backoff_ms: u64,
    #[serde(default = "d_60000")]
    pub http_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_api_key_env(),
            model: d_model(),
            temperature: 0.2,
            max_tokens: 1024,
            max_tool_hops: 8,
            max_retries: 2,
            retry_backoff_ms: 250,
            http_timeout_ms: 60_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx connection string, e.g. `sqlite://taskdeck.db?mode=rwc`.
    #[serde(default = "d_db_url")]
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: d_db_url(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Most recent messages replayed to the LLM per turn.
    #[serde(default = "d_100")]
    pub history_window: u32,
    /// Maximum user message length in characters.
    #[serde(default = "d_4000")]
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: 100,
            max_message_chars: 4_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the token signing secret, shared with
    /// the external login service that issues the bearer tokens.
    #[serde(default = "d_secret_env")]
    pub token_secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret_env: d_secret_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://")
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "llm.base_url".into(),
                message: format!(
                    "base_url must start with http:// or https:// (got \"{}\")",
                    self.llm.base_url
                ),
            });
        }

        if self.llm.model.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "llm.model".into(),
                message: "model must not be empty".into(),
            });
        }

        if self.llm.max_tool_hops == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "llm.max_tool_hops".into(),
                message: "at least one tool hop is required to answer".into(),
            });
        }

        if self.store.database_url.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "store.database_url".into(),
                message: "database_url must not be empty".into(),
            });
        }

        if self.server.max_body_bytes == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.max_body_bytes".into(),
                message: "a zero body limit rejects every request".into(),
            });
        }

        if self.server.max_body_bytes < self.chat.max_message_chars {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.max_body_bytes".into(),
                message: format!(
                    "body limit {} is below chat.max_message_chars {}; maximum-length \
                     messages can never arrive",
                    self.server.max_body_bytes, self.chat.max_message_chars
                ),
            });
        }

        if self.chat.history_window == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "chat.history_window".into(),
                message: "history_window must be greater than 0".into(),
            });
        }

        if self.chat.history_window > 500 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "chat.history_window".into(),
                message: "windows above 500 messages inflate prompt cost sharply".into(),
            });
        }

        if self.server.cors_origins.len() == 1 && self.server.cors_origins[0] == "*" {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_8080() -> u16 {
    8080
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_120() -> u64 {
    120
}
fn d_65536() -> usize {
    65_536
}
fn d_llm_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "TASKDECK_LLM_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_temperature() -> f32 {
    0.2
}
fn d_1024() -> u32 {
    1024
}
fn d_8() -> u32 {
    8
}
fn d_2() -> u32 {
    2
}
fn d_250() -> u64 {
    250
}
fn d_60000() -> u64 {
    60_000
}
fn d_db_url() -> String {
    "sqlite://taskdeck.db?mode=rwc".into()
}
fn d_100() -> u32 {
    100
}
fn d_4000() -> usize {
    4_000
}
fn d_secret_env() -> String {
    "TASKDECK_TOKEN_SECRET".into()
}
