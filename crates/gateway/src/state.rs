use std::sync::Arc;

use td_domain::config::Config;
use td_providers::LlmProvider;
use td_store::Store;

use crate::api::auth::TokenKey;

/// Shared application state passed to all API handlers.
///
/// Deliberately thin: the database is the only memory between requests, so
/// a process restart mid-conversation changes nothing. No caches, no
/// sessions, no module-level singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub llm: Arc<dyn LlmProvider>,
    /// HMAC key for bearer-token validation (read once at startup).
    pub token_key: Arc<TokenKey>,
}
