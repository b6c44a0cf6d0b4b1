//! Tool registry — the catalog advertised to the LLM and the single
//! dispatch point for tool calls.
//!
//! `invoke` never fails across its boundary: every outcome, including
//! unknown tools and malformed arguments, becomes a JSON envelope
//! `{"success": true, ...}` or `{"success": false, "error": CODE,
//! "message": ...}` so the loop always has a tool response to persist.
//!
//! The caller's user id is injected here and nowhere else. Owner-like
//! fields in model-supplied arguments are discarded before validation.

use serde::Deserialize;
use serde_json::{json, Value};

use td_domain::message::ToolDefinition;
use td_store::{Store, StoreError, TaskFilter};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error codes (closed set)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const TOOL_UNKNOWN: &str = "TOOL_UNKNOWN";
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const TASK_NOT_FOUND: &str = "TASK_NOT_FOUND";
pub const USER_NOT_FOUND: &str = "USER_NOT_FOUND";
pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Fields the model must never control. Stripped from arguments before
/// validation so a prompt-injected "owner" cannot cross user boundaries.
const RESERVED_ARG_KEYS: &[&str] = &["owner", "owner_id", "user", "user_id"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the set of tool definitions exposed to the LLM.
pub fn catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "add_task".into(),
            description: "Create a new task for the user. Use when the user asks to add, \
                          remember, or track something."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {
                        "type": "string",
                        "description": "Short task title, 1-255 characters",
                        "minLength": 1,
                        "maxLength": 255
                    },
                    "description": {
                        "type": "string",
                        "description": "Optional longer details, up to 2000 characters",
                        "maxLength": 2000
                    }
                },
                "required": ["title"]
            }),
        },
        ToolDefinition {
            name: "list_tasks".into(),
            description: "List the user's tasks. Use to look tasks up, to resolve which task \
                          the user means, or when asked what is on the list."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "completed": {
                        "type": "boolean",
                        "description": "Only tasks with this completion state"
                    },
                    "search": {
                        "type": "string",
                        "description": "Case-insensitive substring match on the title"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Page size, 1-100 (default 50)",
                        "minimum": 1,
                        "maximum": 100
                    },
                    "offset": {
                        "type": "integer",
                        "description": "Number of tasks to skip",
                        "minimum": 0
                    }
                }
            }),
        },
        ToolDefinition {
            name: "update_task".into(),
            description: "Change the title and/or description of an existing task. Requires \
                          the task id from a previous list_tasks or add_task result."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "integer",
                        "description": "Id of the task to update"
                    },
                    "title": {
                        "type": "string",
                        "description": "New title, 1-255 characters",
                        "minLength": 1,
                        "maxLength": 255
                    },
                    "description": {
                        "type": "string",
                        "description": "New description, up to 2000 characters",
                        "maxLength": 2000
                    }
                },
                "required": ["task_id"]
            }),
        },
        ToolDefinition {
            name: "complete_task".into(),
            description: "Mark a task as done, or as not done when completed=false."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "integer",
                        "description": "Id of the task"
                    },
                    "completed": {
                        "type": "boolean",
                        "description": "Target completion state (default true)"
                    }
                },
                "required": ["task_id"]
            }),
        },
        ToolDefinition {
            name: "delete_task".into(),
            description: "Permanently delete a task. Requires the task id; never guess it."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "integer",
                        "description": "Id of the task to delete"
                    }
                },
                "required": ["task_id"]
            }),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed arguments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddTaskArgs {
    title: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListTasksArgs {
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateTaskArgs {
    task_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompleteTaskArgs {
    task_id: i64,
    #[serde(default)]
    completed: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeleteTaskArgs {
    task_id: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Invoke a tool on behalf of `caller`. Always returns an envelope.
pub async fn invoke(store: &Store, name: &str, arguments: &Value, caller: &str) -> Value {
    if caller.is_empty() {
        return error_envelope(USER_NOT_FOUND, "no authenticated user for this call");
    }

    let args = strip_reserved_keys(arguments);

    match name {
        "add_task" => invoke_add_task(store, &args, caller).await,
        "list_tasks" => invoke_list_tasks(store, &args, caller).await,
        "update_task" => invoke_update_task(store, &args, caller).await,
        "complete_task" => invoke_complete_task(store, &args, caller).await,
        "delete_task" => invoke_delete_task(store, &args, caller).await,
        other => error_envelope(TOOL_UNKNOWN, format!("no tool named '{other}'")),
    }
}

async fn invoke_add_task(store: &Store, args: &Value, caller: &str) -> Value {
    let args: AddTaskArgs = match parse_args(args) {
        Ok(a) => a,
        Err(envelope) => return envelope,
    };
    match store
        .tasks()
        .create(caller, &args.title, args.description.as_deref())
        .await
    {
        Ok(task) => json!({ "success": true, "task": task }),
        Err(e) => store_error_envelope(e),
    }
}

async fn invoke_list_tasks(store: &Store, args: &Value, caller: &str) -> Value {
    let args: ListTasksArgs = match parse_args(args) {
        Ok(a) => a,
        Err(envelope) => return envelope,
    };
    let filter = TaskFilter {
        completed: args.completed,
        search: args.search,
        limit: args.limit,
        offset: args.offset,
    };
    match store.tasks().list(caller, &filter).await {
        Ok(page) => json!({
            "success": true,
            "tasks": page.tasks,
            "total": page.total,
        }),
        Err(e) => store_error_envelope(e),
    }
}

async fn invoke_update_task(store: &Store, args: &Value, caller: &str) -> Value {
    let args: UpdateTaskArgs = match parse_args(args) {
        Ok(a) => a,
        Err(envelope) => return envelope,
    };
    match store
        .tasks()
        .update(
            caller,
            args.task_id,
            args.title.as_deref(),
            args.description.as_deref(),
        )
        .await
    {
        Ok(task) => json!({ "success": true, "task": task }),
        Err(e) => store_error_envelope(e),
    }
}

async fn invoke_complete_task(store: &Store, args: &Value, caller: &str) -> Value {
    let args: CompleteTaskArgs = match parse_args(args) {
        Ok(a) => a,
        Err(envelope) => return envelope,
    };
    let completed = args.completed.unwrap_or(true);
    match store
        .tasks()
        .set_completed(caller, args.task_id, completed)
        .await
    {
        Ok(task) => json!({ "success": true, "task": task }),
        Err(e) => store_error_envelope(e),
    }
}

async fn invoke_delete_task(store: &Store, args: &Value, caller: &str) -> Value {
    let args: DeleteTaskArgs = match parse_args(args) {
        Ok(a) => a,
        Err(envelope) => return envelope,
    };
    match store.tasks().delete(caller, args.task_id).await {
        Ok(deleted) => json!({ "success": true, "deleted": deleted }),
        Err(e) => store_error_envelope(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove owner-like keys the model has no business supplying.
fn strip_reserved_keys(arguments: &Value) -> Value {
    let mut args = arguments.clone();
    if let Some(obj) = args.as_object_mut() {
        for key in RESERVED_ARG_KEYS {
            if obj.remove(*key).is_some() {
                tracing::warn!(key, "discarded reserved key from tool arguments");
            }
        }
    }
    args
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, Value> {
    if !args.is_object() {
        return Err(error_envelope(
            VALIDATION_ERROR,
            "arguments must be a JSON object",
        ));
    }
    serde_json::from_value(args.clone())
        .map_err(|e| error_envelope(VALIDATION_ERROR, e.to_string()))
}

fn store_error_envelope(e: StoreError) -> Value {
    match e {
        StoreError::TaskNotFound => {
            error_envelope(TASK_NOT_FOUND, "no such task for this user")
        }
        StoreError::ConversationNotFound => {
            // Tools never touch conversations; reaching this is a bug.
            error_envelope(INTERNAL_ERROR, "unexpected conversation lookup in tool")
        }
        StoreError::Validation(msg) => error_envelope(VALIDATION_ERROR, msg),
        StoreError::Sqlx(e) => {
            tracing::error!(error = %e, "database failure inside tool call");
            error_envelope(DATABASE_ERROR, "the task store is unavailable right now")
        }
        StoreError::Migrate(e) => {
            tracing::error!(error = %e, "migration failure inside tool call");
            error_envelope(DATABASE_ERROR, "the task store is unavailable right now")
        }
        StoreError::Corrupt(msg) => {
            tracing::error!(error = %msg, "corrupt row inside tool call");
            error_envelope(INTERNAL_ERROR, "an internal error occurred")
        }
    }
}

fn error_envelope(code: &str, message: impl Into<String>) -> Value {
    json!({
        "success": false,
        "error": code,
        "message": message.into(),
    })
}
