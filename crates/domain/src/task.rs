use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds enforced on task fields at the store boundary.
pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

/// A task owned by exactly one user. Every store operation filters by
/// owner, so a task is invisible outside its owner's requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
