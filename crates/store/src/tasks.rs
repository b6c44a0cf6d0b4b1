//! Owner-scoped task CRUD.
//!
//! Every query filters by owner, and "not found" never distinguishes an
//! absent id from someone else's task. Each operation runs in its own
//! transaction, acquired and released within the call.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use td_domain::task::{Task, MAX_DESCRIPTION_CHARS, MAX_TITLE_CHARS};

use crate::{Result, StoreError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows and inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    id: i64,
    owner: String,
    title: String,
    description: Option<String>,
    completed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            owner: row.owner,
            title: row.title,
            description: row.description,
            completed: row.completed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Filters for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub completed: Option<bool>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
    /// Page size, 1..=100. `None` = 50.
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One page of tasks plus the total matching count.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
}

/// What remains of a task after deletion, for the confirmation reply.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeletedTask {
    pub id: i64,
    pub title: String,
}

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskStore<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TaskStore<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        owner: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task> {
        let title = validate_title(title)?;
        let description = validate_description(description)?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO tasks (owner, title, description, completed, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(owner)
        .bind(&title)
        .bind(&description)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(Task {
            id: result.last_insert_rowid(),
            owner: owner.to_string(),
            title,
            description,
            completed: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list(&self, owner: &str, filter: &TaskFilter) -> Result<TaskPage> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(StoreError::Validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        let offset = filter.offset.unwrap_or(0);
        let pattern = filter.search.as_deref().map(like_pattern);

        // Both queries run on one connection so the page and its total see
        // the same snapshot.
        let mut tx = self.pool.begin().await?;

        let mut count_query = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT COUNT(*) FROM tasks WHERE owner = ",
        );
        count_query.push_bind(owner);
        push_filters(&mut count_query, filter, pattern.as_deref());
        let total: i64 = count_query.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut page_query = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT id, owner, title, description, completed, created_at, updated_at \
             FROM tasks WHERE owner = ",
        );
        page_query.push_bind(owner);
        push_filters(&mut page_query, filter, pattern.as_deref());
        page_query.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        page_query.push_bind(limit);
        page_query.push(" OFFSET ");
        page_query.push_bind(offset);

        let rows: Vec<TaskRow> = page_query.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        Ok(TaskPage {
            tasks: rows.into_iter().map(Task::from).collect(),
            total,
        })
    }

    pub async fn update(
        &self,
        owner: &str,
        task_id: i64,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Task> {
        if title.is_none() && description.is_none() {
            return Err(StoreError::Validation(
                "at least one of title or description is required".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let row = fetch_owned(&mut tx, owner, task_id).await?;

        let new_title = match title {
            Some(t) => validate_title(t)?,
            None => row.title,
        };
        let new_description = match description {
            Some(d) => validate_description(Some(d))?,
            None => row.description,
        };
        let now = Utc::now();

        sqlx::query(
            "UPDATE tasks SET title = ?, description = ?, updated_at = ? \
             WHERE id = ? AND owner = ?",
        )
        .bind(&new_title)
        .bind(&new_description)
        .bind(now)
        .bind(task_id)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Task {
            id: task_id,
            owner: owner.to_string(),
            title: new_title,
            description: new_description,
            completed: row.completed,
            created_at: row.created_at,
            updated_at: now,
        })
    }

    pub async fn set_completed(&self, owner: &str, task_id: i64, completed: bool) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let row = fetch_owned(&mut tx, owner, task_id).await?;
        let now = Utc::now();

        sqlx::query("UPDATE tasks SET completed = ?, updated_at = ? WHERE id = ? AND owner = ?")
            .bind(completed)
            .bind(now)
            .bind(task_id)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Task {
            completed,
            updated_at: now,
            ..Task::from(row)
        })
    }

    pub async fn delete(&self, owner: &str, task_id: i64) -> Result<DeletedTask> {
        let mut tx = self.pool.begin().await?;
        let row = fetch_owned(&mut tx, owner, task_id).await?;

        sqlx::query("DELETE FROM tasks WHERE id = ? AND owner = ?")
            .bind(task_id)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(DeletedTask {
            id: row.id,
            title: row.title,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn fetch_owned(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    owner: &str,
    task_id: i64,
) -> Result<TaskRow> {
    sqlx::query_as::<_, TaskRow>(
        "SELECT id, owner, title, description, completed, created_at, updated_at \
         FROM tasks WHERE id = ? AND owner = ?",
    )
    .bind(task_id)
    .bind(owner)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::TaskNotFound)
}

fn push_filters(
    query: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>,
    filter: &TaskFilter,
    pattern: Option<&str>,
) {
    if let Some(completed) = filter.completed {
        query.push(" AND completed = ");
        query.push_bind(completed);
    }
    if let Some(pattern) = pattern {
        query.push(" AND LOWER(title) LIKE ");
        query.push_bind(pattern.to_string());
        query.push(" ESCAPE '\\'");
    }
}

/// Build a `%substring%` LIKE pattern, escaping the LIKE metacharacters in
/// the user's search text.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    for c in search.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("%{escaped}%")
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(StoreError::Validation("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(StoreError::Validation(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_description(description: Option<&str>) -> Result<Option<String>> {
    let Some(description) = description else {
        return Ok(None);
    };
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(StoreError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(Some(description.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[tokio::test]
    async fn create_and_list_scoped_by_owner() {
        let store = Store::in_memory().await.unwrap();
        store.tasks().create("u1", "Buy milk", None).await.unwrap();
        store
            .tasks()
            .create("u2", "Other user's task", None)
            .await
            .unwrap();

        let page = store
            .tasks()
            .list("u1", &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].title, "Buy milk");
        assert_eq!(page.tasks[0].owner, "u1");
        assert!(!page.tasks[0].completed);
    }

    #[tokio::test]
    async fn list_orders_by_creation() {
        let store = Store::in_memory().await.unwrap();
        for title in ["first", "second", "third"] {
            store.tasks().create("u1", title, None).await.unwrap();
        }

        let page = store
            .tasks()
            .list("u1", &TaskFilter::default())
            .await
            .unwrap();
        let titles: Vec<_> = page.tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let store = Store::in_memory().await.unwrap();
        store.tasks().create("u1", "Buy MILK", None).await.unwrap();
        store.tasks().create("u1", "Walk dog", None).await.unwrap();

        let page = store
            .tasks()
            .list(
                "u1",
                &TaskFilter {
                    search: Some("milk".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].title, "Buy MILK");
    }

    #[tokio::test]
    async fn search_escapes_like_metacharacters() {
        let store = Store::in_memory().await.unwrap();
        store
            .tasks()
            .create("u1", "100% done report", None)
            .await
            .unwrap();
        store.tasks().create("u1", "1000 done", None).await.unwrap();

        let page = store
            .tasks()
            .list(
                "u1",
                &TaskFilter {
                    search: Some("100%".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].title, "100% done report");
    }

    #[tokio::test]
    async fn completed_filter_and_pagination() {
        let store = Store::in_memory().await.unwrap();
        for i in 0..5 {
            let task = store
                .tasks()
                .create("u1", &format!("task {i}"), None)
                .await
                .unwrap();
            if i % 2 == 0 {
                store
                    .tasks()
                    .set_completed("u1", task.id, true)
                    .await
                    .unwrap();
            }
        }

        let done = store
            .tasks()
            .list(
                "u1",
                &TaskFilter {
                    completed: Some(true),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(done.total, 3);
        assert_eq!(done.tasks.len(), 2);

        let page_two = store
            .tasks()
            .list(
                "u1",
                &TaskFilter {
                    completed: Some(true),
                    limit: Some(2),
                    offset: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page_two.tasks.len(), 1);
    }

    #[tokio::test]
    async fn limit_out_of_bounds_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let result = store
            .tasks()
            .list(
                "u1",
                &TaskFilter {
                    limit: Some(101),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn foreign_task_is_indistinguishable_from_absent() {
        let store = Store::in_memory().await.unwrap();
        let task = store.tasks().create("u1", "mine", None).await.unwrap();

        let foreign = store.tasks().delete("u2", task.id).await;
        let absent = store.tasks().delete("u2", 999_999).await;
        assert!(matches!(foreign, Err(StoreError::TaskNotFound)));
        assert!(matches!(absent, Err(StoreError::TaskNotFound)));

        // And the task is untouched.
        let page = store
            .tasks()
            .list("u1", &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn update_advances_updated_at() {
        let store = Store::in_memory().await.unwrap();
        let task = store.tasks().create("u1", "before", None).await.unwrap();

        let updated = store
            .tasks()
            .update("u1", task.id, Some("after"), Some("details"))
            .await
            .unwrap();
        assert_eq!(updated.title, "after");
        assert_eq!(updated.description.as_deref(), Some("details"));
        assert!(updated.updated_at >= task.updated_at);
        assert_eq!(updated.created_at, task.created_at);
    }

    #[tokio::test]
    async fn update_without_fields_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let task = store.tasks().create("u1", "t", None).await.unwrap();
        let result = store.tasks().update("u1", task.id, None, None).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_or_oversized_title_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        assert!(matches!(
            store.tasks().create("u1", "   ", None).await,
            Err(StoreError::Validation(_))
        ));
        let long = "x".repeat(256);
        assert!(matches!(
            store.tasks().create("u1", &long, None).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delete_returns_id_and_title() {
        let store = Store::in_memory().await.unwrap();
        let task = store.tasks().create("u1", "gone soon", None).await.unwrap();

        let deleted = store.tasks().delete("u1", task.id).await.unwrap();
        assert_eq!(deleted.id, task.id);
        assert_eq!(deleted.title, "gone soon");

        assert!(matches!(
            store.tasks().delete("u1", task.id).await,
            Err(StoreError::TaskNotFound)
        ));
    }
}
