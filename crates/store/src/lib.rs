//! Persistence layer: owner-scoped task CRUD and append-only conversation
//! logs over SQLite.
//!
//! The database is the only shared mutable resource in the service; no
//! state survives a request outside of it. Every operation acquires its
//! transactional scope from the pool and releases it before returning, so
//! nothing here spans an LLM call.

pub mod conversations;
pub mod tasks;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub use conversations::ConversationStore;
pub use tasks::{DeletedTask, TaskFilter, TaskPage, TaskStore};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Covers both "no such task" and "task owned by someone else" so
    /// callers cannot probe for existence across owners.
    #[error("task not found")]
    TaskNotFound,

    /// Same indistinguishability contract as [`StoreError::TaskNotFound`].
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("validation: {0}")]
    Validation(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared handle over the connection pool. Clones are cheap and safe to
/// pass into every request handler.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the database named by the config URL, creating the file
    /// if needed, and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        MIGRATOR.run(&pool).await?;

        tracing::info!(url = %database_url, "store connected, schema current");
        Ok(Self { pool })
    }

    /// A private in-memory database. One connection only: each SQLite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn tasks(&self) -> TaskStore<'_> {
        TaskStore::new(&self.pool)
    }

    pub fn conversations(&self) -> ConversationStore<'_> {
        ConversationStore::new(&self.pool)
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
