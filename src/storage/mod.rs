use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod error;
pub mod overrides;
pub mod queue;
pub mod reminders;
pub mod traces;

pub use error::StoreError;
pub use overrides::{OverrideEntry, OverrideSource};
pub use queue::{NewQueueRequest, QueueRequest, QueueStore, QueueTable, RequestStatus};
pub use reminders::{NewReminder, Reminder, ReminderStatus, ReminderStore, ScheduleReport};
pub use traces::TraceSink;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed implementation of every storage seam.
///
/// Each operation opens its own connection, so the store is cheap to clone
/// and safe to use from several pollers at once. Async callers run the
/// blocking work on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.connect()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS draft_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    claimed_at TEXT,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_draft_requests_status
                    ON draft_requests(status, id);

                CREATE TABLE IF NOT EXISTS plan_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    claimed_at TEXT,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_plan_requests_status
                    ON plan_requests(status, id);

                CREATE TABLE IF NOT EXISTS agent_model_overrides (
                    unit_name TEXT PRIMARY KEY,
                    target_id TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_traces (
                    trace_id TEXT PRIMARY KEY,
                    workflow TEXT NOT NULL,
                    entity_id TEXT,
                    user_id TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT NOT NULL,
                    duration_ms REAL NOT NULL,
                    success INTEGER NOT NULL,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS pipeline_spans (
                    span_id TEXT PRIMARY KEY,
                    trace_id TEXT NOT NULL,
                    parent_span_id TEXT,
                    name TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT NOT NULL,
                    duration_ms REAL NOT NULL,
                    success INTEGER NOT NULL,
                    error TEXT,
                    input TEXT,
                    output TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_pipeline_spans_trace
                    ON pipeline_spans(trace_id);

                CREATE TABLE IF NOT EXISTS scheduled_reminders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    step_id INTEGER NOT NULL,
                    due_at TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    draft_text TEXT,
                    reminder_count INTEGER NOT NULL DEFAULT 0,
                    snooze_count INTEGER NOT NULL DEFAULT 0,
                    last_reminded_at TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_scheduled_reminders_due
                    ON scheduled_reminders(status, due_at);
                CREATE INDEX IF NOT EXISTS idx_scheduled_reminders_entity
                    ON scheduled_reminders(entity_id);
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT name FROM sqlite_master
                WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                ORDER BY name ASC
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;

        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|source| StoreError::Sql { source })?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(|source| StoreError::Sql { source })?);
        }
        Ok(names)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| StoreError::Sql { source })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection)
    }

    /// Run `op` against a clone of this store on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }
}

fn decode_timestamp(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    crate::shared::time::parse_db_timestamp(raw).map_err(|_| StoreError::InvalidColumn {
        table,
        column,
        value: raw.to_string(),
    })
}

fn decode_optional_timestamp(
    table: &'static str,
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
    raw.map(|value| decode_timestamp(table, column, &value))
        .transpose()
}

fn decode_json(raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Json { source })
}

fn encode_json(value: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Json { source })
}
