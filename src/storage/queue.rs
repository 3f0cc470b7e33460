use super::{
    decode_json, decode_optional_timestamp, decode_timestamp, encode_json, SqliteStore,
    StoreError,
};
use crate::shared::time::to_db_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The request-queue tables the pollers drain. Both share one row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTable {
    DraftRequests,
    PlanRequests,
}

impl QueueTable {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::DraftRequests => "draft_requests",
            Self::PlanRequests => "plan_requests",
        }
    }
}

impl std::fmt::Display for QueueTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub id: i64,
    pub table: QueueTable,
    pub entity_id: String,
    pub user_id: String,
    pub payload: Value,
    pub status: RequestStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueRequest {
    pub entity_id: String,
    pub user_id: String,
    pub payload: Value,
}

/// Claim/complete/fail contract the request pollers depend on.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically move the oldest `pending` row to `processing`.
    ///
    /// A claimed row whose columns cannot be decoded comes back as
    /// [`StoreError::UndecodableRequest`] and stays `processing` until failed.
    async fn claim_next_pending(
        &self,
        table: QueueTable,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueRequest>, StoreError>;

    /// Returns false when the row was no longer `processing`.
    async fn complete(
        &self,
        table: QueueTable,
        id: i64,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn fail(
        &self,
        table: QueueTable,
        id: i64,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Reset rows claimed before `claimed_before` and still `processing` back to `pending`.
    async fn reset_stale_processing(
        &self,
        table: QueueTable,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

const REQUEST_COLUMNS: &str =
    "id, entity_id, user_id, payload, status, result, error, created_at, claimed_at, completed_at";

impl SqliteStore {
    pub fn enqueue_request(
        &self,
        table: QueueTable,
        request: &NewQueueRequest,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                &format!(
                    "INSERT INTO {} (entity_id, user_id, payload, status, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                    table.table_name()
                ),
                params![
                    request.entity_id,
                    request.user_id,
                    encode_json(&request.payload)?,
                    to_db_timestamp(now)
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection.last_insert_rowid())
    }

    pub fn get_request(
        &self,
        table: QueueTable,
        id: i64,
    ) -> Result<Option<QueueRequest>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM {} WHERE id = ?1",
                    table.table_name()
                ),
                params![id],
                read_raw_request,
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        raw.map(|raw| decode_request(table, raw)).transpose()
    }

    pub fn claim_request(
        &self,
        table: QueueTable,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueRequest>, StoreError> {
        let connection = self.connect()?;
        let name = table.table_name();
        // The inner select and the status guard run as one statement, so two
        // claimers can never both flip the same row.
        let raw = connection
            .query_row(
                &format!(
                    "UPDATE {name}
                     SET status = 'processing', claimed_at = ?1
                     WHERE id = (
                         SELECT id FROM {name}
                         WHERE status = 'pending'
                         ORDER BY id ASC
                         LIMIT 1
                     )
                     AND status = 'pending'
                     RETURNING {REQUEST_COLUMNS}"
                ),
                params![to_db_timestamp(now)],
                read_raw_request,
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // The row is already `processing`; keep its id so the caller can fail it.
        let id = raw.0;
        decode_request(table, raw)
            .map(Some)
            .map_err(|err| StoreError::UndecodableRequest {
                table: name,
                id,
                reason: err.to_string(),
            })
    }

    pub fn complete_request(
        &self,
        table: QueueTable,
        id: i64,
        result: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                &format!(
                    "UPDATE {} SET status = 'completed', result = ?2, error = NULL, completed_at = ?3
                     WHERE id = ?1 AND status = 'processing'",
                    table.table_name()
                ),
                params![id, encode_json(result)?, to_db_timestamp(now)],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(changed == 1)
    }

    pub fn fail_request(
        &self,
        table: QueueTable,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                &format!(
                    "UPDATE {} SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE id = ?1 AND status = 'processing'",
                    table.table_name()
                ),
                params![id, error, to_db_timestamp(now)],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(changed == 1)
    }

    pub fn reset_stale_requests(
        &self,
        table: QueueTable,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                &format!(
                    "UPDATE {} SET status = 'pending', claimed_at = NULL
                     WHERE status = 'processing'
                       AND (claimed_at IS NULL OR claimed_at < ?1)",
                    table.table_name()
                ),
                params![to_db_timestamp(claimed_before)],
            )
            .map_err(|source| StoreError::Sql { source })
    }

    pub fn count_requests(
        &self,
        table: QueueTable,
        status: RequestStatus,
    ) -> Result<u64, StoreError> {
        let connection = self.connect()?;
        let count: i64 = connection
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE status = ?1",
                    table.table_name()
                ),
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(count as u64)
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn claim_next_pending(
        &self,
        table: QueueTable,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueRequest>, StoreError> {
        self.blocking(move |store| store.claim_request(table, now))
            .await
    }

    async fn complete(
        &self,
        table: QueueTable,
        id: i64,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.blocking(move |store| store.complete_request(table, id, &result, now))
            .await
    }

    async fn fail(
        &self,
        table: QueueTable,
        id: i64,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.blocking(move |store| store.fail_request(table, id, &error, now))
            .await
    }

    async fn reset_stale_processing(
        &self,
        table: QueueTable,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.blocking(move |store| store.reset_stale_requests(table, claimed_before))
            .await
    }
}

type RawRequest = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn read_raw_request(row: &Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_request(table: QueueTable, raw: RawRequest) -> Result<QueueRequest, StoreError> {
    let (
        id,
        entity_id,
        user_id,
        payload,
        status,
        result,
        error,
        created_at,
        claimed_at,
        completed_at,
    ) = raw;
    let name = table.table_name();
    let status = RequestStatus::parse(&status).ok_or_else(|| StoreError::InvalidColumn {
        table: name,
        column: "status",
        value: status.clone(),
    })?;
    Ok(QueueRequest {
        id,
        table,
        entity_id,
        user_id,
        payload: decode_json(&payload)?,
        status,
        result: result.as_deref().map(decode_json).transpose()?,
        error,
        created_at: decode_timestamp(name, "created_at", &created_at)?,
        claimed_at: decode_optional_timestamp(name, "claimed_at", claimed_at)?,
        completed_at: decode_optional_timestamp(name, "completed_at", completed_at)?,
    })
}
