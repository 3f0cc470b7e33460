use super::{decode_optional_timestamp, decode_timestamp, SqliteStore, StoreError};
use crate::shared::time::to_db_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const TABLE: &str = "scheduled_reminders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Completed,
    Skipped,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Still awaiting action from the owner.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

impl std::fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub entity_id: String,
    pub owner_id: String,
    pub step_id: i64,
    pub due_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub draft_text: Option<String>,
    pub reminder_count: u32,
    pub snooze_count: u32,
    pub last_reminded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReminder {
    pub entity_id: String,
    pub owner_id: String,
    pub step_id: i64,
    pub due_at: DateTime<Utc>,
    pub draft_text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub cancelled: usize,
    pub created: usize,
}

#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Cancel the entity's open reminders and insert `reminders` in one transaction.
    async fn replace_for_entity(
        &self,
        entity_id: &str,
        reminders: Vec<NewReminder>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, StoreError>;

    /// Open reminders with `due_at <= now`, oldest first.
    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError>;

    async fn mark_reminded(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn update_status(
        &self,
        id: i64,
        status: ReminderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Move the due date, reopen as `pending` and bump the snooze counter.
    /// With `reset_escalation` the reminder count starts over, so delivery
    /// resumes once the new due date passes.
    async fn snooze(
        &self,
        id: i64,
        new_due_at: DateTime<Utc>,
        reset_escalation: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn reminders_for_entity(&self, entity_id: &str) -> Result<Vec<Reminder>, StoreError>;
}

const REMINDER_COLUMNS: &str = "id, entity_id, owner_id, step_id, due_at, status, draft_text, \
     reminder_count, snooze_count, last_reminded_at, completed_at, created_at, updated_at";

impl SqliteStore {
    pub fn replace_entity_reminders(
        &self,
        entity_id: &str,
        reminders: &[NewReminder],
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, StoreError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction()
            .map_err(|source| StoreError::Sql { source })?;
        let now_raw = to_db_timestamp(now);

        let cancelled = tx
            .execute(
                "
                UPDATE scheduled_reminders
                SET status = 'cancelled', updated_at = ?2
                WHERE entity_id = ?1 AND status IN ('pending', 'sent')
                ",
                params![entity_id, now_raw],
            )
            .map_err(|source| StoreError::Sql { source })?;

        for reminder in reminders {
            tx.execute(
                "
                INSERT INTO scheduled_reminders (
                    entity_id, owner_id, step_id, due_at, status, draft_text,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)
                ",
                params![
                    reminder.entity_id,
                    reminder.owner_id,
                    reminder.step_id,
                    to_db_timestamp(reminder.due_at),
                    reminder.draft_text,
                    now_raw,
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        }

        tx.commit().map_err(|source| StoreError::Sql { source })?;
        Ok(ScheduleReport {
            cancelled,
            created: reminders.len(),
        })
    }

    pub fn list_due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM scheduled_reminders
                 WHERE due_at <= ?1 AND status IN ('pending', 'sent')
                 ORDER BY due_at ASC, id ASC
                 LIMIT ?2"
            ))
            .map_err(|source| StoreError::Sql { source })?;
        let rows = statement
            .query_map(
                params![to_db_timestamp(now), limit as i64],
                read_raw_reminder,
            )
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_reminder(
                row.map_err(|source| StoreError::Sql { source })?,
            )?);
        }
        Ok(out)
    }

    pub fn list_entity_reminders(&self, entity_id: &str) -> Result<Vec<Reminder>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM scheduled_reminders
                 WHERE entity_id = ?1
                 ORDER BY step_id ASC, id ASC"
            ))
            .map_err(|source| StoreError::Sql { source })?;
        let rows = statement
            .query_map(params![entity_id], read_raw_reminder)
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_reminder(
                row.map_err(|source| StoreError::Sql { source })?,
            )?);
        }
        Ok(out)
    }

    pub fn get_reminder(&self, id: i64) -> Result<Option<Reminder>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {REMINDER_COLUMNS} FROM scheduled_reminders WHERE id = ?1"),
                params![id],
                read_raw_reminder,
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        raw.map(decode_reminder).transpose()
    }

    pub fn mark_reminder_reminded(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let connection = self.connect()?;
        let now_raw = to_db_timestamp(now);
        connection
            .execute(
                "
                UPDATE scheduled_reminders
                SET reminder_count = reminder_count + 1,
                    last_reminded_at = ?2,
                    updated_at = ?2
                WHERE id = ?1
                ",
                params![id, now_raw],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub fn set_reminder_status(
        &self,
        id: i64,
        status: ReminderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let connection = self.connect()?;
        let now_raw = to_db_timestamp(now);
        let completed_at = (status == ReminderStatus::Completed).then(|| now_raw.clone());
        connection
            .execute(
                "
                UPDATE scheduled_reminders
                SET status = ?2,
                    updated_at = ?3,
                    completed_at = COALESCE(?4, completed_at)
                WHERE id = ?1
                ",
                params![id, status.as_str(), now_raw, completed_at],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub fn snooze_reminder(
        &self,
        id: i64,
        new_due_at: DateTime<Utc>,
        reset_escalation: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "
                UPDATE scheduled_reminders
                SET due_at = ?2,
                    status = 'pending',
                    snooze_count = snooze_count + 1,
                    reminder_count = CASE WHEN ?4 THEN 0 ELSE reminder_count END,
                    updated_at = ?3
                WHERE id = ?1
                ",
                params![
                    id,
                    to_db_timestamp(new_due_at),
                    to_db_timestamp(now),
                    reset_escalation
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }
}

#[async_trait]
impl ReminderStore for SqliteStore {
    async fn replace_for_entity(
        &self,
        entity_id: &str,
        reminders: Vec<NewReminder>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, StoreError> {
        let entity_id = entity_id.to_string();
        self.blocking(move |store| store.replace_entity_reminders(&entity_id, &reminders, now))
            .await
    }

    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, StoreError> {
        self.blocking(move |store| store.list_due_reminders(now, limit))
            .await
    }

    async fn mark_reminded(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.blocking(move |store| store.mark_reminder_reminded(id, now))
            .await
    }

    async fn update_status(
        &self,
        id: i64,
        status: ReminderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.blocking(move |store| store.set_reminder_status(id, status, now))
            .await
    }

    async fn snooze(
        &self,
        id: i64,
        new_due_at: DateTime<Utc>,
        reset_escalation: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.blocking(move |store| store.snooze_reminder(id, new_due_at, reset_escalation, now))
            .await
    }

    async fn reminders_for_entity(&self, entity_id: &str) -> Result<Vec<Reminder>, StoreError> {
        let entity_id = entity_id.to_string();
        self.blocking(move |store| store.list_entity_reminders(&entity_id))
            .await
    }
}

type RawReminder = (
    i64,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    i64,
    i64,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn read_raw_reminder(row: &Row<'_>) -> rusqlite::Result<RawReminder> {
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
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn decode_reminder(raw: RawReminder) -> Result<Reminder, StoreError> {
    let (
        id,
        entity_id,
        owner_id,
        step_id,
        due_at,
        status,
        draft_text,
        reminder_count,
        snooze_count,
        last_reminded_at,
        completed_at,
        created_at,
        updated_at,
    ) = raw;
    let status = ReminderStatus::parse(&status).ok_or_else(|| StoreError::InvalidColumn {
        table: TABLE,
        column: "status",
        value: status.clone(),
    })?;
    Ok(Reminder {
        id,
        entity_id,
        owner_id,
        step_id,
        due_at: decode_timestamp(TABLE, "due_at", &due_at)?,
        status,
        draft_text,
        reminder_count: u32::try_from(reminder_count).unwrap_or(0),
        snooze_count: u32::try_from(snooze_count).unwrap_or(0),
        last_reminded_at: decode_optional_timestamp(TABLE, "last_reminded_at", last_reminded_at)?,
        completed_at: decode_optional_timestamp(TABLE, "completed_at", completed_at)?,
        created_at: decode_timestamp(TABLE, "created_at", &created_at)?,
        updated_at: decode_timestamp(TABLE, "updated_at", &updated_at)?,
    })
}
