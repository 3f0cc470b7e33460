use super::{decode_timestamp, SqliteStore, StoreError};
use crate::shared::time::to_db_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// Administrator override: route `unit_name` to capability `target_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub unit_name: String,
    pub target_id: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait OverrideSource: Send + Sync {
    async fn load_active_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError>;
}

impl SqliteStore {
    pub fn upsert_override(&self, entry: &OverrideEntry) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "
                INSERT INTO agent_model_overrides (unit_name, target_id, active, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(unit_name) DO UPDATE SET
                    target_id = excluded.target_id,
                    active = excluded.active,
                    updated_at = excluded.updated_at
                ",
                params![
                    entry.unit_name,
                    entry.target_id,
                    entry.active,
                    to_db_timestamp(entry.updated_at)
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    pub fn active_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT unit_name, target_id, active, updated_at
                FROM agent_model_overrides
                WHERE active = 1
                ORDER BY unit_name ASC
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;

        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (unit_name, target_id, active, updated_at) =
                row.map_err(|source| StoreError::Sql { source })?;
            out.push(OverrideEntry {
                unit_name,
                target_id,
                active,
                updated_at: decode_timestamp("agent_model_overrides", "updated_at", &updated_at)?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl OverrideSource for SqliteStore {
    async fn load_active_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        self.blocking(|store| store.active_overrides()).await
    }
}
