use super::{decode_json, decode_timestamp, encode_json, SqliteStore, StoreError};
use crate::shared::time::to_db_timestamp;
use crate::telemetry::{SpanRecord, TraceRecord};
use async_trait::async_trait;
use rusqlite::params;

/// Durable destination for flushed trace batches.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn write_batch(
        &self,
        traces: Vec<TraceRecord>,
        spans: Vec<SpanRecord>,
    ) -> Result<(), StoreError>;
}

impl SqliteStore {
    pub fn insert_trace_batch(
        &self,
        traces: &[TraceRecord],
        spans: &[SpanRecord],
    ) -> Result<(), StoreError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction()
            .map_err(|source| StoreError::Sql { source })?;

        for trace in traces {
            tx.execute(
                "
                INSERT OR REPLACE INTO pipeline_traces (
                    trace_id, workflow, entity_id, user_id, started_at, ended_at,
                    duration_ms, success, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
                params![
                    trace.trace_id,
                    trace.workflow,
                    trace.entity_id,
                    trace.user_id,
                    to_db_timestamp(trace.started_at),
                    to_db_timestamp(trace.ended_at),
                    trace.duration_ms,
                    trace.success,
                    trace.error,
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        }

        for span in spans {
            let input = span.input.as_ref().map(encode_json).transpose()?;
            let output = span.output.as_ref().map(encode_json).transpose()?;
            tx.execute(
                "
                INSERT OR REPLACE INTO pipeline_spans (
                    span_id, trace_id, parent_span_id, name, started_at, ended_at,
                    duration_ms, success, error, input, output
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
                params![
                    span.span_id,
                    span.trace_id,
                    span.parent_span_id,
                    span.name,
                    to_db_timestamp(span.started_at),
                    to_db_timestamp(span.ended_at),
                    span.duration_ms,
                    span.success,
                    span.error,
                    input,
                    output,
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        }

        tx.commit().map_err(|source| StoreError::Sql { source })
    }

    pub fn list_traces(&self) -> Result<Vec<TraceRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT trace_id, workflow, entity_id, user_id, started_at, ended_at,
                       duration_ms, success, error
                FROM pipeline_traces
                ORDER BY started_at ASC
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;

        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                trace_id,
                workflow,
                entity_id,
                user_id,
                started_at,
                ended_at,
                duration_ms,
                success,
                error,
            ) = row.map_err(|source| StoreError::Sql { source })?;
            out.push(TraceRecord {
                trace_id,
                workflow,
                entity_id,
                user_id,
                started_at: decode_timestamp("pipeline_traces", "started_at", &started_at)?,
                ended_at: decode_timestamp("pipeline_traces", "ended_at", &ended_at)?,
                duration_ms,
                success,
                error,
            });
        }
        Ok(out)
    }

    pub fn list_spans(&self, trace_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT span_id, trace_id, parent_span_id, name, started_at, ended_at,
                       duration_ms, success, error, input, output
                FROM pipeline_spans
                WHERE trace_id = ?1
                ORDER BY started_at ASC
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;

        let rows = statement
            .query_map(params![trace_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(|source| StoreError::Sql { source })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                span_id,
                trace_id,
                parent_span_id,
                name,
                started_at,
                ended_at,
                duration_ms,
                success,
                error,
                input,
                output,
            ) = row.map_err(|source| StoreError::Sql { source })?;
            out.push(SpanRecord {
                span_id,
                trace_id,
                parent_span_id,
                name,
                started_at: decode_timestamp("pipeline_spans", "started_at", &started_at)?,
                ended_at: decode_timestamp("pipeline_spans", "ended_at", &ended_at)?,
                duration_ms,
                success,
                error,
                input: input.as_deref().map(decode_json).transpose()?,
                output: output.as_deref().map(decode_json).transpose()?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl TraceSink for SqliteStore {
    async fn write_batch(
        &self,
        traces: Vec<TraceRecord>,
        spans: Vec<SpanRecord>,
    ) -> Result<(), StoreError> {
        self.blocking(move |store| store.insert_trace_batch(&traces, &spans))
            .await
    }
}
