use crate::storage::{QueueStore, QueueTable, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Cutoff before which a `processing` claim counts as abandoned.
pub fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(stale_after)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Return rows a crashed worker left in `processing` to `pending`.
///
/// Rows with no claim time are always reset.
pub async fn recover_stale_requests(
    store: &dyn QueueStore,
    table: QueueTable,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let cutoff = stale_cutoff(now, stale_after);
    let recovered = store.reset_stale_processing(table, cutoff).await?;
    if recovered > 0 {
        tracing::warn!(
            table = %table,
            recovered,
            cutoff = %cutoff,
            "reset stale processing requests"
        );
    }
    Ok(recovered)
}
