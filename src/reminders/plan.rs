use super::timing::parse_step_due_date;
use crate::storage::{NewReminder, ReminderStore, ScheduleReport, StoreError};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub const DRAFT_TEXT_MAX_CHARS: usize = 500;

fn step_id(step: &Map<String, Value>, index: usize) -> i64 {
    step.get("step_id")
        .and_then(|value| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(raw) => raw.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(index as i64 + 1)
}

fn draft_text(step: &Map<String, Value>) -> Option<String> {
    ["suggested_text", "description"]
        .iter()
        .filter_map(|key| step.get(*key).and_then(Value::as_str))
        .find(|text| !text.trim().is_empty())
        .map(|text| text.chars().take(DRAFT_TEXT_MAX_CHARS).collect())
}

/// One reminder per plan step. Steps that are not JSON objects still get a
/// reminder at their default spacing.
pub fn build_plan_reminders(
    entity_id: &str,
    owner_id: &str,
    plan_steps: &[Value],
    base: DateTime<Utc>,
    default_spacing_days: i64,
) -> Vec<NewReminder> {
    let empty = Map::new();
    plan_steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let step = step.as_object().unwrap_or(&empty);
            NewReminder {
                entity_id: entity_id.to_string(),
                owner_id: owner_id.to_string(),
                step_id: step_id(step, index),
                due_at: parse_step_due_date(step, base, index, default_spacing_days),
                draft_text: draft_text(step),
            }
        })
        .collect()
}

/// Replace the entity's open reminders with a fresh batch for `plan_steps`.
///
/// Safe to call again whenever the plan is regenerated.
pub async fn schedule_plan_reminders(
    store: &dyn ReminderStore,
    entity_id: &str,
    owner_id: &str,
    plan_steps: &[Value],
    base: DateTime<Utc>,
    default_spacing_days: i64,
) -> Result<ScheduleReport, StoreError> {
    let reminders = build_plan_reminders(entity_id, owner_id, plan_steps, base, default_spacing_days);
    let report = store.replace_for_entity(entity_id, reminders, base).await?;
    tracing::info!(
        entity_id,
        created = report.created,
        cancelled = report.cancelled,
        base = %base,
        "scheduled plan reminders"
    );
    Ok(report)
}
