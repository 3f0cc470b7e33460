use super::queue_worker::RequestHandler;
use crate::orchestration::{ContextInputs, ExecutionContext, StepResult, UnitInput, WorkflowRunner};
use crate::provider::{normalize_completion, SharedCapability};
use crate::reminders::schedule_plan_reminders;
use crate::shared::ids::UnitName;
use crate::shared::time::now_utc;
use crate::storage::{QueueRequest, ReminderStore};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const DRAFT_PROMPT: &str = "Generate contextual reply options for this conversation.";
const PLAN_PROMPT: &str = "Generate a step-by-step engagement plan for this entity.";

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn payload_object(payload: &Value, key: &str) -> Map<String, Value> {
    payload
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// One-step context for a claimed row: identity from the row, message and
/// optional image from the payload.
fn request_context(
    request: &QueueRequest,
    default_capability: &SharedCapability,
    default_prompt: &str,
) -> (Arc<ExecutionContext>, UnitInput) {
    let user_message =
        payload_str(&request.payload, "user_message").unwrap_or_else(|| default_prompt.to_string());
    let inputs = ContextInputs {
        user_message: user_message.clone(),
        scenario: payload_object(&request.payload, "scenario"),
        image: payload_str(&request.payload, "image"),
        entity_id: Some(request.entity_id.clone()),
        user_id: Some(request.user_id.clone()),
        ..ContextInputs::default()
    };
    let input = UnitInput::new(user_message).with_field(
        "entity_context",
        Value::Object(payload_object(&request.payload, "context")),
    );
    (
        Arc::new(ExecutionContext::new(Arc::clone(default_capability), inputs)),
        input,
    )
}

/// Runs the reply-draft unit for rows of `draft_requests`.
pub struct DraftRequestHandler {
    runner: WorkflowRunner,
    unit: UnitName,
    default_capability: SharedCapability,
}

impl DraftRequestHandler {
    pub fn new(runner: WorkflowRunner, unit: UnitName, default_capability: SharedCapability) -> Self {
        Self {
            runner,
            unit,
            default_capability,
        }
    }
}

#[async_trait]
impl RequestHandler for DraftRequestHandler {
    fn label(&self) -> &str {
        "draft_request"
    }

    async fn handle(&self, request: &QueueRequest) -> Result<Value, String> {
        let (ctx, input) = request_context(request, &self.default_capability, DRAFT_PROMPT);
        match self
            .runner
            .invoke_unit(self.label(), self.unit.as_str(), input, ctx)
            .await
        {
            StepResult::Succeeded { data } => Ok(Value::Object(normalize_completion(data))),
            StepResult::Failed { error } => Err(error),
        }
    }
}

/// Runs the planning unit for rows of `plan_requests` and schedules
/// reminders for the resulting steps.
pub struct PlanRequestHandler {
    runner: WorkflowRunner,
    unit: UnitName,
    default_capability: SharedCapability,
    reminders: Arc<dyn ReminderStore>,
    default_spacing_days: i64,
}

impl PlanRequestHandler {
    pub fn new(
        runner: WorkflowRunner,
        unit: UnitName,
        default_capability: SharedCapability,
        reminders: Arc<dyn ReminderStore>,
        default_spacing_days: i64,
    ) -> Self {
        Self {
            runner,
            unit,
            default_capability,
            reminders,
            default_spacing_days,
        }
    }
}

#[async_trait]
impl RequestHandler for PlanRequestHandler {
    fn label(&self) -> &str {
        "plan_request"
    }

    async fn handle(&self, request: &QueueRequest) -> Result<Value, String> {
        let (ctx, input) = request_context(request, &self.default_capability, PLAN_PROMPT);
        let data = match self
            .runner
            .invoke_unit(self.label(), self.unit.as_str(), input, ctx)
            .await
        {
            StepResult::Succeeded { data } => normalize_completion(data),
            StepResult::Failed { error } => return Err(error),
        };

        let steps = match data.get("plan") {
            Some(Value::Array(steps)) if !steps.is_empty() => steps.clone(),
            _ => return Err("empty plan generated".to_string()),
        };

        // A plan is still useful without its reminders.
        if let Err(err) = schedule_plan_reminders(
            self.reminders.as_ref(),
            &request.entity_id,
            &request.user_id,
            &steps,
            now_utc(),
            self.default_spacing_days,
        )
        .await
        {
            tracing::error!(
                entity_id = %request.entity_id,
                error = %err,
                "failed to schedule plan reminders"
            );
        }

        Ok(json!({ "plan": steps, "step_count": steps.len() }))
    }
}
