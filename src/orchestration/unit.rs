use super::context::ExecutionContext;
use super::error::UnitError;
use crate::provider::SharedCapability;
use crate::telemetry::{SpanHandle, SpanRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Input handed to a unit: the run's free-text message plus the step's mapped fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitInput {
    pub user_message: String,
    pub context: Map<String, Value>,
}

impl UnitInput {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            context: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// Outcome of one step. Failures are data, never propagated between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Succeeded { data: Map<String, Value> },
    Failed { error: String },
}

impl StepResult {
    pub fn succeeded(data: Map<String, Value>) -> Self {
        Self::Succeeded { data }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Succeeded { data } => Some(data),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { error } => Some(error),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Succeeded { data } => serde_json::json!({
                "success": true,
                "data": data,
                "error": Value::Null,
            }),
            Self::Failed { error } => serde_json::json!({
                "success": false,
                "data": {},
                "error": error,
            }),
        }
    }
}

/// Everything a unit receives besides its input.
///
/// `capability` is already resolved for this unit (override or default), so
/// units never look the capability up on the shared context.
#[derive(Clone)]
pub struct Invocation {
    pub capability: SharedCapability,
    pub context: Arc<ExecutionContext>,
    pub span: Option<SpanRef>,
}

impl Invocation {
    /// Open a nested span under this invocation's span, when tracing is active.
    pub fn child_span(&self, name: &str) -> Option<SpanHandle> {
        self.span.as_ref().map(|parent| parent.child(name))
    }
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        input: UnitInput,
        invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError>;
}
