use super::unit::{StepResult, UnitInput};
use crate::provider::SharedCapability;
use crate::shared::sync::lock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Fields an input mapping may reference as `ctx.<field>`.
pub const CONTEXT_FIELDS: &[&str] = &[
    "knowledge_text",
    "user_memory",
    "casebook_text",
    "scenario",
    "user_message",
    "image",
    "entity_id",
    "user_id",
];

/// Shared payloads supplied by the caller for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextInputs {
    pub knowledge_text: String,
    pub user_memory: Map<String, Value>,
    pub casebook_text: String,
    pub scenario: Map<String, Value>,
    pub user_message: String,
    /// Base64 image payload, when the request carries one.
    pub image: Option<String>,
    pub entity_id: Option<String>,
    pub user_id: Option<String>,
}

/// State shared by every step of one workflow run.
pub struct ExecutionContext {
    default_capability: SharedCapability,
    inputs: ContextInputs,
    results: Mutex<BTreeMap<String, StepResult>>,
}

impl ExecutionContext {
    pub fn new(default_capability: SharedCapability, inputs: ContextInputs) -> Self {
        Self {
            default_capability,
            inputs,
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn default_capability(&self) -> &SharedCapability {
        &self.default_capability
    }

    pub fn inputs(&self) -> &ContextInputs {
        &self.inputs
    }

    /// Value of a `ctx.<field>` reference; unknown fields resolve to null.
    pub fn field(&self, name: &str) -> Value {
        let inputs = &self.inputs;
        match name {
            "knowledge_text" => Value::String(inputs.knowledge_text.clone()),
            "user_memory" => Value::Object(inputs.user_memory.clone()),
            "casebook_text" => Value::String(inputs.casebook_text.clone()),
            "scenario" => Value::Object(inputs.scenario.clone()),
            "user_message" => Value::String(inputs.user_message.clone()),
            "image" => inputs.image.clone().map(Value::String).unwrap_or(Value::Null),
            "entity_id" => inputs.entity_id.clone().map(Value::String).unwrap_or(Value::Null),
            "user_id" => inputs.user_id.clone().map(Value::String).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Store a unit's result. A later write for the same unit replaces it.
    pub fn record_result(&self, unit: &str, result: StepResult) {
        lock(&self.results).insert(unit.to_string(), result);
    }

    pub fn result(&self, unit: &str) -> Option<StepResult> {
        lock(&self.results).get(unit).cloned()
    }

    pub fn results(&self) -> BTreeMap<String, StepResult> {
        lock(&self.results).clone()
    }

    /// Resolve a step's input mapping against this context.
    ///
    /// `ctx.<field>` reads a shared payload, `result.<unit>` reads a prior
    /// result (null if that unit has not run), anything else is a literal.
    pub fn build_input(&self, mapping: &BTreeMap<String, String>) -> UnitInput {
        let mut context = Map::new();
        for (target, source) in mapping {
            let value = if let Some(field) = source.strip_prefix("ctx.") {
                self.field(field)
            } else if let Some(unit) = source.strip_prefix("result.") {
                self.result(unit)
                    .map(|result| result.to_value())
                    .unwrap_or(Value::Null)
            } else {
                Value::String(source.clone())
            };
            context.insert(target.clone(), value);
        }
        UnitInput {
            user_message: self.inputs.user_message.clone(),
            context,
        }
    }
}
