use agentflow::config::{StepDefinition, StepMode, WorkflowDefinition};
use agentflow::orchestration::{
    CapabilityResolver, ContextInputs, ExecutionContext, Invocation, TaskSupervisor, UnitError,
    UnitInput, UnitOfWork, UnitRegistry, WorkflowRunner,
};
use agentflow::provider::{
    Capability, CapabilityError, CapabilityFactory, Completion, SharedCapability,
};
use agentflow::shared::ids::{UnitName, WorkflowName};
use agentflow::storage::{OverrideEntry, OverrideSource, TraceSink, StoreError};
use agentflow::telemetry::{CollectorConfig, SpanRecord, TraceCollector, TraceRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct FixedCapability {
    id: String,
}

#[async_trait]
impl Capability for FixedCapability {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        user_message: &str,
        _image: Option<&str>,
    ) -> Result<Completion, CapabilityError> {
        let mut completion = Completion::new();
        completion.insert("echo".to_string(), Value::String(user_message.to_string()));
        Ok(completion)
    }

    async fn validate_key(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

fn capability(id: &str) -> SharedCapability {
    Arc::new(FixedCapability { id: id.to_string() })
}

/// Reports which capability it ran on and what it was given.
struct Probe {
    name: String,
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl Probe {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl UnitOfWork for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: UnitInput,
        invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut out = Map::new();
        out.insert("unit".to_string(), json!(self.name));
        out.insert("capability".to_string(), json!(invocation.capability.id()));
        out.insert("input".to_string(), Value::Object(input.context));
        Ok(out)
    }
}

struct Broken;

#[async_trait]
impl UnitOfWork for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(
        &self,
        _input: UnitInput,
        _invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError> {
        Err(UnitError::Failed("upstream refused".to_string()))
    }
}

struct Panics;

#[async_trait]
impl UnitOfWork for Panics {
    fn name(&self) -> &str {
        "panics"
    }

    async fn execute(
        &self,
        _input: UnitInput,
        _invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError> {
        panic!("unit blew up");
    }
}

/// Background unit that waits until the test releases it.
struct Gated {
    gate: Arc<Notify>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl UnitOfWork for Gated {
    fn name(&self) -> &str {
        "memory_writer"
    }

    async fn execute(
        &self,
        _input: UnitInput,
        _invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError> {
        self.gate.notified().await;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Map::new())
    }
}

#[derive(Default)]
struct MemorySink {
    traces: Mutex<Vec<TraceRecord>>,
    spans: Mutex<Vec<SpanRecord>>,
}

#[async_trait]
impl TraceSink for MemorySink {
    async fn write_batch(
        &self,
        traces: Vec<TraceRecord>,
        spans: Vec<SpanRecord>,
    ) -> Result<(), StoreError> {
        self.traces.lock().expect("traces").extend(traces);
        self.spans.lock().expect("spans").extend(spans);
        Ok(())
    }
}

struct StaticOverrides(Vec<OverrideEntry>);

#[async_trait]
impl OverrideSource for StaticOverrides {
    async fn load_active_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        Ok(self.0.clone())
    }
}

struct FixedFactory;

impl CapabilityFactory for FixedFactory {
    fn build(&self, target_id: &str, _credential: &str) -> Result<SharedCapability, CapabilityError> {
        Ok(capability(target_id))
    }
}

fn step(unit: &str, mode: StepMode) -> StepDefinition {
    StepDefinition::new(UnitName::parse(unit).expect("unit name"), mode)
}

fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: WorkflowName::parse(name).expect("workflow name"),
        description: String::new(),
        steps,
    }
}

fn context() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::new(
        capability("default-model"),
        ContextInputs {
            user_message: "hello there".to_string(),
            knowledge_text: "product facts".to_string(),
            entity_id: Some("lead-7".to_string()),
            user_id: Some("user-1".to_string()),
            ..ContextInputs::default()
        },
    ))
}

fn registry(units: Vec<Arc<dyn UnitOfWork>>) -> Arc<UnitRegistry> {
    let mut registry = UnitRegistry::new();
    for unit in units {
        registry.register(unit).expect("register unit");
    }
    Arc::new(registry)
}

#[tokio::test]
async fn sequential_steps_see_prior_results_and_context_fields() {
    let runner = WorkflowRunner::new(
        registry(vec![Arc::new(Probe::new("analyzer")), Arc::new(Probe::new("writer"))]),
        TaskSupervisor::new(),
    );
    let definition = workflow(
        "reply",
        vec![
            step("analyzer", StepMode::Sequential).with_mapping("knowledge", "ctx.knowledge_text"),
            step("writer", StepMode::Sequential)
                .with_mapping("analysis", "result.analyzer")
                .with_mapping("tone", "friendly"),
        ],
    );

    let results = runner.run(&definition, context()).await;

    let writer = results["writer"].data().expect("writer succeeded");
    assert_eq!(writer["input"]["analysis"]["success"], json!(true));
    assert_eq!(writer["input"]["analysis"]["data"]["unit"], json!("analyzer"));
    assert_eq!(writer["input"]["tone"], json!("friendly"));
    let analyzer = results["analyzer"].data().expect("analyzer succeeded");
    assert_eq!(analyzer["input"]["knowledge"], json!("product facts"));
}

#[tokio::test]
async fn parallel_siblings_each_run_on_their_own_capability() {
    let resolver = Arc::new(CapabilityResolver::new(
        Arc::new(StaticOverrides(vec![OverrideEntry {
            unit_name: "scorer".to_string(),
            target_id: "override-model".to_string(),
            active: true,
            updated_at: Utc::now(),
        }])),
        Arc::new(FixedFactory),
        Some("shared-key".to_string()),
        Duration::from_secs(60),
    ));
    let runner = WorkflowRunner::new(
        registry(vec![
            Arc::new(Probe::new("scorer").slow(Duration::from_millis(30))),
            Arc::new(Probe::new("summarizer")),
            Arc::new(Probe::new("tagger").slow(Duration::from_millis(10))),
        ]),
        TaskSupervisor::new(),
    )
    .with_resolver(resolver);
    let definition = workflow(
        "fan_out",
        vec![
            step("scorer", StepMode::Parallel),
            step("summarizer", StepMode::Parallel),
            step("tagger", StepMode::Parallel),
        ],
    );
    let ctx = context();

    let results = runner.run(&definition, Arc::clone(&ctx)).await;

    let capability_of = |unit: &str| results[unit].data().expect("success")["capability"].clone();
    assert_eq!(capability_of("scorer"), json!("override-model"));
    assert_eq!(capability_of("summarizer"), json!("default-model"));
    assert_eq!(capability_of("tagger"), json!("default-model"));
    assert_eq!(ctx.default_capability().id(), "default-model");
}

#[tokio::test]
async fn failed_and_panicking_steps_do_not_stop_the_workflow() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), CollectorConfig::default());
    let runner = WorkflowRunner::new(
        registry(vec![
            Arc::new(Broken),
            Arc::new(Panics),
            Arc::new(Probe::new("writer")),
        ]),
        TaskSupervisor::new(),
    )
    .with_trace_collector(Arc::clone(&collector));
    let definition = workflow(
        "fragile",
        vec![
            step("broken", StepMode::Sequential),
            step("panics", StepMode::Parallel),
            step("writer", StepMode::Sequential).with_mapping("prior", "result.broken"),
        ],
    );

    let results = runner.run(&definition, context()).await;

    assert_eq!(results["broken"].error(), Some("upstream refused"));
    assert!(results["panics"]
        .error()
        .expect("panic becomes failure")
        .contains("unit blew up"));
    let writer = results["writer"].data().expect("writer still runs");
    assert_eq!(writer["input"]["prior"]["success"], json!(false));

    collector.flush_now().await;
    let traces = sink.traces.lock().expect("traces").clone();
    assert_eq!(traces.len(), 1);
    assert!(!traces[0].success);
    assert_eq!(
        traces[0].error.as_deref(),
        Some("broken: upstream refused")
    );
    assert_eq!(traces[0].entity_id.as_deref(), Some("lead-7"));
    let spans = sink.spans.lock().expect("spans").clone();
    assert_eq!(spans.len(), 3);
    assert!(spans.iter().all(|span| span.trace_id == traces[0].trace_id));
    assert_eq!(spans.iter().filter(|span| span.success).count(), 1);
}

#[tokio::test]
async fn background_step_records_exactly_once_after_run_returns() {
    let gate = Arc::new(Notify::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let supervisor = TaskSupervisor::new();
    let runner = WorkflowRunner::new(
        registry(vec![
            Arc::new(Gated {
                gate: Arc::clone(&gate),
                runs: Arc::clone(&runs),
            }),
            Arc::new(Probe::new("writer")),
        ]),
        Arc::clone(&supervisor),
    );
    let definition = workflow(
        "with_memory",
        vec![
            step("memory_writer", StepMode::Background),
            step("writer", StepMode::Sequential),
        ],
    );
    let ctx = context();

    let results = runner.run(&definition, Arc::clone(&ctx)).await;

    assert!(results.contains_key("writer"));
    assert!(!results.contains_key("memory_writer"));
    assert_eq!(supervisor.in_flight(), 1);
    assert_eq!(supervisor.task_names(), vec!["background:memory_writer".to_string()]);

    gate.notify_one();
    assert!(supervisor.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(ctx.result("memory_writer").expect("recorded").is_success());
}

#[tokio::test]
async fn invoke_unit_reports_unknown_units_as_failures() {
    let runner = WorkflowRunner::new(registry(vec![]), TaskSupervisor::new());

    let result = runner
        .invoke_unit("direct", "missing", UnitInput::new("hi"), context())
        .await;

    assert!(result.error().expect("failure").contains("missing"));
}
