use super::background::TaskSupervisor;
use super::context::ExecutionContext;
use super::registry::UnitRegistry;
use super::resolver::CapabilityResolver;
use super::unit::{Invocation, StepResult, UnitInput};
use crate::config::{StepDefinition, StepMode, WorkflowDefinition};
use crate::provider::SharedCapability;
use crate::telemetry::{TraceCollector, TraceScope};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Consecutive steps grouped by how they are scheduled.
#[derive(Debug, PartialEq, Eq)]
pub enum StepGroup<'a> {
    Sequential(&'a StepDefinition),
    Parallel(Vec<&'a StepDefinition>),
    Background(&'a StepDefinition),
}

/// Walk the step list once, batching runs of adjacent `parallel` steps.
pub fn plan_step_groups(steps: &[StepDefinition]) -> Vec<StepGroup<'_>> {
    let mut groups = Vec::new();
    let mut index = 0;
    while index < steps.len() {
        let step = &steps[index];
        match &step.mode {
            StepMode::Parallel => {
                let mut batch = vec![step];
                index += 1;
                while index < steps.len() && steps[index].mode == StepMode::Parallel {
                    batch.push(&steps[index]);
                    index += 1;
                }
                groups.push(StepGroup::Parallel(batch));
                continue;
            }
            StepMode::Background => groups.push(StepGroup::Background(step)),
            StepMode::Sequential | StepMode::Unrecognized(_) => {
                groups.push(StepGroup::Sequential(step))
            }
        }
        index += 1;
    }
    groups
}

/// Finalizes the trace if the run future is dropped before it completes.
struct TraceGuard(Option<Arc<TraceScope>>);

impl TraceGuard {
    fn finish(mut self, error: Option<String>) {
        if let Some(scope) = self.0.take() {
            scope.finish(error);
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.0.take() {
            scope.finish(Some("workflow run cancelled".to_string()));
        }
    }
}

/// Executes workflow definitions against an execution context.
#[derive(Clone)]
pub struct WorkflowRunner {
    registry: Arc<UnitRegistry>,
    supervisor: Arc<TaskSupervisor>,
    resolver: Option<Arc<CapabilityResolver>>,
    collector: Option<Arc<TraceCollector>>,
}

impl WorkflowRunner {
    pub fn new(registry: Arc<UnitRegistry>, supervisor: Arc<TaskSupervisor>) -> Self {
        Self {
            registry,
            supervisor,
            resolver: None,
            collector: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<CapabilityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_trace_collector(mut self, collector: Arc<TraceCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Run every step of `workflow` and return the results recorded so far.
    ///
    /// Background steps are handed to the supervisor and may still be running
    /// when this returns; they record into `ctx` when they finish.
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        ctx: Arc<ExecutionContext>,
    ) -> BTreeMap<String, StepResult> {
        tracing::info!(
            workflow = %workflow.name,
            steps = workflow.steps.len(),
            "running workflow"
        );
        let trace = TraceGuard(self.begin_trace(workflow.name.as_str(), &ctx));
        let scope = trace.0.clone();
        let mut first_failure: Option<String> = None;
        let mut note = |unit: &str, result: &StepResult| {
            if let (None, Some(error)) = (&first_failure, result.error()) {
                first_failure = Some(format!("{unit}: {error}"));
            }
        };

        for group in plan_step_groups(&workflow.steps) {
            match group {
                StepGroup::Sequential(step) => {
                    if let StepMode::Unrecognized(raw) = &step.mode {
                        tracing::warn!(
                            workflow = %workflow.name,
                            unit = %step.unit,
                            mode = %raw,
                            "unknown step mode; running sequentially"
                        );
                    }
                    let capability = self.resolve(step.unit.as_str(), &ctx).await;
                    let result = self
                        .execute_step(step, capability, &ctx, scope.as_ref(), false)
                        .await;
                    note(step.unit.as_str(), &result);
                    ctx.record_result(step.unit.as_str(), result);
                }
                StepGroup::Parallel(batch) => {
                    tracing::info!(workflow = %workflow.name, units = batch.len(), "running parallel batch");
                    // Every capability is resolved before any sibling starts.
                    let mut prepared = Vec::with_capacity(batch.len());
                    for step in batch {
                        let capability = self.resolve(step.unit.as_str(), &ctx).await;
                        prepared.push((step, capability));
                    }
                    let outcomes = join_all(prepared.into_iter().map(|(step, capability)| {
                        let ctx = &ctx;
                        let scope = scope.as_ref();
                        async move {
                            let result =
                                self.execute_step(step, capability, ctx, scope, true).await;
                            (step.unit.as_str(), result)
                        }
                    }))
                    .await;
                    for (unit, result) in outcomes {
                        note(unit, &result);
                        ctx.record_result(unit, result);
                    }
                }
                StepGroup::Background(step) => {
                    self.spawn_background(step.clone(), Arc::clone(&ctx), scope.clone());
                }
            }
        }

        trace.finish(first_failure);
        ctx.results()
    }

    /// Run one unit directly with a fresh trace, outside any workflow definition.
    pub async fn invoke_unit(
        &self,
        label: &str,
        unit: &str,
        input: UnitInput,
        ctx: Arc<ExecutionContext>,
    ) -> StepResult {
        let trace = TraceGuard(self.begin_trace(label, &ctx));
        let scope = trace.0.clone();
        let capability = self.resolve(unit, &ctx).await;
        let result = self
            .execute_unit(unit, input, capability, &ctx, scope.as_ref(), false)
            .await;
        ctx.record_result(unit, result.clone());
        trace.finish(result.error().map(|error| format!("{unit}: {error}")));
        result
    }

    fn begin_trace(&self, workflow: &str, ctx: &ExecutionContext) -> Option<Arc<TraceScope>> {
        self.collector.as_ref().map(|collector| {
            TraceScope::begin(
                Arc::clone(collector),
                workflow,
                ctx.inputs().entity_id.clone(),
                ctx.inputs().user_id.clone(),
            )
        })
    }

    async fn resolve(&self, unit: &str, ctx: &ExecutionContext) -> SharedCapability {
        match &self.resolver {
            Some(resolver) => resolver.capability_for(unit, ctx.default_capability()).await,
            None => Arc::clone(ctx.default_capability()),
        }
    }

    async fn execute_step(
        &self,
        step: &StepDefinition,
        capability: SharedCapability,
        ctx: &Arc<ExecutionContext>,
        scope: Option<&Arc<TraceScope>>,
        concurrent: bool,
    ) -> StepResult {
        let input = ctx.build_input(&step.input_mapping);
        self.execute_unit(step.unit.as_str(), input, capability, ctx, scope, concurrent)
            .await
    }

    async fn execute_unit(
        &self,
        unit_name: &str,
        input: UnitInput,
        capability: SharedCapability,
        ctx: &Arc<ExecutionContext>,
        scope: Option<&Arc<TraceScope>>,
        concurrent: bool,
    ) -> StepResult {
        let unit = match self.registry.get(unit_name) {
            Ok(unit) => unit,
            Err(err) => {
                tracing::error!(unit = unit_name, error = %err, "unit lookup failed");
                return StepResult::failed(err.to_string());
            }
        };

        // Units sharing the run with siblings stay off the implicit-parent stack.
        let mut span = scope.map(|scope| {
            if concurrent {
                scope.open_detached_span(unit_name)
            } else {
                scope.open_root_span(unit_name)
            }
        });
        if let Some(span) = span.as_mut() {
            span.record_input(&input);
        }
        let invocation = Invocation {
            capability,
            context: Arc::clone(ctx),
            span: span.as_ref().map(|span| span.as_parent()),
        };

        tracing::info!(unit = unit_name, capability = invocation.capability.id(), "running unit");
        let outcome = AssertUnwindSafe(unit.execute(input, &invocation))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(data)) => StepResult::succeeded(data),
            Ok(Err(err)) => StepResult::failed(err.to_string()),
            Err(panic) => StepResult::failed(format!("unit panicked: {}", panic_message(&*panic))),
        };

        match (&result, span) {
            (StepResult::Succeeded { data }, Some(span)) => span.finish_ok(data),
            (StepResult::Failed { error }, Some(span)) => span.finish_err(error.clone()),
            (_, None) => {}
        }
        match result.error() {
            None => tracing::info!(unit = unit_name, "unit completed"),
            Some(error) => tracing::warn!(unit = unit_name, error, "unit failed"),
        }
        result
    }

    fn spawn_background(
        &self,
        step: StepDefinition,
        ctx: Arc<ExecutionContext>,
        scope: Option<Arc<TraceScope>>,
    ) {
        tracing::info!(unit = %step.unit, "starting background unit");
        let runner = self.clone();
        let name = format!("background:{}", step.unit);
        self.supervisor.spawn(name, async move {
            let capability = runner.resolve(step.unit.as_str(), &ctx).await;
            let result = runner
                .execute_step(&step, capability, &ctx, scope.as_ref(), true)
                .await;
            ctx.record_result(step.unit.as_str(), result);
        });
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
