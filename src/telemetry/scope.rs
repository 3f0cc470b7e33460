use super::collector::TraceCollector;
use super::model::{SpanRecord, TraceRecord};
use super::snapshot;
use crate::shared::ids::generate_record_id;
use crate::shared::sync::lock;
use crate::shared::time::now_utc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Trace state for a single workflow run.
///
/// Spans opened without an explicit parent attach to the most recently opened
/// span still running in this run. Every span removes itself from that stack
/// when it completes or is dropped. Detached spans never join the stack, so
/// concurrent siblings cannot become each other's implicit parent.
pub struct TraceScope {
    collector: Arc<TraceCollector>,
    trace_id: String,
    workflow: String,
    entity_id: Option<String>,
    user_id: Option<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    open_spans: Mutex<Vec<String>>,
    finished: AtomicBool,
}

impl TraceScope {
    pub fn begin(
        collector: Arc<TraceCollector>,
        workflow: &str,
        entity_id: Option<String>,
        user_id: Option<String>,
    ) -> Arc<Self> {
        let scope = Arc::new(Self {
            collector,
            trace_id: generate_record_id(),
            workflow: workflow.to_string(),
            entity_id,
            user_id,
            started_at: now_utc(),
            started: Instant::now(),
            open_spans: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        });
        tracing::info!(trace_id = %scope.trace_id, workflow, "trace started");
        scope
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn open_root_span(self: &Arc<Self>, name: &str) -> SpanHandle {
        self.open_with_parent(name, None, true)
    }

    /// Root span for work running alongside other spans of this run.
    /// Nested spans must name it explicitly through [`SpanHandle::as_parent`].
    pub fn open_detached_span(self: &Arc<Self>, name: &str) -> SpanHandle {
        self.open_with_parent(name, None, false)
    }

    pub fn open_child_span(self: &Arc<Self>, name: &str, parent: &SpanRef) -> SpanHandle {
        self.open_with_parent(name, Some(parent.span_id.clone()), true)
    }

    /// Open a span whose parent is the innermost span still open in this run.
    pub fn open_span(self: &Arc<Self>, name: &str) -> SpanHandle {
        let parent = lock(&self.open_spans).last().cloned();
        self.open_with_parent(name, parent, true)
    }

    pub fn open_span_count(&self) -> usize {
        lock(&self.open_spans).len()
    }

    /// Finalize the trace and hand it to the collector. Only the first call records.
    pub fn finish(&self, error: Option<String>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let success = error.is_none();
        tracing::info!(
            trace_id = %self.trace_id,
            workflow = %self.workflow,
            duration_ms,
            success,
            "trace completed"
        );
        self.collector.record_trace(TraceRecord {
            trace_id: self.trace_id.clone(),
            workflow: self.workflow.clone(),
            entity_id: self.entity_id.clone(),
            user_id: self.user_id.clone(),
            started_at: self.started_at,
            ended_at: now_utc(),
            duration_ms,
            success,
            error,
        });
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn open_with_parent(
        self: &Arc<Self>,
        name: &str,
        parent_span_id: Option<String>,
        stacked: bool,
    ) -> SpanHandle {
        let span_id = generate_record_id();
        if stacked {
            lock(&self.open_spans).push(span_id.clone());
        }
        SpanHandle {
            scope: Arc::clone(self),
            span_id,
            parent_span_id,
            name: name.to_string(),
            started_at: now_utc(),
            started: Instant::now(),
            input: None,
            done: false,
        }
    }

    fn close_span(&self, span_id: &str) {
        let mut open = lock(&self.open_spans);
        if let Some(position) = open.iter().rposition(|id| id == span_id) {
            open.remove(position);
        }
    }
}

/// Cheap reference to an open span, handed to callees that open nested spans.
#[derive(Clone)]
pub struct SpanRef {
    scope: Arc<TraceScope>,
    span_id: String,
}

impl SpanRef {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn trace_id(&self) -> &str {
        self.scope.trace_id()
    }

    pub fn child(&self, name: &str) -> SpanHandle {
        self.scope.open_child_span(name, self)
    }
}

impl Debug for SpanRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRef")
            .field("trace_id", &self.scope.trace_id)
            .field("span_id", &self.span_id)
            .finish()
    }
}

/// An open span. Finishing consumes it; dropping it unfinished records a failure.
pub struct SpanHandle {
    scope: Arc<TraceScope>,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    started_at: DateTime<Utc>,
    started: Instant,
    input: Option<Value>,
    done: bool,
}

impl SpanHandle {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn as_parent(&self) -> SpanRef {
        SpanRef {
            scope: Arc::clone(&self.scope),
            span_id: self.span_id.clone(),
        }
    }

    pub fn record_input<T>(&mut self, input: &T)
    where
        T: Serialize + Debug + ?Sized,
    {
        let limits = self.scope.collector.config().snapshot;
        self.input = Some(snapshot::capture(input, limits));
    }

    pub fn finish_ok<T>(mut self, output: &T)
    where
        T: Serialize + Debug + ?Sized,
    {
        let limits = self.scope.collector.config().snapshot;
        let output = snapshot::capture(output, limits);
        self.complete(None, Some(output));
    }

    pub fn finish_err(mut self, error: impl Into<String>) {
        self.complete(Some(error.into()), None);
    }

    fn complete(&mut self, error: Option<String>, output: Option<Value>) {
        if self.done {
            return;
        }
        self.done = true;
        self.scope.close_span(&self.span_id);
        let success = error.is_none();
        let input = if success { self.input.take() } else { None };
        self.scope.collector.record_span(SpanRecord {
            span_id: self.span_id.clone(),
            trace_id: self.scope.trace_id.clone(),
            parent_span_id: self.parent_span_id.clone(),
            name: self.name.clone(),
            started_at: self.started_at,
            ended_at: now_utc(),
            duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            success,
            error,
            input,
            output,
        });
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        self.complete(Some("span dropped before completion".to_string()), None);
    }
}
