use agentflow::storage::{SqliteStore, StoreError, TraceSink};
use agentflow::telemetry::{
    CollectorConfig, SnapshotLimits, SpanRecord, TraceCollector, TraceRecord, TraceScope,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

#[derive(Default)]
struct MemorySink {
    traces: Mutex<Vec<TraceRecord>>,
    spans: Mutex<Vec<SpanRecord>>,
    batches: AtomicUsize,
    failing: AtomicBool,
}

impl MemorySink {
    fn trace_count(&self) -> usize {
        self.traces.lock().expect("traces").len()
    }

    fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().expect("spans").clone()
    }
}

#[async_trait]
impl TraceSink for MemorySink {
    async fn write_batch(
        &self,
        traces: Vec<TraceRecord>,
        spans: Vec<SpanRecord>,
    ) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Join("sink offline".to_string()));
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.traces.lock().expect("traces").extend(traces);
        self.spans.lock().expect("spans").extend(spans);
        Ok(())
    }
}

fn config(batch_size: usize, flush_interval: Duration) -> CollectorConfig {
    CollectorConfig {
        batch_size,
        flush_interval,
        stop_timeout: Duration::from_secs(2),
        snapshot: SnapshotLimits::default(),
    }
}

fn run_once(collector: &Arc<TraceCollector>, workflow: &str) {
    let scope = TraceScope::begin(Arc::clone(collector), workflow, Some("lead-1".to_string()), None);
    let span = scope.open_root_span("writer");
    span.finish_ok(&json!({"reply": "ok"}));
    scope.finish(None);
}

#[tokio::test]
async fn stop_drains_every_buffered_record() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), config(50, Duration::from_secs(3600)));
    collector.start();

    for _ in 0..7 {
        run_once(&collector, "reply");
    }
    assert_eq!(collector.buffered(), (7, 7));

    let report = collector.stop().await;

    assert_eq!(report.traces, 7);
    assert_eq!(report.spans, 7);
    assert!(report.persisted);
    assert_eq!(sink.trace_count(), 7);
    assert_eq!(collector.buffered(), (0, 0));
}

#[tokio::test]
async fn reaching_batch_size_flushes_before_the_interval() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), config(3, Duration::from_secs(3600)));
    collector.start();

    for _ in 0..3 {
        run_once(&collector, "reply");
    }

    let mut flushed = false;
    for _ in 0..200 {
        if sink.trace_count() == 3 {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(flushed, "size threshold should trigger a flush");
    collector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn interval_tick_flushes_small_batches() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), config(50, Duration::from_secs(10)));
    collector.start();
    run_once(&collector, "reply");

    tokio::time::sleep(Duration::from_secs(11)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(sink.trace_count(), 1);
    collector.stop().await;
}

#[tokio::test]
async fn failed_flush_drops_the_batch_without_affecting_callers() {
    let sink = Arc::new(MemorySink::default());
    sink.failing.store(true, Ordering::SeqCst);
    let collector = TraceCollector::new(sink.clone(), config(50, Duration::from_secs(3600)));

    run_once(&collector, "reply");
    let report = collector.flush_now().await;

    assert!(!report.persisted);
    assert_eq!(report.traces, 1);
    assert_eq!(collector.buffered(), (0, 0));

    sink.failing.store(false, Ordering::SeqCst);
    run_once(&collector, "reply");
    assert!(collector.stop().await.persisted);
    assert_eq!(sink.trace_count(), 1);
}

#[tokio::test]
async fn detached_sibling_spans_are_never_ambient_parents() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), CollectorConfig::default());
    let scope = TraceScope::begin(Arc::clone(&collector), "score", None, None);

    let left = scope.open_detached_span("tone_scorer");
    let right = scope.open_detached_span("fit_scorer");
    assert_eq!(scope.open_span_count(), 0);

    let ambient = scope.open_span("parse");
    assert_eq!(ambient.parent_span_id(), None);
    let nested = right.as_parent().child("llm_call");
    assert_eq!(nested.parent_span_id(), Some(right.span_id()));
    assert_ne!(nested.parent_span_id(), Some(left.span_id()));

    nested.finish_ok(&());
    ambient.finish_ok(&());
    left.finish_ok(&());
    right.finish_ok(&());
    assert_eq!(scope.open_span_count(), 0);
    scope.finish(None);
    collector.flush_now().await;
    assert_eq!(sink.spans().len(), 4);
}

#[tokio::test]
async fn spans_nest_under_explicit_and_ambient_parents() {
    let sink = Arc::new(MemorySink::default());
    let collector = TraceCollector::new(sink.clone(), CollectorConfig::default());
    let scope = TraceScope::begin(Arc::clone(&collector), "reply", None, None);

    let root = scope.open_root_span("pipeline");
    let root_id = root.span_id().to_string();
    let explicit = root.as_parent().child("llm_call");
    assert_eq!(explicit.parent_span_id(), Some(root_id.as_str()));

    let ambient = scope.open_span("parse");
    assert_eq!(ambient.parent_span_id(), Some(explicit.span_id()));
    assert_eq!(scope.open_span_count(), 3);

    ambient.finish_ok(&json!({"parsed": true}));
    explicit.finish_err("rate limited");
    drop(root);
    assert_eq!(scope.open_span_count(), 0);

    let after = scope.open_span("late");
    assert_eq!(after.parent_span_id(), None);
    after.finish_ok(&());

    assert!(scope.finish(Some("llm_call: rate limited".to_string())));
    assert!(!scope.finish(None));
    collector.flush_now().await;

    let spans = sink.spans();
    assert_eq!(spans.len(), 4);
    let dropped = spans
        .iter()
        .find(|span| span.name == "pipeline")
        .expect("root span recorded");
    assert!(!dropped.success);
    assert_eq!(dropped.error.as_deref(), Some("span dropped before completion"));
    let traces = sink.traces.lock().expect("traces").clone();
    assert_eq!(traces.len(), 1);
    assert!(!traces[0].success);
}

#[tokio::test]
async fn sqlite_sink_persists_traces_and_spans() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("traces.db")).expect("open"));
    store.ensure_schema().expect("schema");
    let collector = TraceCollector::new(store.clone(), CollectorConfig::default());

    let scope = TraceScope::begin(Arc::clone(&collector), "plan", Some("lead-9".to_string()), None);
    let mut span = scope.open_root_span("planner");
    span.record_input(&json!({"goal": "book a demo"}));
    let child = span.as_parent().child("llm_call");
    child.finish_ok(&json!({"tokens": 12}));
    span.finish_ok(&json!({"plan": []}));
    scope.finish(None);
    collector.stop().await;

    let traces = store.list_traces().expect("traces");
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].workflow, "plan");
    assert_eq!(traces[0].entity_id.as_deref(), Some("lead-9"));
    let spans = store.list_spans(&traces[0].trace_id).expect("spans");
    assert_eq!(spans.len(), 2);
    let planner = spans
        .iter()
        .find(|span| span.name == "planner")
        .expect("planner span");
    assert_eq!(planner.input, Some(json!({"goal": "book a demo"})));
    let llm = spans.iter().find(|span| span.name == "llm_call").expect("child");
    assert_eq!(llm.parent_span_id.as_deref(), Some(planner.span_id.as_str()));
}
