use super::model::{SpanRecord, TraceRecord};
use super::snapshot::SnapshotLimits;
use crate::config::TracingSettings;
use crate::shared::sync::lock;
use crate::storage::TraceSink;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub stop_timeout: Duration,
    pub snapshot: SnapshotLimits,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::from(&TracingSettings::default())
    }
}

impl From<&TracingSettings> for CollectorConfig {
    fn from(settings: &TracingSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_secs(settings.flush_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(settings.stop_timeout_secs),
            snapshot: SnapshotLimits {
                max_bytes: settings.snapshot_max_bytes,
                repr_chars: settings.snapshot_repr_chars,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Buffers {
    traces: Vec<TraceRecord>,
    spans: Vec<SpanRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub traces: usize,
    pub spans: usize,
    pub persisted: bool,
}

/// Size and time batched sink for traces and spans.
///
/// Producers append under a short lock; the flush routine swaps both buffers
/// out in one step, so records appended mid-flush land in the next batch.
pub struct TraceCollector {
    sink: Arc<dyn TraceSink>,
    config: CollectorConfig,
    buffers: Mutex<Buffers>,
    flush_requested: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TraceCollector {
    pub fn new(sink: Arc<dyn TraceSink>, config: CollectorConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sink,
            config,
            buffers: Mutex::new(Buffers::default()),
            flush_requested: Notify::new(),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Spawn the background flush loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let collector = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            collector.flush_loop(shutdown).await;
        }));
        tracing::info!(
            batch_size = self.config.batch_size,
            flush_interval_secs = self.config.flush_interval.as_secs(),
            "trace collector started"
        );
    }

    async fn flush_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_now().await;
                }
                _ = self.flush_requested.notified() => {
                    self.flush_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("trace collector loop exited");
    }

    /// Signal the loop, wait up to `stop_timeout` for it, then drain whatever is left.
    pub async fn stop(&self) -> FlushReport {
        self.shutdown.send_replace(true);
        let handle = lock(&self.task).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.config.stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "trace collector loop ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.stop_timeout.as_millis() as u64,
                        "trace collector loop did not stop in time; aborting"
                    );
                    handle.abort();
                }
            }
        }
        let report = self.flush_now().await;
        tracing::info!(
            traces = report.traces,
            spans = report.spans,
            "trace collector stopped"
        );
        report
    }

    pub fn record_trace(&self, trace: TraceRecord) {
        let pending = {
            let mut buffers = lock(&self.buffers);
            buffers.traces.push(trace);
            buffers.traces.len()
        };
        if pending >= self.config.batch_size {
            self.flush_requested.notify_one();
        }
    }

    pub fn record_span(&self, span: SpanRecord) {
        let pending = {
            let mut buffers = lock(&self.buffers);
            buffers.spans.push(span);
            buffers.spans.len()
        };
        if pending >= self.config.batch_size {
            self.flush_requested.notify_one();
        }
    }

    /// Buffered (traces, spans) not yet handed to the sink.
    pub fn buffered(&self) -> (usize, usize) {
        let buffers = lock(&self.buffers);
        (buffers.traces.len(), buffers.spans.len())
    }

    /// Persist everything buffered right now. A failed batch is logged and dropped.
    pub async fn flush_now(&self) -> FlushReport {
        let Buffers { traces, spans } = std::mem::take(&mut *lock(&self.buffers));
        if traces.is_empty() && spans.is_empty() {
            return FlushReport {
                persisted: true,
                ..FlushReport::default()
            };
        }

        let counts = (traces.len(), spans.len());
        match self.sink.write_batch(traces, spans).await {
            Ok(()) => {
                tracing::debug!(traces = counts.0, spans = counts.1, "flushed trace batch");
                FlushReport {
                    traces: counts.0,
                    spans: counts.1,
                    persisted: true,
                }
            }
            Err(err) => {
                tracing::error!(
                    traces = counts.0,
                    spans = counts.1,
                    error = %err,
                    "trace flush failed; dropping batch"
                );
                FlushReport {
                    traces: counts.0,
                    spans: counts.1,
                    persisted: false,
                }
            }
        }
    }
}
