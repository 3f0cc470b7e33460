use super::recovery::recover_stale_requests;
use super::worker_registry::{emit, WorkerEvent, WorkerKind};
use crate::config::PollerSettings;
use crate::orchestration::workflow_engine::panic_message;
use crate::shared::time::now_utc;
use crate::storage::{QueueRequest, QueueStore, QueueTable, StoreError};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub execution_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&PollerSettings::default())
    }
}

impl From<&PollerSettings> for PollerConfig {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            stale_after: Duration::from_secs(settings.stale_after_secs),
            execution_timeout: Duration::from_secs(settings.execution_timeout_secs.max(1)),
        }
    }
}

/// Terminal state written back for one claimed request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed(Value),
    Failed(String),
}

impl RequestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Work performed for one claimed row.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn label(&self) -> &str;

    async fn handle(&self, request: &QueueRequest) -> Result<Value, String>;
}

/// Told about every request after its terminal state is stored.
#[async_trait]
pub trait RequestNotifier: Send + Sync {
    async fn on_finished(
        &self,
        request: &QueueRequest,
        outcome: &RequestOutcome,
    ) -> Result<(), String>;
}

/// Polls one request table: claim, execute under a deadline, write the
/// terminal state, notify. Any number of pollers may share a table.
pub struct RequestPoller {
    table: QueueTable,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn RequestHandler>,
    notifier: Option<Arc<dyn RequestNotifier>>,
    config: PollerConfig,
    events: Option<UnboundedSender<WorkerEvent>>,
}

impl RequestPoller {
    pub fn new(
        table: QueueTable,
        store: Arc<dyn QueueStore>,
        handler: Arc<dyn RequestHandler>,
        config: PollerConfig,
    ) -> Self {
        Self {
            table,
            store,
            handler,
            notifier: None,
            config,
            events: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RequestNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn table(&self) -> QueueTable {
        self.table
    }

    pub fn worker(&self) -> WorkerKind {
        WorkerKind::RequestPoller(self.table)
    }

    /// Reset abandoned claims. Failures are logged and reported as zero.
    pub async fn recover_stale(&self) -> usize {
        match recover_stale_requests(
            self.store.as_ref(),
            self.table,
            self.config.stale_after,
            now_utc(),
        )
        .await
        {
            Ok(recovered) => recovered,
            Err(err) => {
                tracing::error!(table = %self.table, error = %err, "stale request recovery failed");
                emit(
                    &self.events,
                    WorkerEvent::Error {
                        worker: self.worker(),
                        at: now_utc(),
                        message: err.to_string(),
                        fatal: false,
                    },
                );
                0
            }
        }
    }

    /// Claim and fully process at most one request.
    ///
    /// Returns `Ok(None)` when the table has nothing pending.
    pub async fn tick(&self) -> Result<Option<RequestOutcome>, StoreError> {
        let request = match self.store.claim_next_pending(self.table, now_utc()).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(None),
            Err(StoreError::UndecodableRequest { id, reason, .. }) => {
                return self.fail_undecodable(id, reason).await.map(Some);
            }
            Err(err) => return Err(err),
        };
        tracing::info!(
            table = %self.table,
            request_id = request.id,
            entity_id = %request.entity_id,
            handler = self.handler.label(),
            "claimed request"
        );

        let outcome = self.execute(&request).await;
        let written = match &outcome {
            RequestOutcome::Completed(result) => {
                self.store
                    .complete(self.table, request.id, result.clone(), now_utc())
                    .await?
            }
            RequestOutcome::Failed(error) => {
                self.store
                    .fail(self.table, request.id, error.clone(), now_utc())
                    .await?
            }
        };
        if !written {
            tracing::warn!(
                table = %self.table,
                request_id = request.id,
                "request left processing before its result was stored"
            );
            return Ok(Some(outcome));
        }

        match &outcome {
            RequestOutcome::Completed(_) => {
                tracing::info!(table = %self.table, request_id = request.id, "request completed")
            }
            RequestOutcome::Failed(error) => {
                tracing::warn!(table = %self.table, request_id = request.id, error = %error, "request failed")
            }
        }
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.on_finished(&request, &outcome).await {
                tracing::warn!(
                    table = %self.table,
                    request_id = request.id,
                    error = %err,
                    "request notification failed"
                );
            }
        }
        Ok(Some(outcome))
    }

    /// A claimed row that cannot be read is failed right away so it never
    /// lingers in `processing`.
    async fn fail_undecodable(&self, id: i64, reason: String) -> Result<RequestOutcome, StoreError> {
        let error = format!("undecodable request: {reason}");
        tracing::error!(table = %self.table, request_id = id, error = %error, "claimed request could not be decoded");
        self.store
            .fail(self.table, id, error.clone(), now_utc())
            .await?;
        Ok(RequestOutcome::Failed(error))
    }

    async fn execute(&self, request: &QueueRequest) -> RequestOutcome {
        let work = AssertUnwindSafe(self.handler.handle(request)).catch_unwind();
        match tokio::time::timeout(self.config.execution_timeout, work).await {
            Ok(Ok(Ok(result))) => RequestOutcome::Completed(result),
            Ok(Ok(Err(error))) => RequestOutcome::Failed(error),
            Ok(Err(panic)) => {
                RequestOutcome::Failed(format!("handler panicked: {}", panic_message(&*panic)))
            }
            Err(_) => RequestOutcome::Failed(format!(
                "execution timed out after {}s",
                self.config.execution_timeout.as_secs()
            )),
        }
    }

    /// Recover, then poll until `shutdown` turns true. The request in
    /// flight when shutdown arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let worker = self.worker();
        emit(&self.events, WorkerEvent::Started { worker, at: now_utc() });
        self.recover_stale().await;
        tracing::info!(
            table = %self.table,
            interval_secs = self.config.poll_interval.as_secs(),
            "request poller started"
        );

        while !*shutdown.borrow() {
            match self.tick().await {
                Ok(Some(_)) => {
                    emit(&self.events, WorkerEvent::Heartbeat { worker, at: now_utc() })
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(table = %self.table, error = %err, "request poll failed");
                    emit(
                        &self.events,
                        WorkerEvent::Error {
                            worker,
                            at: now_utc(),
                            message: err.to_string(),
                            fatal: false,
                        },
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(table = %self.table, "request poller stopped");
        emit(&self.events, WorkerEvent::Stopped { worker, at: now_utc() });
    }
}
