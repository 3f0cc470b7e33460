use super::queue_worker::{PollerConfig, RequestNotifier, RequestPoller};
use super::request_handlers::{DraftRequestHandler, PlanRequestHandler};
use super::scheduler_worker::{DispatchConfig, ReminderDispatcher, ReminderNotifier};
use super::worker_registry::{WorkerEvent, WorkerHealth, WorkerKind, WorkerRegistry};
use crate::config::{load_workflows_from_dir, Settings, WorkflowDefinition};
use crate::orchestration::{
    CapabilityResolver, ExecutionContext, StepResult, TaskSupervisor, UnitRegistry,
    WorkflowRunner,
};
use crate::provider::{CapabilityFactory, RetryPolicy, RetryingCapability, SharedCapability};
use crate::shared::errors::RuntimeError;
use crate::shared::ids::{UnitName, WorkflowName};
use crate::shared::sync::lock;
use crate::storage::{QueueTable, SqliteStore};
use crate::telemetry::{CollectorConfig, FlushReport, TraceCollector};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long shutdown waits for loops and background units before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Collaborators supplied by the embedding application.
pub struct DaemonParts {
    pub settings: Settings,
    pub registry: UnitRegistry,
    pub default_capability: SharedCapability,
    pub capability_factory: Arc<dyn CapabilityFactory>,
    pub reminder_notifier: Arc<dyn ReminderNotifier>,
    pub request_notifier: Option<Arc<dyn RequestNotifier>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub loops_aborted: usize,
    pub background_aborted: usize,
    pub final_flush: Option<FlushReport>,
}

/// The running service: both request pollers, the reminder scheduler and
/// the shared workflow machinery they use.
pub struct Daemon {
    store: SqliteStore,
    runner: WorkflowRunner,
    resolver: Arc<CapabilityResolver>,
    collector: Option<Arc<TraceCollector>>,
    supervisor: Arc<TaskSupervisor>,
    workflows: BTreeMap<WorkflowName, WorkflowDefinition>,
    workers: Arc<Mutex<WorkerRegistry>>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Validate configuration, prepare the schema and start every loop.
    ///
    /// Configuration problems are fatal here and never surface later at runtime.
    pub async fn start(parts: DaemonParts) -> Result<Self, RuntimeError> {
        let DaemonParts {
            settings,
            registry,
            default_capability,
            capability_factory,
            reminder_notifier,
            request_notifier,
        } = parts;
        settings.validate()?;

        let registry = Arc::new(registry);
        let workflows = match &settings.workflows_path {
            Some(dir) => load_workflows_from_dir(dir, &registry)?,
            None => BTreeMap::new(),
        };
        let draft_unit = resolve_unit(&registry, &settings.pollers.draft_unit)?;
        let plan_unit = resolve_unit(&registry, &settings.pollers.plan_unit)?;

        let db_path = settings.database_path.clone();
        let store = tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open(&db_path)?;
            store.ensure_schema()?;
            Ok::<_, RuntimeError>(store)
        })
        .await
        .map_err(|err| RuntimeError::Startup(err.to_string()))??;
        let shared_store = Arc::new(store.clone());

        // Default and override capabilities share one transient-retry policy.
        let retry = RetryPolicy::from(&settings.retry);
        let default_capability = RetryingCapability::wrap(default_capability, retry.clone());
        let resolver = Arc::new(
            CapabilityResolver::new(
                shared_store.clone(),
                capability_factory,
                settings.overrides.shared_credential(),
                settings.overrides.cache_ttl(),
            )
            .with_retry_policy(retry),
        );
        let collector = settings.tracing.enabled.then(|| {
            let collector = TraceCollector::new(
                shared_store.clone(),
                CollectorConfig::from(&settings.tracing),
            );
            collector.start();
            collector
        });

        let supervisor = TaskSupervisor::new();
        let mut runner = WorkflowRunner::new(Arc::clone(&registry), Arc::clone(&supervisor))
            .with_resolver(Arc::clone(&resolver));
        if let Some(collector) = &collector {
            runner = runner.with_trace_collector(Arc::clone(collector));
        }

        let workers = Arc::new(Mutex::new(WorkerRegistry::default()));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        // Ends once every worker has dropped its sender.
        let consumer = {
            let workers = Arc::clone(&workers);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    lock(&workers).apply(&event);
                }
            })
        };

        let poller_config = PollerConfig::from(&settings.pollers);
        let draft_handler = Arc::new(DraftRequestHandler::new(
            runner.clone(),
            draft_unit,
            Arc::clone(&default_capability),
        ));
        let plan_handler = Arc::new(PlanRequestHandler::new(
            runner.clone(),
            plan_unit,
            Arc::clone(&default_capability),
            shared_store.clone(),
            settings.reminders.default_spacing_days,
        ));
        let pollers = [
            RequestPoller::new(
                QueueTable::DraftRequests,
                shared_store.clone(),
                draft_handler,
                poller_config,
            ),
            RequestPoller::new(
                QueueTable::PlanRequests,
                shared_store.clone(),
                plan_handler,
                poller_config,
            ),
        ];
        for poller in pollers {
            let mut poller = poller.with_events(event_tx.clone());
            if let Some(notifier) = &request_notifier {
                poller = poller.with_notifier(Arc::clone(notifier));
            }
            lock(&workers).register(poller.worker());
            let shutdown_rx = shutdown_rx.clone();
            loops.push(tokio::spawn(async move { poller.run(shutdown_rx).await }));
        }

        let dispatcher = ReminderDispatcher::new(
            shared_store,
            reminder_notifier,
            DispatchConfig::from(&settings.reminders),
        )
        .with_events(event_tx);
        lock(&workers).register(WorkerKind::ReminderScheduler);
        loops.push(tokio::spawn(async move { dispatcher.run(shutdown_rx).await }));
        loops.push(consumer);

        tracing::info!(
            database = %store.path().display(),
            units = registry.len(),
            workflows = workflows.len(),
            tracing = collector.is_some(),
            "daemon started"
        );
        Ok(Self {
            store,
            runner,
            resolver,
            collector,
            supervisor,
            workflows,
            workers,
            shutdown,
            loops,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn runner(&self) -> &WorkflowRunner {
        &self.runner
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name)
    }

    pub fn workflow_names(&self) -> Vec<&str> {
        self.workflows.keys().map(WorkflowName::as_str).collect()
    }

    pub async fn run_workflow(
        &self,
        name: &str,
        ctx: Arc<ExecutionContext>,
    ) -> Result<BTreeMap<String, StepResult>, RuntimeError> {
        let workflow = self
            .workflows
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownWorkflow(name.to_string()))?;
        Ok(self.runner.run(workflow, ctx).await)
    }

    pub fn worker_health(&self) -> HashMap<WorkerKind, WorkerHealth> {
        lock(&self.workers).all().clone()
    }

    /// Stop the loops, give background units a grace period, drain the
    /// trace collector and release override capabilities.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("daemon shutting down");
        self.shutdown.send_replace(true);

        let mut report = ShutdownReport::default();
        for mut handle in self.loops {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
                report.loops_aborted += 1;
            }
        }

        if !self.supervisor.wait_idle(SHUTDOWN_GRACE).await {
            report.background_aborted = self.supervisor.abort_all();
            tracing::warn!(
                aborted = report.background_aborted,
                "background units still running at shutdown"
            );
        }

        if let Some(collector) = &self.collector {
            report.final_flush = Some(collector.stop().await);
        }
        self.resolver.close().await;
        tracing::info!(
            loops_aborted = report.loops_aborted,
            background_aborted = report.background_aborted,
            "daemon stopped"
        );
        report
    }
}

fn resolve_unit(registry: &UnitRegistry, name: &str) -> Result<UnitName, RuntimeError> {
    registry.get(name)?;
    UnitName::parse(name).map_err(|reason| {
        RuntimeError::Registry(crate::orchestration::RegistryError::InvalidName {
            name: name.to_string(),
            reason,
        })
    })
}
