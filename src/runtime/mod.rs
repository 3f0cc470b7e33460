pub mod daemon;
pub mod queue_worker;
pub mod recovery;
pub mod request_handlers;
pub mod scheduler_worker;
pub mod worker_registry;

pub use crate::shared::errors::RuntimeError;
pub use daemon::{Daemon, DaemonParts, ShutdownReport, SHUTDOWN_GRACE};
pub use queue_worker::{
    PollerConfig, RequestHandler, RequestNotifier, RequestOutcome, RequestPoller,
};
pub use recovery::{recover_stale_requests, stale_cutoff};
pub use request_handlers::{DraftRequestHandler, PlanRequestHandler};
pub use scheduler_worker::{
    DeliveryOutcome, DispatchConfig, DispatchSummary, ReminderDispatcher, ReminderNotifier,
    DISPATCH_BATCH_LIMIT,
};
pub use worker_registry::{WorkerEvent, WorkerHealth, WorkerKind, WorkerRegistry, WorkerState};
