use crate::storage::QueueTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started {
        worker: WorkerKind,
        at: DateTime<Utc>,
    },
    Heartbeat {
        worker: WorkerKind,
        at: DateTime<Utc>,
    },
    Error {
        worker: WorkerKind,
        at: DateTime<Utc>,
        message: String,
        fatal: bool,
    },
    Stopped {
        worker: WorkerKind,
        at: DateTime<Utc>,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> WorkerKind {
        match self {
            Self::Started { worker, .. }
            | Self::Heartbeat { worker, .. }
            | Self::Error { worker, .. }
            | Self::Stopped { worker, .. } => *worker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    RequestPoller(QueueTable),
    ReminderScheduler,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestPoller(table) => write!(f, "poller:{table}"),
            Self::ReminderScheduler => write!(f, "reminder_scheduler"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            state: WorkerState::Stopped,
            last_heartbeat: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerKind, WorkerHealth>,
}

impl WorkerRegistry {
    pub fn register(&mut self, worker: WorkerKind) {
        self.workers.entry(worker).or_default();
    }

    pub fn apply(&mut self, event: &WorkerEvent) {
        let health = self.workers.entry(event.worker()).or_default();
        match event {
            WorkerEvent::Started { at, .. } => {
                health.state = WorkerState::Running;
                health.last_heartbeat = Some(*at);
            }
            WorkerEvent::Heartbeat { at, .. } => {
                if health.state != WorkerState::Error {
                    health.state = WorkerState::Running;
                }
                health.last_heartbeat = Some(*at);
            }
            WorkerEvent::Error { message, fatal, .. } => {
                health.last_error = Some(message.clone());
                if *fatal {
                    health.state = WorkerState::Error;
                }
            }
            WorkerEvent::Stopped { .. } => {
                if health.state != WorkerState::Error {
                    health.state = WorkerState::Stopped;
                }
            }
        }
    }

    pub fn state(&self, worker: &WorkerKind) -> Option<WorkerState> {
        self.workers.get(worker).map(|health| health.state)
    }

    pub fn health(&self, worker: &WorkerKind) -> Option<&WorkerHealth> {
        self.workers.get(worker)
    }

    pub fn all(&self) -> &HashMap<WorkerKind, WorkerHealth> {
        &self.workers
    }
}

/// Best-effort event publication; a closed channel only means nobody is watching.
pub(crate) fn emit(events: &Option<UnboundedSender<WorkerEvent>>, event: WorkerEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
