use crate::shared::sync::lock;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

struct TaskEntry {
    name: String,
    abort: Option<AbortHandle>,
}

/// Owns fire-and-forget work so it is never silently lost.
///
/// Tasks register on spawn and deregister when they finish, panic or are
/// aborted; completion is logged either way.
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    next_id: AtomicU64,
    idle: Notify,
}

struct Registration {
    supervisor: Arc<TaskSupervisor>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = lock(&self.supervisor.tasks).remove(&self.id);
        if let Some(entry) = removed {
            tracing::debug!(task = %entry.name, "background task deregistered");
        }
        self.supervisor.idle.notify_waiters();
    }
}

impl TaskSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn<F>(self: &Arc<Self>, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.tasks).insert(
            id,
            TaskEntry {
                name: name.clone(),
                abort: None,
            },
        );

        let registration = Registration {
            supervisor: Arc::clone(self),
            id,
        };
        let handle = tokio::spawn(async move {
            let _registration = registration;
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(()) => tracing::info!(task = %name, "background task finished"),
                Err(_) => tracing::error!(task = %name, "background task panicked"),
            }
        });

        if let Some(entry) = lock(&self.tasks).get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tasks)
            .values()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Wait until no task is in flight. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Abort everything still running; returns how many tasks were signalled.
    pub fn abort_all(&self) -> usize {
        let tasks = lock(&self.tasks);
        let mut aborted = 0;
        for entry in tasks.values() {
            if let Some(abort) = &entry.abort {
                abort.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "aborted in-flight background tasks");
        }
        aborted
    }
}
