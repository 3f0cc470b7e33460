use super::worker_registry::{emit, WorkerEvent, WorkerKind};
use crate::config::ReminderSettings;
use crate::shared::time::now_utc;
use crate::storage::{Reminder, ReminderStatus, ReminderStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

/// Most reminders handled in one dispatch pass.
pub const DISPATCH_BATCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The entity the reminder belongs to no longer exists.
    EntityGone,
}

/// Delivers reminder messages to their owners.
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    async fn deliver(&self, reminder: &Reminder) -> Result<DeliveryOutcome, String>;

    /// Tell the owner a reminder was pushed back after too many escalations.
    async fn notify_auto_snoozed(
        &self,
        reminder: &Reminder,
        until: DateTime<Utc>,
    ) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub check_interval: Duration,
    pub max_escalations: u32,
    pub auto_snooze: TimeDelta,
    pub send_pause: Duration,
    pub batch_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&ReminderSettings::default())
    }
}

impl From<&ReminderSettings> for DispatchConfig {
    fn from(settings: &ReminderSettings) -> Self {
        Self {
            check_interval: Duration::from_secs(settings.check_interval_secs.max(1)),
            max_escalations: settings.max_escalations,
            auto_snooze: TimeDelta::try_days(settings.auto_snooze_days)
                .unwrap_or(TimeDelta::days(7)),
            send_pause: Duration::from_millis(settings.send_pause_ms),
            batch_limit: DISPATCH_BATCH_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub due: usize,
    pub delivered: usize,
    pub snoozed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Periodic reminder delivery with escalation.
///
/// A reminder is marked before it is sent, so a crash between the two loses
/// at most one message rather than repeating it.
pub struct ReminderDispatcher {
    store: Arc<dyn ReminderStore>,
    notifier: Arc<dyn ReminderNotifier>,
    config: DispatchConfig,
    events: Option<UnboundedSender<WorkerEvent>>,
}

impl ReminderDispatcher {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        notifier: Arc<dyn ReminderNotifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// One pass over every reminder due at `now`.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchSummary, StoreError> {
        let due = self
            .store
            .due_reminders(now, self.config.batch_limit)
            .await?;
        let mut summary = DispatchSummary {
            due: due.len(),
            ..DispatchSummary::default()
        };
        let duplicate_window = TimeDelta::from_std(self.config.check_interval).unwrap_or(TimeDelta::MAX);

        for reminder in due {
            if reminder
                .last_reminded_at
                .is_some_and(|last| now.signed_duration_since(last) < duplicate_window)
            {
                summary.duplicates += 1;
                continue;
            }

            if reminder.reminder_count >= self.config.max_escalations {
                self.auto_snooze(&reminder, now, &mut summary).await;
                continue;
            }

            if let Err(err) = self.store.mark_reminded(reminder.id, now).await {
                tracing::error!(reminder_id = reminder.id, error = %err, "failed to mark reminder");
                summary.failed += 1;
                continue;
            }

            match self.notifier.deliver(&reminder).await {
                Ok(DeliveryOutcome::Delivered) => {
                    if reminder.status == ReminderStatus::Pending {
                        self.set_status(&reminder, ReminderStatus::Sent, now, &mut summary)
                            .await;
                    }
                    summary.delivered += 1;
                    tracing::info!(
                        reminder_id = reminder.id,
                        entity_id = %reminder.entity_id,
                        count = reminder.reminder_count + 1,
                        "reminder delivered"
                    );
                }
                Ok(DeliveryOutcome::EntityGone) => {
                    self.set_status(&reminder, ReminderStatus::Skipped, now, &mut summary)
                        .await;
                    summary.skipped += 1;
                    tracing::info!(
                        reminder_id = reminder.id,
                        entity_id = %reminder.entity_id,
                        "entity gone; reminder skipped"
                    );
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(reminder_id = reminder.id, error = %err, "reminder delivery failed");
                }
            }

            if !self.config.send_pause.is_zero() {
                tokio::time::sleep(self.config.send_pause).await;
            }
        }

        if summary.due > 0 {
            tracing::info!(
                due = summary.due,
                delivered = summary.delivered,
                snoozed = summary.snoozed,
                skipped = summary.skipped,
                duplicates = summary.duplicates,
                failed = summary.failed,
                "reminder dispatch finished"
            );
        }
        Ok(summary)
    }

    async fn auto_snooze(
        &self,
        reminder: &Reminder,
        now: DateTime<Utc>,
        summary: &mut DispatchSummary,
    ) {
        let until = now
            .checked_add_signed(self.config.auto_snooze)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Err(err) = self.store.snooze(reminder.id, until, true, now).await {
            tracing::error!(reminder_id = reminder.id, error = %err, "failed to auto-snooze reminder");
            summary.failed += 1;
            return;
        }
        summary.snoozed += 1;
        tracing::info!(
            reminder_id = reminder.id,
            count = reminder.reminder_count,
            until = %until,
            "reminder auto-snoozed after max escalations"
        );
        if let Err(err) = self.notifier.notify_auto_snoozed(reminder, until).await {
            tracing::warn!(reminder_id = reminder.id, error = %err, "auto-snooze notice failed");
        }
    }

    async fn set_status(
        &self,
        reminder: &Reminder,
        status: ReminderStatus,
        now: DateTime<Utc>,
        summary: &mut DispatchSummary,
    ) {
        if let Err(err) = self.store.update_status(reminder.id, status, now).await {
            tracing::error!(
                reminder_id = reminder.id,
                status = %status,
                error = %err,
                "failed to update reminder status"
            );
            summary.failed += 1;
        }
    }

    /// Dispatch on every `check_interval` tick until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let worker = WorkerKind::ReminderScheduler;
        emit(&self.events, WorkerEvent::Started { worker, at: now_utc() });
        tracing::info!(
            interval_secs = self.config.check_interval.as_secs(),
            "reminder scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.dispatch_due(now_utc()).await {
                Ok(_) => emit(&self.events, WorkerEvent::Heartbeat { worker, at: now_utc() }),
                Err(err) => {
                    tracing::error!(error = %err, "reminder dispatch failed");
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
        }

        tracing::info!("reminder scheduler stopped");
        emit(&self.events, WorkerEvent::Stopped { worker, at: now_utc() });
    }
}
