//! Deferred dispatch of scheduled emails.
//!
//! A poll picks due `pending` records, sends them through the [`SendEngine`]
//! and writes the outcome back only if the record is still pending.

pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::SchedulerConfig;
use crate::db::{scheduled_repo, Database};
use crate::error::{EngineError, Result};
use crate::send::{SendEngine, SendProgress, SendReport, SlotChoice};

pub use queue::{
    resolve_send_at, ScheduleRequest, ScheduledEmail, ScheduledPage, ScheduledQueue,
    ScheduledStatus,
};

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub picked: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes dropped because the record was deleted or finished meanwhile.
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Sent { note: Option<String> },
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Sent,
    Retried,
    Failed,
    Discarded,
}

fn outcome_of_report(report: &SendReport) -> Outcome {
    if !report.accepted.is_empty() {
        return Outcome::Sent {
            note: report.rejection_summary(),
        };
    }
    let summary = report
        .rejection_summary()
        .unwrap_or_else(|| "no recipient accepted".to_string());
    if report.reauth_required || report.all_permanent() {
        Outcome::Permanent(summary)
    } else {
        Outcome::Transient(summary)
    }
}

fn outcome_of_error(e: &EngineError) -> Outcome {
    let message = format!("{}: {}", e.kind(), e);
    if e.is_transient() {
        Outcome::Transient(message)
    } else {
        Outcome::Permanent(message)
    }
}

/// Recipients delivered before the timeout must not be sent again, so any
/// delivery makes the record `sent`.
fn outcome_of_timeout(
    timeout: std::time::Duration,
    progress: &SendProgress,
    recipients: &[String],
) -> Outcome {
    let reason = format!("TimedOut: dispatch exceeded {}s", timeout.as_secs());
    if progress.delivered().is_empty() {
        return Outcome::Transient(reason);
    }
    Outcome::Sent {
        note: Some(format!(
            "{}; not delivered: {}",
            reason,
            progress.undelivered(recipients).join(", ")
        )),
    }
}

pub struct Scheduler {
    db: Database,
    engine: Arc<SendEngine>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(db: Database, engine: Arc<SendEngine>, config: SchedulerConfig) -> Self {
        let (trigger, _) = broadcast::channel(16);
        Self {
            db,
            engine,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger,
        }
    }

    /// Dispatches every due record once.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let due = scheduled_repo::due(&self.db, now, self.config.batch_size)?;
        let mut summary = PollSummary {
            picked: due.len(),
            ..PollSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }
        tracing::debug!(picked = due.len(), "Dispatching due scheduled emails");

        let results: Vec<Result<Applied>> = stream::iter(due)
            .map(|email| {
                let span = tracing::info_span!("dispatch", id = %email.id, attempts = email.attempts);
                self.dispatch(email, now).instrument(span)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(Applied::Sent) => summary.sent += 1,
                Ok(Applied::Retried) => summary.retried += 1,
                Ok(Applied::Failed) => summary.failed += 1,
                Ok(Applied::Discarded) => summary.discarded += 1,
                Err(e) => {
                    // The record stays pending and is picked up again next poll.
                    tracing::error!(error = %e, "Failed to record dispatch outcome");
                }
            }
        }

        tracing::info!(
            picked = summary.picked,
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            discarded = summary.discarded,
            "Scheduler poll finished"
        );
        Ok(summary)
    }

    async fn dispatch(&self, email: ScheduledEmail, now: DateTime<Utc>) -> Result<Applied> {
        let choice = SlotChoice::from(email.slot_id.clone());
        let timeout = self.config.dispatch_timeout();
        let progress = SendProgress::default();
        let outcome = match tokio::time::timeout(
            timeout,
            self.engine
                .send_tracked(&email.account_id, &email.message, choice, &progress),
        )
        .await
        {
            Ok(Ok(report)) => outcome_of_report(&report),
            Ok(Err(e)) => outcome_of_error(&e),
            Err(_) => outcome_of_timeout(timeout, &progress, &email.message.to),
        };

        self.apply(&email, outcome, now)
    }

    /// A transient failure is retried while the attempts made before this
    /// dispatch are below `max_attempts`, so every backoff step is used. The
    /// stored count stops growing at `max_attempts`.
    fn apply(&self, email: &ScheduledEmail, outcome: Outcome, now: DateTime<Utc>) -> Result<Applied> {
        let max_attempts = self.config.max_attempts;
        let attempts = (email.attempts + 1).min(max_attempts.max(email.attempts));
        let (written, applied) = match outcome {
            Outcome::Sent { note } => (
                scheduled_repo::mark_sent(&self.db, &email.id, attempts, note.as_deref(), now)?,
                Applied::Sent,
            ),
            Outcome::Transient(error) if email.attempts < max_attempts => {
                let retry_at = now + self.config.backoff_for(attempts);
                tracing::info!(id = %email.id, attempts, %retry_at, error = %error, "Dispatch failed, will retry");
                (
                    scheduled_repo::reschedule(&self.db, &email.id, attempts, retry_at, &error, now)?,
                    Applied::Retried,
                )
            }
            Outcome::Transient(error) | Outcome::Permanent(error) => {
                tracing::warn!(id = %email.id, attempts, error = %error, "Scheduled email failed");
                (
                    scheduled_repo::mark_failed(&self.db, &email.id, attempts, &error, now)?,
                    Applied::Failed,
                )
            }
        };

        if !written {
            tracing::info!(id = %email.id, "Scheduled email changed during dispatch, outcome discarded");
            return Ok(Applied::Discarded);
        }
        Ok(applied)
    }

    /// Starts the poll loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut trigger_rx = self.trigger.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.poll_interval());
            tracing::info!(
                interval_secs = scheduler.config.poll_interval_secs,
                "Scheduler started"
            );

            loop {
                if scheduler.shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {},
                    Ok(()) = trigger_rx.recv() => {
                        tracing::debug!("Manual poll triggered");
                    },
                }

                if scheduler.shutdown.load(Ordering::Acquire) {
                    break;
                }

                if let Err(e) = scheduler.run_once(Utc::now()).await {
                    tracing::error!(error = %e, "Scheduler poll failed");
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }

    /// Requests an immediate poll.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    /// Signals the loop to stop after the current poll.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.trigger.send(());
    }
}
