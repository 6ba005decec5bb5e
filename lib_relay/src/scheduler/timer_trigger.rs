//! # Timer Trigger
//!
//! Drives [`EventHubRelay::run_once`] from a cron schedule evaluated in UTC.
//! Each tick logs its timestamp, flags itself past due when it fires later
//! than the tick announced by the previous run, and runs one independent
//! cycle. A failed cycle is logged with its stage and never stops the
//! schedule.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobBuilder, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::ingestors::{CycleReport, EventHubRelay, RelayError};
use crate::utils::{current_utc_timestamp, time::format_utc};

/// How late a tick may fire before it counts as past due.
pub const PAST_DUE_TOLERANCE: Duration = Duration::from_secs(5);

/// Scheduler failures.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The cron expression was rejected.
    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule {
        /// The expression.
        schedule: String,
        /// Parser message.
        reason: String,
    },

    /// The scheduler itself failed.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// Timing of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    /// When the tick actually fired.
    pub fired_at: DateTime<Utc>,
    /// When the previous run said this tick was due, if known.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Fired more than [`PAST_DUE_TOLERANCE`] after `scheduled_for`.
    pub past_due: bool,
    /// The extra run made at startup.
    pub is_startup_run: bool,
}

impl TimerInfo {
    /// Timing of a scheduled tick.
    pub fn scheduled(
        fired_at: DateTime<Utc>,
        scheduled_for: Option<DateTime<Utc>>,
        tolerance: Duration,
    ) -> Self {
        let past_due = scheduled_for.is_some_and(|due| {
            (fired_at - due)
                .to_std()
                .map(|late| late > tolerance)
                .unwrap_or(false)
        });
        Self {
            fired_at,
            scheduled_for,
            past_due,
            is_startup_run: false,
        }
    }

    /// Timing of the startup run, which is never past due.
    pub fn startup(fired_at: DateTime<Utc>) -> Self {
        Self {
            fired_at,
            scheduled_for: None,
            past_due: false,
            is_startup_run: true,
        }
    }
}

/// Runs one relay cycle for a tick and logs the outcome.
pub async fn fire(relay: &EventHubRelay, timer: TimerInfo) -> Result<CycleReport, RelayError> {
    info!(
        "Timer trigger function ran at {}{}",
        format_utc(&timer.fired_at),
        if timer.is_startup_run { " (startup run)" } else { "" }
    );
    if timer.past_due {
        info!("The timer is past due!");
    }

    match relay.run_once().await {
        Ok(report) => {
            info!("Timer trigger function executed.");
            Ok(report)
        }
        Err(err) => {
            error!(
                stage = %err.stage(),
                "Relay cycle failed at the {} stage: {}",
                err.stage(),
                err
            );
            Err(err)
        }
    }
}

/// The running schedule.
pub struct TimerTrigger {
    scheduler: JobScheduler,
    startup_run: Option<JoinHandle<()>>,
}

impl TimerTrigger {
    /// Registers the relay on `schedule` (six or seven cron fields, UTC),
    /// starts the scheduler and, if asked, fires one extra cycle right away.
    pub async fn start(
        relay: Arc<EventHubRelay>,
        schedule: &str,
        run_on_startup: bool,
    ) -> Result<Self, TriggerError> {
        let scheduler = JobScheduler::new().await?;
        let next_due: Arc<Mutex<Option<DateTime<Utc>>>> = Arc::new(Mutex::new(None));

        let job = build_job(relay.clone(), schedule, next_due.clone())?;
        let job_id = scheduler.add(job).await?;

        let startup_run = run_on_startup.then(|| {
            let relay = relay.clone();
            tokio::spawn(async move {
                let _ = fire(&relay, TimerInfo::startup(current_utc_timestamp())).await;
            })
        });

        scheduler.start().await?;

        let mut lookup = scheduler.clone();
        match lookup.next_tick_for_job(job_id).await {
            Ok(Some(ts)) => {
                *next_due.lock().unwrap_or_else(PoisonError::into_inner) = Some(ts);
                info!("Timer trigger scheduled '{}' (UTC), first tick at {}", schedule, format_utc(&ts));
            }
            _ => warn!("Timer trigger scheduled '{}' but its first tick is unknown", schedule),
        }

        Ok(Self {
            scheduler,
            startup_run,
        })
    }

    /// Stops scheduling. Cycles already running are left to finish.
    pub async fn shutdown(mut self) -> Result<(), TriggerError> {
        if let Some(handle) = self.startup_run.take() {
            if !handle.is_finished() {
                info!("Startup cycle still running at shutdown");
            }
        }
        self.scheduler.shutdown().await?;
        info!("Timer trigger stopped");
        Ok(())
    }
}

fn build_job(
    relay: Arc<EventHubRelay>,
    schedule: &str,
    next_due: Arc<Mutex<Option<DateTime<Utc>>>>,
) -> Result<Job, TriggerError> {
    let builder = JobBuilder::new()
        .with_timezone(Utc)
        .with_cron_job_type()
        .with_schedule(schedule)
        .map_err(|err| TriggerError::InvalidSchedule {
            schedule: schedule.to_string(),
            reason: err.to_string(),
        })?;

    let job = builder
        .with_run_async(Box::new(move |uuid, mut l| {
            let relay = relay.clone();
            let next_due = next_due.clone();
            Box::pin(async move {
                let fired_at = current_utc_timestamp();
                let scheduled_for = *next_due.lock().unwrap_or_else(PoisonError::into_inner);

                // Announce the following tick for the next run's past-due check.
                match l.next_tick_for_job(uuid).await {
                    Ok(Some(ts)) if ts > fired_at => {
                        *next_due.lock().unwrap_or_else(PoisonError::into_inner) = Some(ts);
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Could not get next tick for the relay job: {}", err),
                }

                let timer = TimerInfo::scheduled(fired_at, scheduled_for, PAST_DUE_TOLERANCE);
                let _ = fire(&relay, timer).await;
            })
        }))
        .build()?;
    Ok(job)
}
