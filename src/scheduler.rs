//! Periodic due-job scan driven by tokio-cron-scheduler.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, error, info};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::database::{EventCategory, EventLevel};
use crate::pipeline::{Pipeline, RunError, Started};
use crate::repository::events::{self, NewEvent};
use crate::repository::{jobs, users};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid tick expression: {0}")]
    Tick(#[from] cron::error::Error),

    #[error(transparent)]
    Scheduler(#[from] JobSchedulerError),
}

/// Starts every active job that is due at `now` and not already running.
/// Due-ness is checked again under each job's run-lock, so a job paused or
/// run since the scan is skipped. Each accepted job runs in its own task.
pub async fn dispatch_due(
    pipeline: &Pipeline,
    now: DateTime<Utc>,
) -> Result<Vec<Started>, sqlx::Error> {
    let due: Vec<_> = jobs::list_active(pipeline.pool())
        .await?
        .into_iter()
        .filter(|job| job.is_due(now))
        .collect();

    let mut started = Vec::with_capacity(due.len());
    for job in due {
        if pipeline.locks().is_running(job.id) {
            debug!("Job {} is due but still running, skipping", job.id);
            continue;
        }
        match pipeline.start_if_due(job.id, now).await {
            Ok(Some(run)) => started.push(run),
            Ok(None) => {}
            Err(RunError::InFlight(_)) => {
                debug!("Job {} was started elsewhere, skipping", job.id)
            }
            Err(RunError::NotFound(_)) => {
                debug!("Job {} disappeared before it could start", job.id)
            }
            Err(e) => {
                events::record(
                    pipeline.pool(),
                    NewEvent::new(
                        EventLevel::Error,
                        EventCategory::Scheduler,
                        format!("Could not start job {}: {}", job.id, e),
                    )
                    .job(job.id),
                )
                .await;
            }
        }
    }
    if !started.is_empty() {
        info!("Scheduler started {} backup jobs", started.len());
    }
    Ok(started)
}

/// One scheduler tick: start due jobs and drop expired sessions.
pub async fn tick(pipeline: &Pipeline) {
    let now = Utc::now();
    if let Err(e) = dispatch_due(pipeline, now).await {
        events::record(
            pipeline.pool(),
            NewEvent::new(
                EventLevel::Error,
                EventCategory::Scheduler,
                format!("Due-job scan failed: {}", e),
            ),
        )
        .await;
    }
    match users::purge_expired_sessions(pipeline.pool(), now).await {
        Ok(0) => {}
        Ok(count) => debug!("Purged {} expired sessions", count),
        Err(e) => error!("Could not purge expired sessions: {}", e),
    }
}

/// Registers the tick on a new scheduler and starts it.
pub async fn start(
    pipeline: Pipeline,
    tick_expression: &str,
) -> Result<JobScheduler, SchedulerError> {
    let schedule = Schedule::from_str(tick_expression)?;
    let sched = JobScheduler::new().await?;
    let job = Job::new_async(schedule, move |_uuid, _l| {
        let pipeline = pipeline.clone();

        Box::pin(async move {
            tick(&pipeline).await;
        })
    })?;
    sched.add(job).await?;
    sched.start().await?;
    info!("Scheduler running on '{}'", tick_expression);
    Ok(sched)
}
