//! Due-time arithmetic for backup frequencies.

use chrono::{DateTime, Duration, Months, Utc};

use crate::database::{BackupJob, Frequency};

impl Frequency {
    /// The run following one that started at `last_run`. Monthly steps by one
    /// calendar month, clamped to the end of shorter months.
    pub fn next_after(&self, last_run: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Frequency::Daily => last_run + Duration::days(1),
            Frequency::Weekly => last_run + Duration::weeks(1),
            Frequency::Monthly => last_run
                .checked_add_months(Months::new(1))
                .unwrap_or(last_run + Duration::days(30)),
        }
    }
}

/// Next-run for a job after its attempt started at `last_run`, or `None` for a
/// paused job.
pub fn next_run_for(
    frequency: Frequency,
    is_active: bool,
    last_run: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    is_active.then(|| frequency.next_after(last_run))
}

impl BackupJob {
    /// Whether the scheduler should select this job at `now`. Paused jobs are
    /// never due; an active job without a next-run has never been scheduled.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.next_run {
            Some(next_run) => next_run <= now,
            None => true,
        }
    }
}
