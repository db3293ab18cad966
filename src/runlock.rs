//! Per-job run-lock. Scheduled runs and run-now both acquire the lock of a
//! job before touching it; the holder gets a cancellation token that pause
//! and delete trigger.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default, Debug)]
pub struct RunLocks {
    held: Arc<DashMap<i64, CancellationToken>>,
}

/// Held for the duration of one attempt; releases the job on drop.
#[derive(Debug)]
pub struct RunGuard {
    job_id: i64,
    token: CancellationToken,
    held: Arc<DashMap<i64, CancellationToken>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `job_id`, or `None` while another attempt holds it.
    pub fn try_acquire(&self, job_id: i64) -> Option<RunGuard> {
        match self.held.entry(job_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(RunGuard {
                    job_id,
                    token,
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_running(&self, job_id: i64) -> bool {
        self.held.contains_key(&job_id)
    }

    /// Signals the in-flight attempt of the job, if any. Returns whether one
    /// was running.
    pub fn cancel(&self, job_id: i64) -> bool {
        match self.held.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> Vec<i64> {
        self.held.iter().map(|entry| *entry.key()).collect()
    }
}

impl RunGuard {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // The slot cannot be re-acquired while this guard lives, so it is ours.
        self.held.remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let locks = RunLocks::new();
        let guard = locks.try_acquire(1).unwrap();
        assert!(locks.try_acquire(1).is_none());
        assert!(locks.try_acquire(2).is_some());
        assert!(locks.is_running(1));

        drop(guard);
        assert!(!locks.is_running(1));
        assert!(locks.try_acquire(1).is_some());
    }

    #[test]
    fn test_cancel_reaches_holder() {
        let locks = RunLocks::new();
        let guard = locks.try_acquire(7).unwrap();
        assert!(!guard.token().is_cancelled());

        assert!(locks.cancel(7));
        assert!(guard.token().is_cancelled());
        assert!(!locks.cancel(8));
        assert_eq!(locks.running(), vec![7]);
    }
}
