//! Hand-off point to the computation layer.
//!
//! The management layer never merges two epoch states itself when it already holds one:
//! it wraps the remote state in a [`MergeResultsOperation`] and passes it to a
//! [`ComputationLayer`], which runs the merge whenever it sees fit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::epoch::EpochState;
use crate::error::EpochError;
use crate::job::JobId;
use crate::manager::JobTable;

/// Receiver of merge requests.
pub trait ComputationLayer: Send + Sync {
    fn enqueue_merge(&self, operation: MergeResultsOperation);
}

/// Merge of a remote epoch state into the local copy of a job.
pub struct MergeResultsOperation {
    job_id: JobId,
    remote: EpochState,
    jobs: JobTable,
    max_mask_size: u32,
}

impl MergeResultsOperation {
    pub fn new(job_id: JobId, remote: EpochState, jobs: JobTable, max_mask_size: u32) -> Self {
        MergeResultsOperation {
            job_id,
            remote,
            jobs,
            max_mask_size,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Merges under the job's lock. Returns whether the local state changed; a job
    /// removed in the meantime is not an error, a state that does not fit the job is.
    pub fn execute(&self) -> Result<bool, EpochError> {
        let Some(mut job) = self.jobs.get_mut(&self.job_id) else {
            return Ok(false);
        };
        let changed = job.merge_epoch_state(&self.remote, self.max_mask_size)?;
        if changed {
            debug!(job_id = %self.job_id, calculated = %job.number_of_calculated_blocks(), "merged remote results");
        }
        Ok(changed)
    }
}

/// FIFO [`ComputationLayer`] drained by [`ComputationQueue::run_pending`] or a
/// background task started with [`ComputationQueue::spawn`].
#[derive(Default)]
pub struct ComputationQueue {
    operations: Mutex<VecDeque<MergeResultsOperation>>,
}

impl ComputationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Executes every queued merge, returning how many changed a job.
    pub fn run_pending(&self) -> usize {
        let drained: Vec<_> = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut changed = 0;
        for operation in drained {
            match operation.execute() {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %operation.job_id(), %err, "dropping unmergeable epoch state"),
            }
        }
        changed
    }

    /// Drains the queue every `interval` until `shutdown` turns `true`.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_pending();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            self.run_pending();
        })
    }
}

impl ComputationLayer for ComputationQueue {
    fn enqueue_merge(&self, operation: MergeResultsOperation) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use dashmap::DashMap;

    fn table_with_job(blocks: u128) -> (JobTable, JobId) {
        let jobs: JobTable = Arc::new(DashMap::new());
        let id = JobId(1);
        let mut job = Job::new(id).with_number_of_blocks(blocks);
        job.init_epoch_state(16384);
        jobs.insert(id, job);
        (jobs, id)
    }

    #[test]
    fn test_queue_runs_merges() {
        let (jobs, id) = table_with_job(16);
        let queue = ComputationQueue::new();
        let mut remote = jobs.get(&id).unwrap().epoch_state().unwrap().clone();
        remote.bitmask.set_bit(3).unwrap();
        remote.bitmask.set_bit(4).unwrap();
        queue.enqueue_merge(MergeResultsOperation::new(id, remote.clone(), jobs.clone(), 16384));
        queue.enqueue_merge(MergeResultsOperation::new(id, remote, jobs.clone(), 16384));
        assert_eq!(queue.pending(), 2);
        // the second merge is a no-op
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(queue.pending(), 0);
        assert_eq!(jobs.get(&id).unwrap().number_of_calculated_blocks(), 2);
    }

    #[test]
    fn test_merge_of_missing_job_is_ignored() {
        let (jobs, _) = table_with_job(16);
        let operation = MergeResultsOperation::new(JobId(99), EpochState::new(2), jobs, 16384);
        assert_eq!(operation.execute(), Ok(false));
    }

    #[test]
    fn test_mismatched_merge_is_dropped() {
        let (jobs, id) = table_with_job(16);
        let queue = ComputationQueue::new();
        queue.enqueue_merge(MergeResultsOperation::new(id, EpochState::new(7), jobs.clone(), 16384));
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(jobs.get(&id).unwrap().number_of_calculated_blocks(), 0);

        let mut beyond = EpochState::new(2);
        beyond.epoch_number = 1 << 125;
        let operation = MergeResultsOperation::new(id, beyond, jobs.clone(), 16384);
        assert_eq!(
            operation.execute(),
            Err(EpochError::EpochOutOfRange { epoch: 1 << 125, epochs: 1 })
        );
        assert_eq!(jobs.get(&id).unwrap().epoch_state().unwrap().epoch_number, 0);
    }

    #[tokio::test]
    async fn test_spawned_queue_drains_on_shutdown() {
        let (jobs, id) = table_with_job(16);
        let queue = Arc::new(ComputationQueue::new());
        let (tx, rx) = watch::channel(false);
        let handle = queue.clone().spawn(Duration::from_secs(3600), rx);
        let mut remote = EpochState::new(2);
        remote.bitmask.set_bit(0).unwrap();
        queue.enqueue_merge(MergeResultsOperation::new(id, remote, jobs.clone(), 16384));
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(jobs.get(&id).unwrap().number_of_calculated_blocks(), 1);
    }
}
