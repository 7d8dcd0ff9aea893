use crate::job::JobId;

/// Notifications a `JobManager` publishes to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A job was added, deleted or removed; `JobManager::job_list` changed.
    JobListChanged,
    /// The progress figures of a job changed.
    ProgressChanged {
        job_id: JobId,
        progress: f64,
        epoch_progress: f64,
    },
}
