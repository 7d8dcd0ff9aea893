//! The operation roster driven by the `JobManager`.
//!
//! Every operation is ticked round-robin by the worker loop through [`Operation::execute`]
//! and sees every verified incoming message through [`Operation::handle_message`]. Both
//! may run at the same time, so operations keep their state behind interior mutability.
//! Time-based operations use [`Schedule`], which reads the Tokio clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::computation::MergeResultsOperation;
use crate::error::{JobManagerError, Result};
use crate::event::JobEvent;
use crate::job::{Job, JobId};
use crate::manager::ManagerContext;
use crate::protocol::{Message, MessageBody};

#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Finished operations are dropped from the roster.
    fn is_finished(&self) -> bool {
        false
    }

    /// One non-blocking tick of time-based work.
    async fn execute(&self, _ctx: &Arc<ManagerContext>) -> Result<()> {
        Ok(())
    }

    async fn handle_message(&self, _ctx: &Arc<ManagerContext>, _message: &Message) -> Result<()> {
        Ok(())
    }
}

/// Interval gate for periodic operations.
pub struct Schedule {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Schedule {
    /// Due on the first tick.
    pub fn immediate(interval: Duration) -> Self {
        Schedule {
            interval,
            last: Mutex::new(None),
        }
    }

    /// First due one interval from now.
    pub fn delayed(interval: Duration) -> Self {
        Schedule {
            interval,
            last: Mutex::new(Some(Instant::now())),
        }
    }

    /// Returns `true` and restarts the interval when due.
    pub fn take_due(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last.map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Makes the next check due regardless of the interval.
    pub fn force(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Periodically announces the job list and every live job to all neighbours.
pub struct ShareJobListAndJobsOperation {
    schedule: Schedule,
}

impl ShareJobListAndJobsOperation {
    pub fn new(interval: Duration) -> Self {
        ShareJobListAndJobsOperation {
            schedule: Schedule::immediate(interval),
        }
    }
}

#[async_trait]
impl Operation for ShareJobListAndJobsOperation {
    fn name(&self) -> &'static str {
        "ShareJobListAndJobs"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if !self.schedule.take_due() {
            return Ok(());
        }
        debug!("sending job list and jobs to all neighbours");
        ctx.send_response_job_lists(None).await;
        ctx.send_live_jobs(None).await;
        Ok(())
    }
}

/// Periodically asks all neighbours for their job lists.
pub struct RequestJobListOperation {
    schedule: Schedule,
}

impl RequestJobListOperation {
    pub fn new(interval: Duration) -> Self {
        RequestJobListOperation {
            schedule: Schedule::delayed(interval),
        }
    }

    /// Requests on the next tick.
    pub fn force_execution(&self) {
        self.schedule.force();
    }
}

#[async_trait]
impl Operation for RequestJobListOperation {
    fn name(&self) -> &'static str {
        "RequestJobList"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if self.schedule.take_due() {
            debug!("requesting job lists from all neighbours");
            ctx.send_request_job_list(None).await?;
        }
        Ok(())
    }
}

/// Answers a job-list request with the list and every live job.
pub struct ResponseJobListOperation;

#[async_trait]
impl Operation for ResponseJobListOperation {
    fn name(&self) -> &'static str {
        "ResponseJobList"
    }

    async fn handle_message(&self, ctx: &Arc<ManagerContext>, message: &Message) -> Result<()> {
        if !matches!(message.body, MessageBody::RequestJobList) {
            return Ok(());
        }
        let peer = message.peer_id.as_ref();
        debug!(peer = ?peer.map(ToString::to_string), "answering job list request");
        ctx.send_response_job_lists(peer).await;
        ctx.send_live_jobs(peer).await;
        Ok(())
    }
}

/// Learns unknown jobs and deletions from announced job lists.
///
/// Payloads and epoch states are never taken from a job list.
pub struct HandleResponseJobListOperation;

#[async_trait]
impl Operation for HandleResponseJobListOperation {
    fn name(&self) -> &'static str {
        "HandleResponseJobList"
    }

    async fn handle_message(&self, ctx: &Arc<ManagerContext>, message: &Message) -> Result<()> {
        let MessageBody::ResponseJobList(jobs) = &message.body else {
            return Ok(());
        };
        let certificates = ctx.certificates.as_ref();
        let mut changed = false;
        for announced in jobs {
            if !announced.has_valid_creator_signature(certificates) {
                warn!(job_id = %announced.id(), sender = %message.header.sender_name, "dropping announced job with invalid creator signature");
                continue;
            }
            let mut announced = announced.listing_copy();
            announced.refresh_deletion_state(certificates);
            match ctx.jobs.entry(announced.id()) {
                Entry::Vacant(slot) => {
                    debug!(job_id = %announced.id(), "learned job from job list");
                    slot.insert(announced);
                    changed = true;
                }
                Entry::Occupied(mut local) => {
                    if announced.is_deleted()
                        && local
                            .get_mut()
                            .apply_deletion_signature(announced.deletion_signature(), certificates)
                    {
                        info!(job_id = %announced.id(), "🗑️ job deleted by peer");
                        changed = true;
                    }
                }
            }
        }
        if changed {
            ctx.on_job_list_changed();
        }
        Ok(())
    }
}

/// Requests the payload of every live job that has none, at most once per interval per job.
pub struct CheckJobsPayloadOperation {
    interval: Duration,
}

impl CheckJobsPayloadOperation {
    pub fn new(interval: Duration) -> Self {
        CheckJobsPayloadOperation { interval }
    }
}

#[async_trait]
impl Operation for CheckJobsPayloadOperation {
    fn name(&self) -> &'static str {
        "CheckJobsPayload"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        let now = Instant::now();
        let mut wanted: Vec<JobId> = Vec::new();
        for mut job in ctx.jobs.iter_mut() {
            let due = job
                .last_payload_request()
                .map_or(true, |at| now.duration_since(at) >= self.interval);
            if !job.has_payload() && !job.is_deleted() && due {
                job.mark_payload_requested(now);
                wanted.push(job.id());
            }
        }
        for job_id in wanted {
            debug!(job_id = %job_id, "requesting missing payload");
            ctx.send_request_job(None, job_id).await?;
        }
        Ok(())
    }
}

/// Answers a job request when the full job with its payload is known.
pub struct HandleRequestJobOperation;

#[async_trait]
impl Operation for HandleRequestJobOperation {
    fn name(&self) -> &'static str {
        "HandleRequestJob"
    }

    async fn handle_message(&self, ctx: &Arc<ManagerContext>, message: &Message) -> Result<()> {
        let MessageBody::RequestJob(job_id) = &message.body else {
            return Ok(());
        };
        let job = ctx
            .jobs
            .get(job_id)
            .filter(|job| job.has_payload())
            .map(|job| job.clone());
        if let Some(job) = job {
            debug!(job_id = %job_id, "answering job request");
            ctx.send_response_job(message.peer_id.as_ref(), job).await?;
        }
        Ok(())
    }
}

/// Integrates full job copies: new jobs, missing payloads, deletions and results.
pub struct HandleResponseJobOperation;

impl HandleResponseJobOperation {
    /// Returns `true` when the job was unknown and got inserted.
    fn insert_new(ctx: &ManagerContext, incoming: &Job, sender: &str) -> bool {
        let certificates = ctx.certificates.as_ref();
        if !incoming.has_valid_creator_signature(certificates) {
            warn!(job_id = %incoming.id(), sender, "dropping job with invalid creator signature");
            return false;
        }
        let mut job = incoming.clone();
        job.refresh_deletion_state(certificates);
        if job.has_payload() && !job.payload_matches_hash(certificates) {
            warn!(job_id = %job.id(), sender, "payload does not match its signed hash, dropping payload");
            job.strip_payload();
        }
        if let Some(err) = job.repair_epoch_state(ctx.config.max_bitmask_size) {
            warn!(job_id = %job.id(), sender, %err, "discarding epoch state that does not fit the job");
        }
        match ctx.jobs.entry(job.id()) {
            Entry::Vacant(slot) => {
                info!(job_id = %job.id(), name = job.name(), "📥 received new job");
                slot.insert(job);
                true
            }
            Entry::Occupied(_) => false,
        }
    }
}

#[async_trait]
impl Operation for HandleResponseJobOperation {
    fn name(&self) -> &'static str {
        "HandleResponseJob"
    }

    async fn handle_message(&self, ctx: &Arc<ManagerContext>, message: &Message) -> Result<()> {
        let MessageBody::ResponseJob(incoming) = &message.body else {
            return Ok(());
        };
        let certificates = ctx.certificates.as_ref();
        let job_id = incoming.id();
        let sender = message.header.sender_name.as_str();

        if !ctx.jobs.contains_key(&job_id) && Self::insert_new(ctx, incoming, sender) {
            ctx.on_job_list_changed();
            return Ok(());
        }

        let payload_candidate = incoming.has_payload() && incoming.has_valid_creator_signature(certificates);
        let mut deleted = false;
        let mut merge = None;
        if let Some(mut local) = ctx.jobs.get_mut(&job_id) {
            if !local.has_payload() && payload_candidate {
                if local.apply_incoming_payload(incoming.payload(), certificates) {
                    debug!(job_id = %job_id, "payload received");
                } else {
                    warn!(job_id = %job_id, sender, "received payload does not match the job's payload hash");
                }
            }
            if !local.is_deleted() && local.apply_deletion_signature(incoming.deletion_signature(), certificates) {
                info!(job_id = %job_id, "🗑️ job deleted by peer");
                deleted = true;
            }
            if let Some(remote) = incoming.epoch_state() {
                if local.epoch_state().is_none() {
                    if let Err(err) = local.adopt_epoch_state(remote, ctx.config.max_bitmask_size) {
                        warn!(job_id = %job_id, sender, %err, "ignoring epoch state that does not fit the job");
                    }
                } else {
                    merge = Some(remote.clone());
                }
            }
        }
        if let Some(remote) = merge {
            ctx.computation
                .enqueue_merge(MergeResultsOperation::new(
                    job_id,
                    remote,
                    ctx.jobs.clone(),
                    ctx.config.max_bitmask_size,
                ));
        }
        if deleted {
            ctx.on_job_list_changed();
        }
        Ok(())
    }
}

/// Periodically writes every job to storage; can be forced.
pub struct JobsSerializationOperation {
    schedule: Schedule,
}

impl JobsSerializationOperation {
    pub fn new(interval: Duration) -> Self {
        JobsSerializationOperation {
            schedule: Schedule::delayed(interval),
        }
    }

    pub fn force_serialization(&self) {
        self.schedule.force();
    }

    /// Writes every job now, returning how many were stored.
    pub fn serialize_all(ctx: &ManagerContext) -> usize {
        let snapshot: Vec<(String, std::result::Result<Vec<u8>, _>)> = ctx
            .jobs
            .iter()
            .map(|job| (job.id().file_name(), job.serialize()))
            .collect();
        let mut stored = 0;
        for (key, bytes) in snapshot {
            let written = bytes
                .map_err(|err| err.to_string())
                .and_then(|bytes| ctx.repository.save(&key, &bytes).map_err(|err| err.to_string()));
            match written {
                Ok(()) => stored += 1,
                Err(err) => error!(key = %key, %err, "job could not be serialized"),
            }
        }
        debug!(stored, "jobs serialized");
        stored
    }
}

#[async_trait]
impl Operation for JobsSerializationOperation {
    fn name(&self) -> &'static str {
        "JobsSerialization"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if self.schedule.take_due() {
            Self::serialize_all(ctx);
        }
        Ok(())
    }
}

/// Loads persisted jobs once at startup, discarding entries that fail verification.
#[derive(Default)]
pub struct JobsDeserializationOperation {
    done: AtomicBool,
}

impl JobsDeserializationOperation {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard(ctx: &ManagerContext, key: &str) {
        if let Err(err) = ctx.repository.delete(key) {
            error!(key, %err, "could not delete stored job");
        }
    }
}

#[async_trait]
impl Operation for JobsDeserializationOperation {
    fn name(&self) -> &'static str {
        "JobsDeserialization"
    }

    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stored = ctx
            .repository
            .load_all()
            .map_err(|err| JobManagerError::Storage(err.to_string()))?;
        let certificates = ctx.certificates.as_ref();
        let mut loaded = 0;
        for entry in stored {
            let mut job = match Job::deserialize(&entry.bytes) {
                Ok(job) => job,
                Err(err) => {
                    warn!(key = %entry.key, %err, "stored job is corrupt, deleting it");
                    Self::discard(ctx, &entry.key);
                    continue;
                }
            };
            if !job.has_valid_creator_signature(certificates) {
                warn!(key = %entry.key, "stored job has an invalid creator signature, deleting it");
                Self::discard(ctx, &entry.key);
                continue;
            }
            if job.has_payload() && !job.payload_matches_hash(certificates) {
                warn!(key = %entry.key, "stored job payload does not match its hash, deleting it");
                Self::discard(ctx, &entry.key);
                continue;
            }
            if let Some(err) = job.repair_epoch_state(ctx.config.max_bitmask_size) {
                warn!(key = %entry.key, %err, "stored epoch state does not fit the job, starting over");
            }
            job.refresh_deletion_state(certificates);
            ctx.jobs.insert(job.id(), job);
            loaded += 1;
        }
        info!(loaded, "📂 jobs loaded from storage");
        ctx.on_job_list_changed();
        Ok(())
    }
}

/// Recomputes progress of live jobs off the worker loop.
pub struct UpdateJobsProgressOperation {
    schedule: Schedule,
}

impl UpdateJobsProgressOperation {
    pub fn new(interval: Duration) -> Self {
        UpdateJobsProgressOperation {
            schedule: Schedule::immediate(interval),
        }
    }
}

#[async_trait]
impl Operation for UpdateJobsProgressOperation {
    fn name(&self) -> &'static str {
        "UpdateJobsProgress"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if !self.schedule.take_due() {
            return Ok(());
        }
        for job_id in ctx.job_list_ids() {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                let update = ctx.jobs.get_mut(&job_id).and_then(|mut job| {
                    job.update_progress()
                        .then(|| (job.progress().unwrap_or(0.0), job.epoch_progress().unwrap_or(0.0)))
                });
                if let Some((progress, epoch_progress)) = update {
                    ctx.emit(JobEvent::ProgressChanged {
                        job_id,
                        progress,
                        epoch_progress,
                    });
                }
            });
        }
        Ok(())
    }
}

/// Forgets deleted jobs once their deletion is older than the grace period.
pub struct HousekeepOldDeletedJobsOperation {
    schedule: Schedule,
    grace_period: Duration,
}

impl HousekeepOldDeletedJobsOperation {
    pub fn new(interval: Duration, grace_period: Duration) -> Self {
        HousekeepOldDeletedJobsOperation {
            schedule: Schedule::delayed(interval),
            grace_period,
        }
    }

    /// Removes expired deleted jobs from memory and storage, returning how many.
    pub fn housekeep(&self, ctx: &ManagerContext) -> usize {
        let grace = chrono::Duration::from_std(self.grace_period).ok();
        let now = Utc::now();
        let expired: Vec<JobId> = ctx
            .jobs
            .iter()
            .filter(|job| job.is_deleted())
            .filter(|job| match job.deletion_time() {
                Some(deleted_at) => grace
                    .and_then(|grace| deleted_at.checked_add_signed(grace))
                    .map_or(false, |until| until <= now),
                None => true,
            })
            .map(|job| job.id())
            .collect();
        for job_id in &expired {
            ctx.jobs.remove(job_id);
            if let Err(err) = ctx.repository.delete(&job_id.file_name()) {
                error!(job_id = %job_id, %err, "could not delete stored job");
            }
            info!(job_id = %job_id, "🧹 removed old deleted job");
        }
        if !expired.is_empty() {
            ctx.on_job_list_changed();
        }
        expired.len()
    }
}

#[async_trait]
impl Operation for HousekeepOldDeletedJobsOperation {
    fn name(&self) -> &'static str {
        "HousekeepOldDeletedJobs"
    }

    async fn execute(&self, ctx: &Arc<ManagerContext>) -> Result<()> {
        if self.schedule.take_due() {
            self.housekeep(ctx);
        }
        Ok(())
    }
}
