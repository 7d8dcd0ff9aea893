use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::certificate::{CertificateService, ValidationState};
use crate::computation::ComputationLayer;
use crate::config::ManagementConfig;
use crate::constants::ANONYMOUS_NAME;
use crate::epoch::EpochState;
use crate::error::{JobManagerError, Result};
use crate::event::JobEvent;
use crate::job::{Job, JobId};
use crate::network::{ConnectionManager, PeerId};
use crate::operations::*;
use crate::protocol::{Message, MessageBody};
use crate::repository::{FileJobRepository, JobRepository};

/// Every job known to a peer, keyed by id. An entry's write guard is the job's lock.
pub type JobTable = Arc<DashMap<JobId, Job>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared by the `JobManager`, its loops and every operation.
pub struct ManagerContext {
    pub config: ManagementConfig,
    pub certificates: Arc<dyn CertificateService>,
    pub connection: Arc<dyn ConnectionManager>,
    pub computation: Arc<dyn ComputationLayer>,
    pub repository: Arc<dyn JobRepository>,
    pub jobs: JobTable,
    job_list: RwLock<Vec<JobId>>,
    events: broadcast::Sender<JobEvent>,
    running: AtomicBool,
}

impl ManagerContext {
    pub fn new(
        config: ManagementConfig,
        certificates: Arc<dyn CertificateService>,
        connection: Arc<dyn ConnectionManager>,
        computation: Arc<dyn ComputationLayer>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ManagerContext {
            config: config.with_bounded_limits(),
            certificates,
            connection,
            computation,
            repository,
            jobs: Arc::new(DashMap::new()),
            job_list: RwLock::new(Vec::new()),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Rebuilds the public job list and notifies subscribers.
    ///
    /// Must not be called while holding a guard into `jobs`.
    pub fn on_job_list_changed(&self) {
        let mut live: Vec<(chrono::DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|job| !job.is_deleted())
            .map(|job| (job.creation_date(), job.id()))
            .collect();
        live.sort_by(|a, b| b.cmp(a));
        *self.job_list.write().unwrap_or_else(PoisonError::into_inner) =
            live.into_iter().map(|(_, id)| id).collect();
        self.emit(JobEvent::JobListChanged);
    }

    /// Ids of the live jobs, newest first.
    pub fn job_list_ids(&self) -> Vec<JobId> {
        self.job_list.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Snapshots of the live jobs, newest first.
    pub fn job_list(&self) -> Vec<Job> {
        self.job_list_ids()
            .iter()
            .filter_map(|id| self.jobs.get(id).map(|job| job.clone()))
            .collect()
    }

    pub fn emit(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signs and sends `body`. Management messages leave the header's world name empty.
    async fn send(&self, body: MessageBody, peer: Option<&PeerId>) -> Result<()> {
        let mut message = Message::new(body)?;
        message.sign(self.certificates.as_ref())?;
        let bytes = message.to_bytes()?;
        self.connection.send_data(bytes, peer).await?;
        Ok(())
    }

    pub async fn send_request_job_list(&self, peer: Option<&PeerId>) -> Result<()> {
        self.send(MessageBody::RequestJobList, peer).await
    }

    /// Announces every known job, deleted ones included, without payloads and epoch
    /// states, in batches of `job_list_batch_size`. Nothing is sent without jobs.
    ///
    /// A batch that cannot be sent is logged and the remaining batches still go out.
    pub async fn send_response_job_lists(&self, peer: Option<&PeerId>) {
        let listings: Vec<Job> = self.jobs.iter().map(|job| job.listing_copy()).collect();
        for batch in listings.chunks(self.config.job_list_batch_size.max(1)) {
            debug!(jobs = batch.len(), "sending job list");
            if let Err(err) = self.send(MessageBody::ResponseJobList(batch.to_vec()), peer).await {
                warn!(jobs = batch.len(), %err, "could not send job list batch");
            }
        }
    }

    /// Sends the full copy of every live job; a job that cannot be sent is logged and
    /// skipped.
    pub async fn send_live_jobs(&self, peer: Option<&PeerId>) {
        for job in self.job_list() {
            let job_id = job.id();
            debug!(job_id = %job_id, "sending job");
            if let Err(err) = self.send_response_job(peer, job).await {
                warn!(job_id = %job_id, %err, "could not send job");
            }
        }
    }

    pub async fn send_request_job(&self, peer: Option<&PeerId>, job_id: JobId) -> Result<()> {
        self.send(MessageBody::RequestJob(job_id), peer).await
    }

    pub async fn send_response_job(&self, peer: Option<&PeerId>, job: Job) -> Result<()> {
        self.send(MessageBody::ResponseJob(Box::new(job)), peer).await
    }

    /// Hands `message` to every operation, isolating failures of each one.
    pub async fn dispatch(self: &Arc<Self>, operations: Vec<Arc<dyn Operation>>, message: Message) {
        for operation in operations {
            match AssertUnwindSafe(operation.handle_message(self, &message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(operation = operation.name(), message_type = %message.message_type(), %err, "operation failed to handle message")
                }
                Err(_) => {
                    error!(operation = operation.name(), message_type = %message.message_type(), "operation panicked while handling message")
                }
            }
        }
    }
}

/// Coordinates the jobs of one peer: keeps the job table, runs the operation roster and
/// talks to other peers through a [`ConnectionManager`].
///
/// # Fields
///
/// * `context` - State shared with the loops and the operations.
/// * `operations` - Round-robin queue of operations ticked by the worker loop.
/// * `request_job_list` - Handle on the roster's list request, forced on connectivity changes.
/// * `serialization` - Handle on the roster's serializer, forced after local changes.
/// * `shutdown` - Signals the background tasks to end.
/// * `tasks` - Receive loop, worker loop and connection watcher while running.
///
/// # Examples
///
/// ```ignore
/// let manager = JobManager::with_file_storage(config, certificates, connection, computation);
/// manager.start()?;
/// let job_id = manager.create_job("world", "type", "name", "description", payload, 1000).await?;
/// manager.stop().await;
/// ```
pub struct JobManager {
    context: Arc<ManagerContext>,
    operations: Arc<Mutex<VecDeque<Arc<dyn Operation>>>>,
    request_job_list: Arc<RequestJobListOperation>,
    serialization: Arc<JobsSerializationOperation>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Creates a stopped `JobManager` with the default operation roster.
    ///
    /// # Arguments
    ///
    /// * `config` - Intervals, limits and storage location.
    /// * `certificates` - Identity and verification service.
    /// * `connection` - Transport to the other peers.
    /// * `computation` - Receiver of epoch-state merges.
    /// * `repository` - Storage for persisted jobs.
    pub fn new(
        config: ManagementConfig,
        certificates: Arc<dyn CertificateService>,
        connection: Arc<dyn ConnectionManager>,
        computation: Arc<dyn ComputationLayer>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        let request_job_list = Arc::new(RequestJobListOperation::new(config.request_job_list_interval()));
        let serialization = Arc::new(JobsSerializationOperation::new(config.serialization_interval()));
        let roster: Vec<Arc<dyn Operation>> = vec![
            Arc::new(JobsDeserializationOperation::new()),
            Arc::new(ShareJobListAndJobsOperation::new(config.share_interval())),
            request_job_list.clone(),
            Arc::new(ResponseJobListOperation),
            Arc::new(HandleResponseJobListOperation),
            Arc::new(CheckJobsPayloadOperation::new(config.payload_request_interval())),
            Arc::new(HandleRequestJobOperation),
            Arc::new(HandleResponseJobOperation),
            serialization.clone(),
            Arc::new(UpdateJobsProgressOperation::new(config.progress_update_interval())),
            Arc::new(HousekeepOldDeletedJobsOperation::new(
                config.housekeeping_interval(),
                config.deletion_grace_period(),
            )),
        ];
        let (shutdown, _) = watch::channel(false);
        JobManager {
            context: Arc::new(ManagerContext::new(config, certificates, connection, computation, repository)),
            operations: Arc::new(Mutex::new(roster.into())),
            request_job_list,
            serialization,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Creates a `JobManager` persisting jobs to `config.storage_path`.
    pub fn with_file_storage(
        config: ManagementConfig,
        certificates: Arc<dyn CertificateService>,
        connection: Arc<dyn ConnectionManager>,
        computation: Arc<dyn ComputationLayer>,
    ) -> Self {
        let repository = Arc::new(FileJobRepository::new(config.storage_path.clone()));
        Self::new(config, certificates, connection, computation, repository)
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Starts the receive loop, the worker loop and the connection watcher.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Returns
    ///
    /// `JobManagerError::AlreadyRunning` if the manager was started before and not stopped.
    pub fn start(&self) -> Result<()> {
        if self.context.running.swap(true, Ordering::SeqCst) {
            return Err(JobManagerError::AlreadyRunning);
        }
        self.shutdown.send_replace(false);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(self.spawn_receive_loop());
        tasks.push(self.spawn_worker_loop());
        tasks.push(self.spawn_connection_watcher());
        info!(peer = self.context.certificates.own_name(), "🚀 job manager started");
        Ok(())
    }

    fn spawn_receive_loop(&self) -> JoinHandle<()> {
        let ctx = self.context.clone();
        let operations = self.operations.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    data = ctx.connection.receive_data() => data,
                    _ = shutdown.changed() => break,
                };
                let Some(data) = data else {
                    error!("transport closed, receive loop ends");
                    break;
                };
                let mut message = match Message::from_bytes(&data.payload) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(peer = %data.peer_id, %err, "dropping malformed message");
                        continue;
                    }
                };
                let validity = ctx.certificates.verify_message(&message);
                if validity != ValidationState::Valid {
                    warn!(peer = %data.peer_id, sender = %message.header.sender_name, ?validity, "dropping message with invalid signature");
                    continue;
                }
                debug!(peer = %data.peer_id, message_type = %message.message_type(), "message received");
                message.peer_id = Some(data.peer_id);
                let snapshot: Vec<Arc<dyn Operation>> = operations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect();
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.dispatch(snapshot, message).await });
            }
            debug!("receive loop stopped");
        })
    }

    fn spawn_worker_loop(&self) -> JoinHandle<()> {
        let ctx = self.context.clone();
        let operations = self.operations.clone();
        let mut shutdown = self.shutdown.subscribe();
        let sleep = ctx.config.worker_sleep();
        tokio::spawn(async move {
            while ctx.is_running() {
                let next = {
                    let mut queue = operations.lock().unwrap_or_else(PoisonError::into_inner);
                    let next = queue.pop_front();
                    if let Some(operation) = &next {
                        if operation.is_finished() {
                            debug!(operation = operation.name(), "operation finished");
                        } else {
                            queue.push_back(operation.clone());
                        }
                    }
                    next
                };
                if let Some(operation) = next.filter(|operation| !operation.is_finished()) {
                    match AssertUnwindSafe(operation.execute(&ctx)).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(operation = operation.name(), %err, "operation failed"),
                        Err(_) => error!(operation = operation.name(), "operation panicked"),
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = shutdown.changed() => break,
                }
            }
            debug!("worker loop stopped");
        })
    }

    fn spawn_connection_watcher(&self) -> JoinHandle<()> {
        let request_job_list = self.request_job_list.clone();
        let mut changes = self.context.connection.subscribe_connection_changes();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(connections) => {
                            debug!(connections, "connections changed, refreshing job list");
                            request_job_list.force_execution();
                        }
                        Err(RecvError::Lagged(_)) => request_job_list.force_execution(),
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stops all background tasks and writes every job to storage one last time.
    ///
    /// Tasks that do not end within `shutdown_timeout` are aborted. Stopping a stopped
    /// manager does nothing.
    pub async fn stop(&self) {
        if !self.context.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let timeout = self.context.config.shutdown_timeout();
        for mut task in tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(%err, "background task terminated abnormally"),
                Err(_) => {
                    warn!("background task did not stop in time, aborting it");
                    task.abort();
                }
            }
        }
        JobsSerializationOperation::serialize_all(&self.context);
        info!(peer = self.context.certificates.own_name(), "🛑 job manager stopped");
    }

    /// Creates, signs and broadcasts a new job.
    ///
    /// # Arguments
    ///
    /// * `world_name` - The world the job belongs to.
    /// * `job_type` - Application-defined kind of job.
    /// * `name` - Display name.
    /// * `description` - Free text.
    /// * `payload` - Application data; at most `max_job_payload_size` bytes.
    /// * `number_of_blocks` - Total work units; must be positive.
    ///
    /// # Returns
    ///
    /// The new job's id. The local identity must not be anonymous.
    pub async fn create_job(
        &self,
        world_name: &str,
        job_type: &str,
        name: &str,
        description: &str,
        payload: Vec<u8>,
        number_of_blocks: u128,
    ) -> Result<JobId> {
        let ctx = &self.context;
        let certificates = ctx.certificates.as_ref();
        if certificates.own_name().eq_ignore_ascii_case(ANONYMOUS_NAME) {
            return Err(JobManagerError::AnonymousCreator);
        }
        let max = ctx.config.max_job_payload_size;
        if payload.len() > max {
            return Err(JobManagerError::PayloadTooLarge {
                max,
                actual: payload.len(),
            });
        }
        if number_of_blocks == 0 {
            return Err(JobManagerError::InvalidNumberOfBlocks);
        }

        let job_id = JobId::random();
        let mut job = Job::new(job_id)
            .with_name(name)
            .with_job_type(job_type)
            .with_description(description)
            .with_world_name(world_name)
            .with_creator_name(certificates.own_name())
            .with_number_of_blocks(number_of_blocks)
            .with_creation_date(Utc::now())
            .with_creator_certificate(certificates.own_certificate());
        job.attach_payload(payload, certificates);
        job.generate_creator_signature(certificates)?;
        job.init_epoch_state(ctx.config.max_bitmask_size);
        // storable and sendable, or not created at all
        job.serialize()?;
        Message::new(MessageBody::ResponseJob(Box::new(job.clone())))?;

        match ctx.jobs.entry(job_id) {
            Entry::Occupied(_) => return Err(JobManagerError::DuplicateJobId(job_id)),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }
        info!(job_id = %job_id, name, number_of_blocks = %number_of_blocks, "✨ job created");
        self.serialization.force_serialization();
        ctx.on_job_list_changed();
        if let Err(err) = ctx.send_response_job(None, job).await {
            warn!(job_id = %job_id, %err, "new job could not be broadcast");
        }
        Ok(job_id)
    }

    /// Deletes a job as its creator or as an administrator and broadcasts the deletion.
    ///
    /// # Returns
    ///
    /// `UnknownJob` or `NotAuthorized` without touching the job. Deleting a deleted job
    /// succeeds without doing anything.
    pub async fn delete_job(&self, job_id: JobId) -> Result<()> {
        let ctx = &self.context;
        let job = {
            let mut job = ctx.jobs.get_mut(&job_id).ok_or(JobManagerError::UnknownJob(job_id))?;
            if job.is_deleted() {
                return Ok(());
            }
            job.generate_deletion_signature(ctx.certificates.as_ref())?;
            job.clone()
        };
        info!(job_id = %job_id, "🗑️ job deleted");
        self.serialization.force_serialization();
        ctx.on_job_list_changed();
        if let Err(err) = ctx.send_response_job(None, job).await {
            warn!(job_id = %job_id, %err, "deletion could not be broadcast");
        }
        Ok(())
    }

    /// Asks all neighbours for the full copy of a job.
    pub async fn request_job(&self, job_id: JobId) -> Result<()> {
        self.context.send_request_job(None, job_id).await
    }

    pub fn get_job_by_id(&self, job_id: JobId) -> Option<Job> {
        self.context.jobs.get(&job_id).map(|job| job.clone())
    }

    /// Live jobs, newest first.
    pub fn job_list(&self) -> Vec<Job> {
        self.context.job_list()
    }

    /// Requests the job lists of all neighbours on the next worker tick.
    pub fn refresh_job_list(&self) {
        self.request_job_list.force_execution();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.context.subscribe()
    }

    /// Number of calculated blocks, 0 for unknown jobs.
    pub fn calculated_blocks_of_job(&self, job_id: JobId) -> u128 {
        self.context
            .jobs
            .get(&job_id)
            .map(|job| job.number_of_calculated_blocks())
            .unwrap_or(0)
    }

    pub fn state_of_job(&self, job_id: JobId) -> Option<EpochState> {
        self.context.jobs.get(&job_id).and_then(|job| job.epoch_state().cloned())
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.context.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}
