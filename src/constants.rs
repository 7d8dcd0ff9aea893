/// Magic number opening every management-layer frame.
pub const MESSAGE_MAGIC: &[u8; 10] = b"VLIB2MNGMT";

/// Highest management protocol version this build understands.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of the random message id carried in every header.
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Maximum character length of world and sender names in message headers.
pub const MESSAGE_STRING_MAX_LENGTH: usize = 255;

/// Maximum character length of job name, type, world and creator.
pub const JOB_STRING_MAX_LENGTH: usize = 255;

/// Maximum character length of a job description.
pub const JOB_DESCRIPTION_MAX_LENGTH: usize = 1024;

/// Subject name of the anonymous identity; it may neither create nor sign jobs.
pub const ANONYMOUS_NAME: &str = "anonymous";

/// Largest payload a job may carry; the payload field has a 16-bit length prefix.
pub const MAX_JOB_PAYLOAD_SIZE: usize = 32 * 1024;

/// Largest epoch bitmask in bytes; the epoch state field has a 16-bit length prefix.
pub const MAX_BITMASK_SIZE: u32 = 32 * 1024;

pub const DEFAULT_MAX_JOB_PAYLOAD_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_BITMASK_SIZE: u32 = 16 * 1024;
pub const DEFAULT_JOB_LIST_BATCH_SIZE: usize = 5;

pub const DEFAULT_SHARE_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_REQUEST_JOB_LIST_INTERVAL_MS: u64 = 60 * 1000;
pub const DEFAULT_PAYLOAD_REQUEST_INTERVAL_MS: u64 = 2 * 60 * 1000;
pub const DEFAULT_SERIALIZATION_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_PROGRESS_UPDATE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 60 * 1000;
pub const DEFAULT_DELETION_GRACE_PERIOD_SECS: u64 = 14 * 24 * 60 * 60;
pub const DEFAULT_WORKER_SLEEP_MS: u64 = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// File extension of persisted jobs.
pub const JOB_FILE_EXTENSION: &str = "job";
