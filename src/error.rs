use thiserror::Error;

use crate::job::JobId;

/// Failures while decoding or encoding management-layer bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated buffer reading `{field}`: needed {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("invalid magic number {0:02X?}")]
    BadMagic(Vec<u8>),
    #[error("unsupported protocol version {received}, this build understands up to {supported}")]
    UnsupportedVersion { received: u8, supported: u8 },
    #[error("received a message of undefined type")]
    UndefinedMessageType,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("field `{0}` does not hold a non-negative integer that fits in 128 bits")]
    InvalidInteger(&'static str),
    #[error("field `{field}` is {len} bytes long, the maximum is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("payload length mismatch: header announces {announced} bytes, {available} available")]
    PayloadLengthMismatch { announced: usize, available: usize },
    #[error("unknown deletion signature magic {0:02X?}")]
    UnknownDeletionMagic([u8; 4]),
    #[error("invalid creation date encoding {0:#x}")]
    InvalidDate(i64),
    #[error("message type {0:?} does not carry a job")]
    UnexpectedMessageType(crate::protocol::MessageType),
}

/// Failures combining bitmasks and epoch states.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EpochError {
    #[error("bitmask size mismatch: local {local} bytes, remote {remote} bytes")]
    MaskSizeMismatch { local: u32, remote: u32 },
    #[error("epoch mismatch: local epoch {local}, remote epoch {remote}")]
    EpochMismatch { local: u128, remote: u128 },
    #[error("epoch {epoch} is beyond the {epochs} epochs of the job")]
    EpochOutOfRange { epoch: u128, epochs: u128 },
    #[error("offset {offset} is outside a bitmask of {size} bytes")]
    OutOfRange { offset: usize, size: u32 },
}

/// Failures reported by a `ConnectionManager`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    UnknownPeer(String),
    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced by the public `JobManager` API.
#[derive(Error, Debug)]
pub enum JobManagerError {
    #[error("job manager is already running")]
    AlreadyRunning,
    #[error("the anonymous identity may not create jobs")]
    AnonymousCreator,
    #[error("job payload of {actual} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("a job needs at least one block")]
    InvalidNumberOfBlocks,
    #[error("job {0} is unknown")]
    UnknownJob(JobId),
    #[error("not authorized to delete job {0}")]
    NotAuthorized(JobId),
    #[error("job id {0} is already in use")]
    DuplicateJobId(JobId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Epoch(#[from] EpochError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("storage failure: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, JobManagerError>;
