//! # VoluntLib Management Layer
//!
//! This library implements the management layer of a peer-to-peer volunteer computing
//! network. Peers publish *jobs*: signed descriptions of a computation split into a fixed
//! number of blocks, together with an opaque payload. Every peer replicates the jobs it
//! learns about, fetches missing payloads, tracks which blocks have been calculated and
//! propagates deletions, without any central server.
//!
//! ## Jobs and Signatures
//!
//! A job is created by exactly one peer. Its creator signs every descriptive field with an
//! identity certified by the network's authority, so any peer can verify a copy it received
//! from anyone else. The payload is not signed directly: the signed fields include a hash
//! of it, and a payload is only accepted when it hashes to that value.
//!
//! A job is deleted by attaching a deletion signature. The creator signs a `USER` blob, an
//! administrator signs an `ADMN` blob that also embeds the administrator's certificate.
//! Either way the blob names the job id and the deletion time. Once a peer has accepted a
//! valid deletion it never forgets it, and after a grace period the job is removed.
//!
//! ## Epochs and Bitmasks
//!
//! The blocks of a job are tracked in *epochs*. Each epoch covers as many blocks as its
//! bitmask has bits:
//!
//! ```ignore
//! mask_size = clamp(ceil(blocks / 8), 1, max_mask_size)
//! epochs    = ceil(blocks / (mask_size * 8))
//! ```
//!
//! A set bit means the block is calculated. When every bit of an epoch is set, the peer
//! moves on to the next epoch with a cleared mask. In the last epoch the bits past the end
//! of the job are pre-set, so a finished job is simply one whose last epoch is full.
//! Two states of the same epoch are merged by or-ing their masks, and a state of a later
//! epoch supersedes an earlier one.
//!
//! ## Wire Protocol
//!
//! Peers exchange four signed message kinds: a job-list request, a job-list response that
//! announces jobs without payloads, a job request and a job response carrying a full copy.
//! All integers are little-endian and all variable fields carry a 16-bit length prefix.
//!
//! ### Example: Creating a Job
//!
//! ```ignore
//! use std::sync::Arc;
//! use voluntlib::computation::ComputationQueue;
//! use voluntlib::config::ManagementConfig;
//! use voluntlib::manager::JobManager;
//! use voluntlib::network::MemoryNetwork;
//!
//! let config = ManagementConfig::load(".voluntlib")?;
//! let network = MemoryNetwork::new();
//! let manager = JobManager::with_file_storage(
//!     config,
//!     certificates,
//!     Arc::new(network.connect()),
//!     Arc::new(ComputationQueue::new()),
//! );
//! manager.start()?;
//! let job_id = manager.create_job("world", "primes", "Primes", "find primes", payload, 1000).await?;
//! ```
//!
//! ## Modules
//!
//! - `bitmask`: Fixed-size bit sets of calculated blocks.
//! - `certificate`: Identities, certificates and the certificate service.
//! - `codec`: Length-prefixed little-endian reading and writing.
//! - `computation`: Hand-off of epoch-state merges to the computation layer.
//! - `config`: Configuration loading.
//! - `deletion`: Deletion signature blobs.
//! - `epoch`: Epoch bookkeeping on top of bitmasks.
//! - `job`: The replicated job record.
//! - `manager`: The `JobManager` and its loops.
//! - `network`: The transport abstraction and an in-memory network.
//! - `operations`: Periodic and message-driven operations.
//! - `protocol`: Message framing.
//! - `repository`: Job persistence.
//!
//! [More detailed documentation and examples are provided in each module.]

/// The `bitmask` module implements the bit sets recording which blocks of an epoch are
/// calculated, including merging and picking random free blocks.
pub mod bitmask;

/// The `certificate` module defines the `CertificateService` the management layer signs and
/// verifies with, and an ed25519 implementation with a single trusted authority.
pub mod certificate;

/// The `codec` module contains the low-level reader and writer helpers shared by every
/// binary format in the library.
pub mod codec;

/// The `computation` module defines the hand-off point to the computation layer, which
/// merges remote calculation results into local jobs.
pub mod computation;

/// The `config` module loads the tunables of a peer from a `conf.toml` file and the
/// environment, and stores the peer's identity next to it.
pub mod config;

/// The `constants` module defines protocol constants and configuration defaults.
pub mod constants;

/// The `deletion` module parses and creates the signed blobs that mark a job as deleted.
pub mod deletion;

/// The `epoch` module tracks the progress of a job epoch by epoch.
pub mod epoch;

/// The `error` module defines the error types of the library.
pub mod error;

/// The `event` module defines the notifications a `JobManager` publishes to its host.
pub mod event;

/// The `job` module defines the `Job` record, its binary layout and every signature check
/// applied to it.
pub mod job;

/// The `manager` module contains the `JobManager`, which owns the job table, runs the
/// receive and worker loops and exposes the public job API.
pub mod manager;

/// The `network` module defines the `ConnectionManager` transport abstraction and an
/// in-process network for tests and simulations.
pub mod network;

/// The `operations` module implements the roster of operations driven by the
/// `JobManager`: sharing and requesting job lists, fetching payloads, persistence,
/// progress updates and housekeeping.
pub mod operations;

/// The `protocol` module defines the management messages and their wire format.
pub mod protocol;

/// The `repository` module manages job persistence behind the `JobRepository` trait.
pub mod repository;

/// The `util` module holds conversions shared by the binary formats.
pub mod util;
