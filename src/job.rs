//! The replicated job record.
//!
//! A [`Job`] is created and signed by exactly one peer and then copied across the network.
//! Its creator signature covers every descriptive field (but not the payload, the
//! deletion signature or the epoch state), so any peer can check that the copy it holds
//! is what the creator published. Fields a remote peer can influence are only changed
//! through the explicit methods on [`Job`], each of which validates what it accepts.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::certificate::{CertificateService, ValidationState};
use crate::codec::{put_prefixed, truncate_chars, Reader};
use crate::constants::{
    ANONYMOUS_NAME, JOB_DESCRIPTION_MAX_LENGTH, JOB_FILE_EXTENSION, JOB_STRING_MAX_LENGTH,
};
use crate::deletion::{DeletionAuthority, DeletionSignature};
use crate::epoch::{self, EpochState};
use crate::error::{EpochError, JobManagerError, ProtocolError};
use crate::util::{
    dashed_hex, date_from_binary, date_to_binary, from_signed_le_bytes, to_signed_le_bytes,
    truncate_to_ticks,
};

/// Identifier of a job: a non-negative integer of up to 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u128);

impl JobId {
    /// Draws a fresh id from 16 random bytes read as a signed value, negated if negative.
    pub fn random() -> Self {
        JobId(i128::from_le_bytes(rand::random()).unsigned_abs())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        to_signed_le_bytes(self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_signed_le_bytes(bytes, "job id").map(JobId)
    }

    /// Name of the file the job is persisted in, e.g. `2A-01.job`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", dashed_hex(&self.to_bytes()), JOB_FILE_EXTENSION)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_bytes()))
    }
}

/// Which fields go on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Form {
    /// Everything.
    Full,
    /// What the creator signs: no signatures, no payload, no epoch state.
    Signable,
}

#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    name: String,
    job_type: String,
    description: String,
    world_name: String,
    creator_name: String,
    number_of_blocks: u128,
    creation_date: DateTime<Utc>,
    creator_certificate: Vec<u8>,
    payload_hash: Vec<u8>,
    creator_signature: Vec<u8>,
    deletion_signature: Vec<u8>,
    payload: Vec<u8>,
    epoch_state: Option<EpochState>,
    is_deleted: bool,
    last_payload_request: Option<Instant>,
    progress: Option<f64>,
    epoch_progress: Option<f64>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Job {
            id,
            name: String::new(),
            job_type: String::new(),
            description: String::new(),
            world_name: String::new(),
            creator_name: String::new(),
            number_of_blocks: 0,
            creation_date: DateTime::<Utc>::default(),
            creator_certificate: Vec::new(),
            payload_hash: Vec::new(),
            creator_signature: Vec::new(),
            deletion_signature: Vec::new(),
            payload: Vec::new(),
            epoch_state: None,
            is_deleted: false,
            last_payload_request: None,
            progress: None,
            epoch_progress: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = truncate_chars(name, JOB_STRING_MAX_LENGTH).to_string();
        self
    }

    pub fn with_job_type(mut self, job_type: &str) -> Self {
        self.job_type = truncate_chars(job_type, JOB_STRING_MAX_LENGTH).to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = truncate_chars(description, JOB_DESCRIPTION_MAX_LENGTH).to_string();
        self
    }

    pub fn with_world_name(mut self, world_name: &str) -> Self {
        self.world_name = truncate_chars(world_name, JOB_STRING_MAX_LENGTH).to_string();
        self
    }

    pub fn with_creator_name(mut self, creator_name: &str) -> Self {
        self.creator_name = truncate_chars(creator_name, JOB_STRING_MAX_LENGTH).to_string();
        self
    }

    pub fn with_number_of_blocks(mut self, number_of_blocks: u128) -> Self {
        self.number_of_blocks = number_of_blocks;
        self
    }

    pub fn with_creation_date(mut self, creation_date: DateTime<Utc>) -> Self {
        self.creation_date = truncate_to_ticks(creation_date);
        self
    }

    pub fn with_creator_certificate(mut self, certificate: &[u8]) -> Self {
        self.creator_certificate = certificate.to_vec();
        self
    }

    pub fn with_epoch_state(mut self, state: EpochState) -> Self {
        self.epoch_state = Some(state);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn world_name(&self) -> &str {
        &self.world_name
    }

    pub fn creator_name(&self) -> &str {
        &self.creator_name
    }

    pub fn number_of_blocks(&self) -> u128 {
        self.number_of_blocks
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn creator_certificate(&self) -> &[u8] {
        &self.creator_certificate
    }

    pub fn payload_hash(&self) -> &[u8] {
        &self.payload_hash
    }

    pub fn creator_signature(&self) -> &[u8] {
        &self.creator_signature
    }

    pub fn deletion_signature(&self) -> &[u8] {
        &self.deletion_signature
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn epoch_state(&self) -> Option<&EpochState> {
        self.epoch_state.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn last_payload_request(&self) -> Option<Instant> {
        self.last_payload_request
    }

    pub fn mark_payload_requested(&mut self, at: Instant) {
        self.last_payload_request = Some(at);
    }

    /// Completion in percent, `None` until the first progress update.
    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    /// Completion of the current epoch in percent, `None` until the first progress update.
    pub fn epoch_progress(&self) -> Option<f64> {
        self.epoch_progress
    }

    /// Compares every serialized field, unlike `==` which only compares ids.
    pub fn fields_eq(&self, other: &Job) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.job_type == other.job_type
            && self.description == other.description
            && self.world_name == other.world_name
            && self.creator_name == other.creator_name
            && self.number_of_blocks == other.number_of_blocks
            && self.creation_date == other.creation_date
            && self.creator_certificate == other.creator_certificate
            && self.payload_hash == other.payload_hash
            && self.creator_signature == other.creator_signature
            && self.deletion_signature == other.deletion_signature
            && self.payload == other.payload
            && self.epoch_state == other.epoch_state
    }

    /// Copy as announced in job lists: without payload and epoch state.
    pub fn listing_copy(&self) -> Job {
        let mut copy = self.clone();
        copy.payload.clear();
        copy.epoch_state = None;
        copy
    }

    /// Size of the job's serialized fields in bytes, without length prefixes.
    pub fn job_size(&self) -> usize {
        let epoch_size = self
            .epoch_state
            .as_ref()
            .and_then(|state| state.serialize().ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        self.id.to_bytes().len()
            + self.name.len()
            + self.job_type.len()
            + self.description.len()
            + self.world_name.len()
            + self.creator_name.len()
            + to_signed_le_bytes(self.number_of_blocks).len()
            + 8
            + self.creator_certificate.len()
            + self.payload_hash.len()
            + self.creator_signature.len()
            + self.deletion_signature.len()
            + self.payload.len()
            + epoch_size
    }

    fn encode(&self, form: Form) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(256 + self.payload.len());
        put_prefixed(&mut out, &self.id.to_bytes(), "job id")?;
        put_prefixed(&mut out, truncate_chars(&self.name, JOB_STRING_MAX_LENGTH).as_bytes(), "job name")?;
        put_prefixed(&mut out, truncate_chars(&self.job_type, JOB_STRING_MAX_LENGTH).as_bytes(), "job type")?;
        put_prefixed(
            &mut out,
            truncate_chars(&self.description, JOB_DESCRIPTION_MAX_LENGTH).as_bytes(),
            "job description",
        )?;
        put_prefixed(&mut out, truncate_chars(&self.world_name, JOB_STRING_MAX_LENGTH).as_bytes(), "world name")?;
        put_prefixed(&mut out, truncate_chars(&self.creator_name, JOB_STRING_MAX_LENGTH).as_bytes(), "creator name")?;
        put_prefixed(&mut out, &to_signed_le_bytes(self.number_of_blocks), "number of blocks")?;
        out.extend_from_slice(&date_to_binary(self.creation_date).to_le_bytes());
        put_prefixed(&mut out, &self.creator_certificate, "creator certificate")?;
        put_prefixed(&mut out, &self.payload_hash, "payload hash")?;

        let full = form == Form::Full;
        put_prefixed(&mut out, if full { self.creator_signature.as_slice() } else { &[] }, "creator signature")?;
        put_prefixed(&mut out, if full { self.deletion_signature.as_slice() } else { &[] }, "deletion signature")?;
        put_prefixed(&mut out, if full { self.payload.as_slice() } else { &[] }, "payload")?;
        let epoch_bytes = match (&self.epoch_state, full) {
            (Some(state), true) => state.serialize()?,
            _ => Vec::new(),
        };
        put_prefixed(&mut out, &epoch_bytes, "epoch state")?;
        Ok(out)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode(Form::Full)
    }

    /// Bytes the creator signature is computed over.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode(Form::Signable)
    }

    pub fn deserialize(data: &[u8]) -> Result<Job, ProtocolError> {
        let mut reader = Reader::new(data);
        let id = JobId::from_bytes(reader.read_prefixed("job id")?)?;
        let name = reader.read_prefixed_string("job name")?;
        let job_type = reader.read_prefixed_string("job type")?;
        let description = reader.read_prefixed_string("job description")?;
        let world_name = reader.read_prefixed_string("world name")?;
        let creator_name = reader.read_prefixed_string("creator name")?;
        let number_of_blocks = from_signed_le_bytes(reader.read_prefixed("number of blocks")?, "number of blocks")?;
        let creation_date = date_from_binary(reader.read_i64("creation date")?)?;
        let creator_certificate = reader.read_prefixed("creator certificate")?.to_vec();
        let payload_hash = reader.read_prefixed("payload hash")?.to_vec();
        let creator_signature = reader.read_prefixed("creator signature")?.to_vec();
        let deletion_signature = reader.read_prefixed("deletion signature")?.to_vec();
        let payload = reader.read_prefixed("payload")?.to_vec();
        let epoch_bytes = reader.read_prefixed("epoch state")?;
        let epoch_state = if epoch_bytes.is_empty() {
            None
        } else {
            Some(EpochState::deserialize(epoch_bytes)?)
        };

        let mut job = Job::new(id);
        job.name = name;
        job.job_type = job_type;
        job.description = description;
        job.world_name = world_name;
        job.creator_name = creator_name;
        job.number_of_blocks = number_of_blocks;
        job.creation_date = creation_date;
        job.creator_certificate = creator_certificate;
        job.payload_hash = payload_hash;
        job.creator_signature = creator_signature;
        job.deletion_signature = deletion_signature;
        job.payload = payload;
        job.epoch_state = epoch_state;
        Ok(job)
    }

    /// Signs the descriptive fields with the local identity.
    pub fn generate_creator_signature(&mut self, certificates: &dyn CertificateService) -> Result<(), ProtocolError> {
        self.creator_signature = certificates.sign_data(&self.signable_bytes()?);
        Ok(())
    }

    /// Whether the creator signature verifies against a trusted, non-anonymous,
    /// non-banned creator certificate.
    pub fn has_valid_creator_signature(&self, certificates: &dyn CertificateService) -> bool {
        let anonymous = certificates
            .subject_name(&self.creator_certificate)
            .map(|subject| subject.eq_ignore_ascii_case(ANONYMOUS_NAME))
            .unwrap_or(true);
        if anonymous
            || !certificates.is_valid_certificate(&self.creator_certificate)
            || certificates.is_banned_certificate(&self.creator_certificate)
        {
            return false;
        }
        let Ok(data) = self.signable_bytes() else {
            return false;
        };
        certificates.verify_signature(&data, &self.creator_signature, &self.creator_certificate)
            == ValidationState::Valid
    }

    /// Sets the payload together with its hash; used by the creator.
    pub fn attach_payload(&mut self, payload: Vec<u8>, certificates: &dyn CertificateService) {
        self.payload_hash = certificates.compute_hash(&payload);
        self.payload = payload;
    }

    pub fn payload_matches_hash(&self, certificates: &dyn CertificateService) -> bool {
        certificates.compute_hash(&self.payload) == self.payload_hash
    }

    /// Accepts a payload received from a peer if it hashes to the signed payload hash.
    pub fn apply_incoming_payload(&mut self, payload: &[u8], certificates: &dyn CertificateService) -> bool {
        if certificates.compute_hash(payload) != self.payload_hash {
            return false;
        }
        self.payload = payload.to_vec();
        true
    }

    pub fn strip_payload(&mut self) {
        self.payload.clear();
    }

    pub fn has_valid_deletion_signature(&self, certificates: &dyn CertificateService) -> bool {
        let Ok(deletion) = DeletionSignature::parse(&self.deletion_signature) else {
            return false;
        };
        if deletion.job_id != self.id {
            return false;
        }
        let certificate = match &deletion.authority {
            DeletionAuthority::User => &self.creator_certificate,
            DeletionAuthority::Admin { certificate } => {
                if !certificates.is_admin_certificate(certificate) {
                    return false;
                }
                certificate
            }
        };
        certificates.verify_signature(&deletion.signed, &deletion.signature, certificate) == ValidationState::Valid
    }

    /// Recomputes `is_deleted` from the stored deletion signature, dropping it when invalid.
    pub fn refresh_deletion_state(&mut self, certificates: &dyn CertificateService) {
        self.is_deleted = self.has_valid_deletion_signature(certificates);
        if !self.is_deleted {
            self.deletion_signature.clear();
        }
    }

    /// Stores a deletion signature received from a peer if it is valid for this job.
    ///
    /// Once a job is deleted it stays deleted; later signatures are ignored.
    pub fn apply_deletion_signature(&mut self, signature: &[u8], certificates: &dyn CertificateService) -> bool {
        if self.is_deleted || signature.is_empty() {
            return false;
        }
        let previous = std::mem::replace(&mut self.deletion_signature, signature.to_vec());
        if self.has_valid_deletion_signature(certificates) {
            self.is_deleted = true;
            true
        } else {
            self.deletion_signature = previous;
            false
        }
    }

    /// Whether the local identity may delete this job.
    pub fn user_can_delete(&self, certificates: &dyn CertificateService) -> bool {
        self.creator_name == certificates.own_name()
            || certificates.is_admin_certificate(certificates.own_certificate())
    }

    /// Signs a deletion as creator, or failing that as administrator.
    ///
    /// Leaves the job untouched when the local identity is neither.
    pub fn generate_deletion_signature(
        &mut self,
        certificates: &dyn CertificateService,
    ) -> Result<(), JobManagerError> {
        let now = truncate_to_ticks(Utc::now());
        let signature = if self.creator_name == certificates.own_name() {
            DeletionSignature::create_user(self.id, now, certificates)?
        } else if certificates.is_admin_certificate(certificates.own_certificate()) {
            DeletionSignature::create_admin(self.id, now, certificates)?
        } else {
            return Err(JobManagerError::NotAuthorized(self.id));
        };
        self.deletion_signature = signature;
        self.is_deleted = true;
        Ok(())
    }

    /// Time stamped into the deletion signature, `None` if absent or unparsable.
    pub fn deletion_time(&self) -> Option<DateTime<Utc>> {
        DeletionSignature::parse(&self.deletion_signature)
            .ok()
            .and_then(|deletion| deletion.deletion_time())
    }

    /// Starts the epoch bookkeeping with a mask sized for the job's block count.
    pub fn init_epoch_state(&mut self, max_mask_size: u32) {
        let mut state = EpochState::new(epoch::mask_size_for(self.number_of_blocks, max_mask_size));
        state.check_and_update(self.number_of_blocks);
        self.epoch_state = Some(state);
    }

    /// Checks that `state` describes an epoch of this job.
    ///
    /// The mask must have the size of the local state, or the size `init_epoch_state`
    /// would pick when there is none, and the epoch must exist for the job's blocks.
    pub fn validate_epoch_state(&self, state: &EpochState, max_mask_size: u32) -> Result<(), EpochError> {
        let expected = match &self.epoch_state {
            Some(local) => local.bitmask.mask_size(),
            None => epoch::mask_size_for(self.number_of_blocks, max_mask_size),
        };
        if state.bitmask.mask_size() != expected {
            return Err(EpochError::MaskSizeMismatch {
                local: expected,
                remote: state.bitmask.mask_size(),
            });
        }
        let epochs = epoch::number_of_epochs(self.number_of_blocks, expected);
        if state.epoch_number >= epochs {
            return Err(EpochError::EpochOutOfRange {
                epoch: state.epoch_number,
                epochs,
            });
        }
        Ok(())
    }

    /// Takes a remote epoch state when none is known locally.
    pub fn adopt_epoch_state(&mut self, state: &EpochState, max_mask_size: u32) -> Result<bool, EpochError> {
        if self.epoch_state.is_some() {
            return Ok(false);
        }
        self.validate_epoch_state(state, max_mask_size)?;
        let mut state = state.clone();
        state.check_and_update(self.number_of_blocks);
        self.epoch_state = Some(state);
        Ok(true)
    }

    /// Folds a remote epoch state into the local one.
    ///
    /// A remote state in a later epoch replaces the local one, an earlier one is
    /// ignored, and states of the same epoch are or-merged. States that do not fit the
    /// job are rejected without touching the local state.
    pub fn merge_epoch_state(&mut self, remote: &EpochState, max_mask_size: u32) -> Result<bool, EpochError> {
        self.validate_epoch_state(remote, max_mask_size)?;
        let Some(local) = self.epoch_state.as_mut() else {
            return self.adopt_epoch_state(remote, max_mask_size);
        };
        let changed = if remote.epoch_number > local.epoch_number {
            *local = remote.clone();
            true
        } else if remote.epoch_number < local.epoch_number {
            false
        } else {
            local.merge(remote)?
        };
        Ok(self.check_and_update_epoch_and_bitmask() || changed)
    }

    /// Replaces a stored or received epoch state that does not fit the job with a fresh one.
    ///
    /// Returns the reason when the state was replaced.
    pub fn repair_epoch_state(&mut self, max_mask_size: u32) -> Option<EpochError> {
        let state = self.epoch_state.take()?;
        match self.adopt_epoch_state(&state, max_mask_size) {
            Ok(_) => None,
            Err(err) => {
                self.init_epoch_state(max_mask_size);
                Some(err)
            }
        }
    }

    pub fn check_and_update_epoch_and_bitmask(&mut self) -> bool {
        let blocks = self.number_of_blocks;
        self.epoch_state
            .as_mut()
            .map(|state| state.check_and_update(blocks))
            .unwrap_or(false)
    }

    pub fn number_of_epochs(&self) -> u128 {
        self.epoch_state
            .as_ref()
            .map(|state| epoch::number_of_epochs(self.number_of_blocks, state.bitmask.mask_size()))
            .unwrap_or(0)
    }

    pub fn number_of_calculated_blocks(&self) -> u128 {
        self.epoch_state
            .as_ref()
            .map(|state| state.calculated_blocks(self.number_of_blocks))
            .unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.epoch_state.is_some() && self.number_of_calculated_blocks() == self.number_of_blocks
    }

    /// A random block of the current epoch that is not calculated yet.
    pub fn free_block_id(&self) -> Option<u128> {
        self.epoch_state.as_ref().and_then(EpochState::free_block_id)
    }

    pub fn free_blocks_in_epoch(&self) -> Vec<u128> {
        self.epoch_state
            .as_ref()
            .map(EpochState::free_blocks)
            .unwrap_or_default()
    }

    /// Recomputes progress figures, returning `true` when they changed.
    pub fn update_progress(&mut self) -> bool {
        let Some(state) = self.epoch_state.as_ref() else {
            return false;
        };
        let bits = state.bitmask.bit_count().max(1) as f64;
        let epoch_progress = state.bitmask.set_bits_count() as f64 / bits * 100.0;
        let progress = if self.number_of_blocks == 0 {
            0.0
        } else {
            self.number_of_calculated_blocks() as f64 / self.number_of_blocks as f64 * 100.0
        };
        if self.progress == Some(progress) && self.epoch_progress == Some(epoch_progress) {
            return false;
        }
        self.progress = Some(progress);
        self.epoch_progress = Some(epoch_progress);
        true
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job {}", self.id)?;
        writeln!(f, "  name:        {}", self.name)?;
        writeln!(f, "  type:        {}", self.job_type)?;
        writeln!(f, "  description: {}", self.description)?;
        writeln!(f, "  world:       {}", self.world_name)?;
        writeln!(f, "  creator:     {}", self.creator_name)?;
        writeln!(f, "  created:     {}", self.creation_date.to_rfc3339())?;
        writeln!(f, "  blocks:      {}", self.number_of_blocks)?;
        writeln!(f, "  calculated:  {}", self.number_of_calculated_blocks())?;
        writeln!(f, "  deleted:     {}", self.is_deleted)?;
        write!(f, "  payload:     {} bytes", self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::TestWorld;

    fn signed_job(certificates: &dyn CertificateService, blocks: u128) -> Job {
        let mut job = Job::new(JobId::random())
            .with_name("primes")
            .with_job_type("search")
            .with_description("find primes")
            .with_world_name("world")
            .with_creator_name(certificates.own_name())
            .with_number_of_blocks(blocks)
            .with_creation_date(Utc::now())
            .with_creator_certificate(certificates.own_certificate());
        job.attach_payload(vec![1, 2, 3, 4], certificates);
        job.generate_creator_signature(certificates).unwrap();
        job.init_epoch_state(16384);
        job
    }

    #[test]
    fn test_job_id_random_is_non_negative_and_round_trips() {
        for _ in 0..100 {
            let id = JobId::random();
            let bytes = id.to_bytes();
            assert!(bytes.len() <= 17);
            assert_eq!(bytes[bytes.len() - 1] & 0x80, 0);
            assert_eq!(JobId::from_bytes(&bytes).unwrap(), id);
        }
    }

    #[test]
    fn test_job_id_text_forms() {
        let id = JobId(0x0102);
        assert_eq!(id.to_string(), "0201");
        assert_eq!(id.file_name(), "02-01.job");
    }

    #[test]
    fn test_serialize_round_trip() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let job = signed_job(&alice, 1000);
        let decoded = Job::deserialize(&job.serialize().unwrap()).unwrap();
        assert!(decoded.fields_eq(&job));
        assert!(decoded.has_valid_creator_signature(&alice));
    }

    #[test]
    fn test_round_trip_with_empty_and_maximal_fields() {
        let long = "x".repeat(JOB_STRING_MAX_LENGTH);
        let job = Job::new(JobId(0))
            .with_name(&long)
            .with_description(&"d".repeat(JOB_DESCRIPTION_MAX_LENGTH));
        let decoded = Job::deserialize(&job.serialize().unwrap()).unwrap();
        assert!(decoded.fields_eq(&job));
        assert!(decoded.epoch_state().is_none());
        assert!(!decoded.has_payload());
    }

    #[test]
    fn test_strings_are_truncated() {
        let job = Job::new(JobId(1))
            .with_name(&"n".repeat(JOB_STRING_MAX_LENGTH + 10))
            .with_description(&"d".repeat(JOB_DESCRIPTION_MAX_LENGTH + 10));
        assert_eq!(job.name().chars().count(), JOB_STRING_MAX_LENGTH);
        assert_eq!(job.description().chars().count(), JOB_DESCRIPTION_MAX_LENGTH);
    }

    #[test]
    fn test_deserialize_rejects_truncated_input() {
        let world = TestWorld::new();
        let job = signed_job(&world.peer("alice"), 10);
        let bytes = job.serialize().unwrap();
        for cut in [0, 1, 5, bytes.len() / 2, bytes.len() - 1] {
            assert!(Job::deserialize(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_creator_signature_ignores_payload_deletion_and_epoch() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 64);
        assert!(job.has_valid_creator_signature(&alice));

        job.strip_payload();
        assert!(job.has_valid_creator_signature(&alice));
        job.epoch_state = None;
        assert!(job.has_valid_creator_signature(&alice));
        job.generate_deletion_signature(&alice).unwrap();
        assert!(job.has_valid_creator_signature(&alice));
    }

    #[test]
    fn test_tampered_job_fails_verification() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let job = signed_job(&alice, 64);

        let mut renamed = job.clone();
        renamed.name = "other".into();
        assert!(!renamed.has_valid_creator_signature(&alice));

        let mut forged_id = job.clone();
        forged_id.id = JobId(job.id.0 ^ 1);
        assert!(!forged_id.has_valid_creator_signature(&alice));

        let mut more_blocks = job.clone();
        more_blocks.number_of_blocks += 1;
        assert!(!more_blocks.has_valid_creator_signature(&alice));

        let mut retyped = job.clone();
        retyped.job_type = "other".into();
        assert!(!retyped.has_valid_creator_signature(&alice));

        let mut redescribed = job.clone();
        redescribed.description = "find composites".into();
        assert!(!redescribed.has_valid_creator_signature(&alice));

        let mut moved = job.clone();
        moved.world_name = "elsewhere".into();
        assert!(!moved.has_valid_creator_signature(&alice));

        let mut reattributed = job.clone();
        reattributed.creator_name = "mallory".into();
        assert!(!reattributed.has_valid_creator_signature(&alice));

        let mut backdated = job.clone();
        backdated.creation_date = job.creation_date - chrono::Duration::seconds(1);
        assert!(!backdated.has_valid_creator_signature(&alice));

        let mut recertified = job.clone();
        recertified.creator_certificate = world.peer("bob").own_certificate().to_vec();
        assert!(!recertified.has_valid_creator_signature(&alice));
    }

    #[test]
    fn test_anonymous_and_banned_creators_are_rejected() {
        let world = TestWorld::new();
        let anonymous = world.peer(ANONYMOUS_NAME);
        let bob = world.peer("bob");
        let job = signed_job(&anonymous, 8);
        assert!(!job.has_valid_creator_signature(&bob));

        let alice = world.peer("alice");
        let job = signed_job(&alice, 8);
        bob.ban_certificate(alice.own_certificate());
        assert!(!job.has_valid_creator_signature(&bob));
    }

    #[test]
    fn test_payload_hash_check() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 8);
        assert!(job.payload_matches_hash(&alice));
        job.strip_payload();
        assert!(!job.has_payload());
        assert!(!job.apply_incoming_payload(&[9, 9, 9], &alice));
        assert!(!job.has_payload());
        assert!(job.apply_incoming_payload(&[1, 2, 3, 4], &alice));
        assert_eq!(job.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_user_deletion() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let bob = world.peer("bob");
        let mut job = signed_job(&alice, 8);
        job.generate_deletion_signature(&alice).unwrap();
        assert!(job.is_deleted());
        assert!(job.has_valid_deletion_signature(&bob));
        assert!(job.deletion_time().is_some());

        let mut copy = Job::deserialize(&job.serialize().unwrap()).unwrap();
        assert!(!copy.is_deleted());
        copy.refresh_deletion_state(&bob);
        assert!(copy.is_deleted());
    }

    #[test]
    fn test_admin_deletion() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let admin = world.peer("admin");
        let mut job = signed_job(&alice, 8);
        job.generate_deletion_signature(&admin).unwrap();
        assert!(job.is_deleted());
        assert_eq!(&job.deletion_signature()[..4], b"ADMN");
        assert!(job.has_valid_deletion_signature(&alice));
    }

    #[test]
    fn test_unauthorized_deletion_leaves_job_untouched() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mallory = world.peer("mallory");
        let mut job = signed_job(&alice, 8);
        assert!(!job.user_can_delete(&mallory));
        assert!(matches!(
            job.generate_deletion_signature(&mallory),
            Err(JobManagerError::NotAuthorized(_))
        ));
        assert!(!job.is_deleted());
        assert!(job.deletion_signature().is_empty());
    }

    #[test]
    fn test_foreign_user_signature_does_not_delete() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mallory = world.peer("mallory");
        let mut job = signed_job(&alice, 8);
        let forged = DeletionSignature::create_user(job.id(), Utc::now(), &mallory).unwrap();
        assert!(!job.apply_deletion_signature(&forged, &alice));
        assert!(!job.is_deleted());
        assert!(job.deletion_signature().is_empty());

        // a non-admin cannot pass as admin either
        let forged = DeletionSignature::create_admin(job.id(), Utc::now(), &mallory).unwrap();
        assert!(!job.apply_deletion_signature(&forged, &alice));
    }

    #[test]
    fn test_deletion_signature_for_other_job_is_rejected() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 8);
        let other = DeletionSignature::create_user(JobId(job.id().0 ^ 1), Utc::now(), &alice).unwrap();
        assert!(!job.apply_deletion_signature(&other, &alice));
    }

    #[test]
    fn test_deletion_is_monotonic() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 8);
        let first = DeletionSignature::create_user(job.id(), Utc::now(), &alice).unwrap();
        assert!(job.apply_deletion_signature(&first, &alice));
        let second = DeletionSignature::create_user(job.id(), Utc::now(), &alice).unwrap();
        assert!(!job.apply_deletion_signature(&second, &alice));
        assert_eq!(job.deletion_signature(), first.as_slice());
        assert!(job.is_deleted());
    }

    #[test]
    fn test_invalid_stored_deletion_signature_is_dropped() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 8);
        job.deletion_signature = b"USER garbage".to_vec();
        job.refresh_deletion_state(&alice);
        assert!(!job.is_deleted());
        assert!(job.deletion_signature().is_empty());
        assert!(job.deletion_time().is_none());
    }

    #[test]
    fn test_progress_and_blocks() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut job = signed_job(&alice, 12);
        assert_eq!(job.number_of_epochs(), 1);
        assert_eq!(job.number_of_calculated_blocks(), 0);
        assert!(job.progress().is_none());
        assert!(job.update_progress());
        assert_eq!(job.progress(), Some(0.0));
        assert!(!job.update_progress());

        let blocks = job.free_blocks_in_epoch();
        assert_eq!(blocks.len(), 12);
        let mut state = job.epoch_state().unwrap().clone();
        for bit in 0..6 {
            state.bitmask.set_bit(bit).unwrap();
        }
        assert!(job.merge_epoch_state(&state, 16384).unwrap());
        assert_eq!(job.number_of_calculated_blocks(), 6);
        assert!(job.update_progress());
        assert_eq!(job.progress(), Some(50.0));
        assert!(!job.is_finished());
        assert!(job.free_block_id().map(|id| (6..12).contains(&id)).unwrap());
    }

    #[test]
    fn test_merge_epoch_state_orders_epochs() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        // 16 blocks with a 1-byte mask: two epochs
        let mut job = signed_job(&alice, 16);
        job.epoch_state = Some(EpochState::new(1));

        let mut ahead = EpochState::new(1);
        ahead.epoch_number = 1;
        ahead.bitmask.set_bit(0).unwrap();
        assert!(job.merge_epoch_state(&ahead, 16384).unwrap());
        assert_eq!(job.epoch_state().unwrap().epoch_number, 1);
        assert_eq!(job.number_of_calculated_blocks(), 9);

        let behind = EpochState::new(1);
        assert!(!job.merge_epoch_state(&behind, 16384).unwrap());
        assert_eq!(job.number_of_calculated_blocks(), 9);

        let wrong_size = EpochState::new(2);
        assert!(job.merge_epoch_state(&wrong_size, 16384).is_err());
    }

    #[test]
    fn test_epoch_states_that_do_not_fit_the_job_are_rejected() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        // 16 blocks: a 2-byte mask and a single epoch
        let mut job = signed_job(&alice, 16);
        let before = job.epoch_state().cloned();

        let mut beyond = EpochState::new(2);
        beyond.epoch_number = 1 << 125;
        assert_eq!(
            job.merge_epoch_state(&beyond, 16384),
            Err(EpochError::EpochOutOfRange { epoch: 1 << 125, epochs: 1 })
        );
        beyond.epoch_number = 1;
        assert!(job.merge_epoch_state(&beyond, 16384).is_err());
        assert_eq!(
            job.merge_epoch_state(&EpochState::new(70_000), 16384),
            Err(EpochError::MaskSizeMismatch { local: 2, remote: 70_000 })
        );
        assert_eq!(job.epoch_state().cloned(), before);
        assert_eq!(job.number_of_calculated_blocks(), 0);

        job.epoch_state = None;
        assert!(job.adopt_epoch_state(&EpochState::new(1), 16384).is_err());
        assert!(job.epoch_state().is_none());
        assert!(job.adopt_epoch_state(&EpochState::new(2), 16384).unwrap());
    }

    #[test]
    fn test_repair_epoch_state() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let mut state = EpochState::new(2);
        state.epoch_number = u128::MAX;
        let mut job = signed_job(&alice, 16).with_epoch_state(state);
        assert!(matches!(
            job.repair_epoch_state(16384),
            Some(EpochError::EpochOutOfRange { .. })
        ));
        assert_eq!(job.epoch_state().unwrap().epoch_number, 0);
        assert_eq!(job.number_of_calculated_blocks(), 0);

        assert!(job.repair_epoch_state(16384).is_none());
        assert!(Job::new(JobId(1)).repair_epoch_state(16384).is_none());
    }

    #[test]
    fn test_listing_copy_drops_payload_and_epoch() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let job = signed_job(&alice, 8);
        let listing = job.listing_copy();
        assert!(!listing.has_payload());
        assert!(listing.epoch_state().is_none());
        assert!(listing.has_valid_creator_signature(&alice));
        assert!(job.job_size() > listing.job_size());
    }
}
