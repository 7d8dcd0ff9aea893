//! Deletion signature blobs.
//!
//! ```text
//! USER: "USER" | u32 id len | job id | i64 time | signature
//! ADMN: "ADMN" | u32 id len | job id | i64 time | u32 cert len | certificate | signature
//! ```
//!
//! Integers are little-endian, the time uses the binary date encoding of
//! [`crate::util::date_to_binary`] and the signature covers every preceding byte.

use chrono::{DateTime, Utc};

use crate::certificate::CertificateService;
use crate::codec::{put_prefixed_u32, Reader};
use crate::error::ProtocolError;
use crate::job::JobId;
use crate::util::{date_from_binary, date_to_binary, from_signed_le_bytes};

const USER_MAGIC: &[u8; 4] = b"USER";
const ADMIN_MAGIC: &[u8; 4] = b"ADMN";

/// Who authorized a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionAuthority {
    /// The job's creator; verified against the job's creator certificate.
    User,
    /// An administrator; verified against the embedded certificate.
    Admin { certificate: Vec<u8> },
}

/// A parsed deletion blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionSignature {
    pub authority: DeletionAuthority,
    pub job_id: JobId,
    pub deletion_time: i64,
    pub signed: Vec<u8>,
    pub signature: Vec<u8>,
}

impl DeletionSignature {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let magic: [u8; 4] = reader.read_array("deletion magic")?;
        let is_admin = if &magic == USER_MAGIC {
            false
        } else if &magic == ADMIN_MAGIC {
            true
        } else {
            return Err(ProtocolError::UnknownDeletionMagic(magic));
        };
        let id_len = reader.read_u32("deletion job id")? as usize;
        let job_id = JobId(from_signed_le_bytes(
            reader.read_bytes(id_len, "deletion job id")?,
            "deletion job id",
        )?);
        let deletion_time = reader.read_i64("deletion time")?;
        let authority = if is_admin {
            let cert_len = reader.read_u32("deletion certificate")? as usize;
            let certificate = reader.read_bytes(cert_len, "deletion certificate")?.to_vec();
            DeletionAuthority::Admin { certificate }
        } else {
            DeletionAuthority::User
        };
        let signed = bytes[..reader.position()].to_vec();
        let signature = reader.read_rest().to_vec();
        Ok(DeletionSignature {
            authority,
            job_id,
            deletion_time,
            signed,
            signature,
        })
    }

    pub fn deletion_time(&self) -> Option<DateTime<Utc>> {
        date_from_binary(self.deletion_time).ok()
    }

    /// Builds a USER blob signed with the local identity.
    pub fn create_user(
        job_id: JobId,
        time: DateTime<Utc>,
        certificates: &dyn CertificateService,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut out = USER_MAGIC.to_vec();
        put_prefixed_u32(&mut out, &job_id.to_bytes(), "deletion job id")?;
        out.extend_from_slice(&date_to_binary(time).to_le_bytes());
        let signature = certificates.sign_data(&out);
        out.extend_from_slice(&signature);
        Ok(out)
    }

    /// Builds an ADMN blob embedding and signed with the local (admin) identity.
    pub fn create_admin(
        job_id: JobId,
        time: DateTime<Utc>,
        certificates: &dyn CertificateService,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut out = ADMIN_MAGIC.to_vec();
        put_prefixed_u32(&mut out, &job_id.to_bytes(), "deletion job id")?;
        out.extend_from_slice(&date_to_binary(time).to_le_bytes());
        put_prefixed_u32(&mut out, certificates.own_certificate(), "deletion certificate")?;
        let signature = certificates.sign_data(&out);
        out.extend_from_slice(&signature);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::TestWorld;
    use crate::util::truncate_to_ticks;

    #[test]
    fn test_parse_user_blob() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let now = truncate_to_ticks(Utc::now());
        let blob = DeletionSignature::create_user(JobId(42), now, &alice).unwrap();
        let parsed = DeletionSignature::parse(&blob).unwrap();
        assert_eq!(parsed.authority, DeletionAuthority::User);
        assert_eq!(parsed.job_id, JobId(42));
        assert_eq!(parsed.deletion_time(), Some(now));
        assert_eq!(parsed.signed.len() + parsed.signature.len(), blob.len());
        assert_eq!(&parsed.signed[..4], b"USER");
    }

    #[test]
    fn test_parse_admin_blob() {
        let world = TestWorld::new();
        let admin = world.peer("admin");
        let blob = DeletionSignature::create_admin(JobId(7), Utc::now(), &admin).unwrap();
        let parsed = DeletionSignature::parse(&blob).unwrap();
        assert_eq!(
            parsed.authority,
            DeletionAuthority::Admin {
                certificate: admin.own_certificate().to_vec()
            }
        );
        assert_eq!(parsed.job_id, JobId(7));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            DeletionSignature::parse(b"NOPE\x01\x00\x00\x00\x01"),
            Err(ProtocolError::UnknownDeletionMagic(_))
        ));
        assert!(matches!(
            DeletionSignature::parse(b"US"),
            Err(ProtocolError::Truncated { .. })
        ));
        // announced id length runs past the end
        assert!(DeletionSignature::parse(b"USER\xFF\x00\x00\x00\x01").is_err());
    }
}
