//! Identity, signing and certificate policy.
//!
//! The management layer never looks inside a certificate itself; it asks a
//! [`CertificateService`] whether a blob is valid, whether it belongs to an administrator
//! or a banned peer, and whether a signature made with it checks out.
//!
//! [`Ed25519CertificateService`] is the bundled implementation: certificates are small
//! CBOR documents binding a subject name to an ed25519 public key, signed by a
//! [`CertificateAuthority`] every peer of a world trusts.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::put_prefixed;
use crate::protocol::Message;

/// Outcome of checking a signature against a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Valid,
    InvalidCertificate,
    CertificateBanned,
    InvalidSignature,
}

/// Signing and verification capabilities the management layer depends on.
pub trait CertificateService: Send + Sync {
    /// Subject name of the local identity.
    fn own_name(&self) -> &str;

    /// Certificate of the local identity, as sent in message headers and jobs.
    fn own_certificate(&self) -> &[u8];

    /// Signs `data` with the local identity's key.
    fn sign_data(&self, data: &[u8]) -> Vec<u8>;

    fn verify_signature(&self, data: &[u8], signature: &[u8], certificate: &[u8]) -> ValidationState;

    fn is_valid_certificate(&self, certificate: &[u8]) -> bool;

    fn is_admin_certificate(&self, certificate: &[u8]) -> bool;

    fn is_banned_certificate(&self, certificate: &[u8]) -> bool;

    /// Subject name carried by `certificate`, `None` when it cannot be parsed.
    fn subject_name(&self, certificate: &[u8]) -> Option<String>;

    /// Hash used for job payloads.
    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    /// Verifies a received message against the certificate in its own header.
    fn verify_message(&self, message: &Message) -> ValidationState {
        match message.signable_bytes() {
            Ok(data) => self.verify_signature(&data, &message.header.signature, &message.header.certificate),
            Err(_) => ValidationState::InvalidSignature,
        }
    }
}

/// A subject name bound to an ed25519 public key by an authority signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub subject: String,
    pub public_key: Vec<u8>,
    pub issuer_signature: Vec<u8>,
}

impl Certificate {
    fn to_be_signed(subject: &str, public_key: &[u8]) -> Vec<u8> {
        let mut out = b"VLCERT".to_vec();
        // subject names are short, an oversized one simply never verifies
        let _ = put_prefixed(&mut out, subject.as_bytes(), "subject");
        out.extend_from_slice(public_key);
        out
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_cbor::Error> {
        serde_cbor::from_slice(bytes)
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        let key: [u8; 32] = self.public_key.as_slice().try_into().ok()?;
        VerifyingKey::from_bytes(&key).ok()
    }

    /// Whether `authority` issued this certificate.
    pub fn is_issued_by(&self, authority: &VerifyingKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.issuer_signature) else {
            return false;
        };
        self.verifying_key().is_some()
            && authority
                .verify(&Self::to_be_signed(&self.subject, &self.public_key), &signature)
                .is_ok()
    }
}

/// Key pair that issues the certificates of one world.
pub struct CertificateAuthority {
    signing_key: SigningKey,
}

impl CertificateAuthority {
    pub fn generate() -> Self {
        CertificateAuthority {
            signing_key: SigningKey::from_bytes(&rand::random::<[u8; 32]>()),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        CertificateAuthority {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issue(&self, subject: &str, public_key: &VerifyingKey) -> Certificate {
        let public_key = public_key.to_bytes().to_vec();
        let issuer_signature = self
            .signing_key
            .sign(&Certificate::to_be_signed(subject, &public_key))
            .to_bytes()
            .to_vec();
        Certificate {
            subject: subject.to_string(),
            public_key,
            issuer_signature,
        }
    }
}

/// The local peer: its name, private key and encoded certificate.
#[derive(Clone)]
pub struct Identity {
    name: String,
    signing_key: SigningKey,
    certificate: Vec<u8>,
}

impl Identity {
    /// Creates a fresh key pair and has `authority` certify it under `name`.
    pub fn generate(name: &str, authority: &CertificateAuthority) -> Result<Self, serde_cbor::Error> {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let certificate = authority.issue(name, &signing_key.verifying_key()).to_bytes()?;
        Ok(Identity {
            name: name.to_string(),
            signing_key,
            certificate,
        })
    }

    /// Rebuilds an identity from a stored secret key and certificate.
    pub fn from_parts(secret: &[u8; 32], certificate: Vec<u8>) -> Result<Self, serde_cbor::Error> {
        let name = Certificate::from_bytes(&certificate)?.subject;
        Ok(Identity {
            name,
            signing_key: SigningKey::from_bytes(secret),
            certificate,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// [`CertificateService`] backed by ed25519 keys and a single trusted authority.
pub struct Ed25519CertificateService {
    identity: Identity,
    authority: VerifyingKey,
    admins: HashSet<String>,
    banned: RwLock<HashSet<Vec<u8>>>,
}

impl Ed25519CertificateService {
    pub fn new(identity: Identity, authority: VerifyingKey) -> Self {
        Ed25519CertificateService {
            identity,
            authority,
            admins: HashSet::new(),
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Subjects whose certificates carry administrator rights.
    pub fn with_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admins.extend(admins.into_iter().map(Into::into));
        self
    }

    /// Bans a certificate; signatures made with it stop verifying.
    pub fn ban_certificate(&self, certificate: &[u8]) {
        self.banned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Sha256::digest(certificate).to_vec());
    }

    fn parse_trusted(&self, certificate: &[u8]) -> Option<Certificate> {
        Certificate::from_bytes(certificate)
            .ok()
            .filter(|cert| cert.is_issued_by(&self.authority))
    }
}

impl CertificateService for Ed25519CertificateService {
    fn own_name(&self) -> &str {
        self.identity.name()
    }

    fn own_certificate(&self) -> &[u8] {
        self.identity.certificate()
    }

    fn sign_data(&self, data: &[u8]) -> Vec<u8> {
        self.identity.signing_key.sign(data).to_bytes().to_vec()
    }

    fn verify_signature(&self, data: &[u8], signature: &[u8], certificate: &[u8]) -> ValidationState {
        let Some(cert) = self.parse_trusted(certificate) else {
            return ValidationState::InvalidCertificate;
        };
        if self.is_banned_certificate(certificate) {
            return ValidationState::CertificateBanned;
        }
        let (Some(key), Ok(signature)) = (cert.verifying_key(), Signature::from_slice(signature)) else {
            return ValidationState::InvalidSignature;
        };
        match key.verify(data, &signature) {
            Ok(()) => ValidationState::Valid,
            Err(_) => ValidationState::InvalidSignature,
        }
    }

    fn is_valid_certificate(&self, certificate: &[u8]) -> bool {
        self.parse_trusted(certificate).is_some()
    }

    fn is_admin_certificate(&self, certificate: &[u8]) -> bool {
        self.parse_trusted(certificate)
            .map(|cert| self.admins.contains(&cert.subject))
            .unwrap_or(false)
    }

    fn is_banned_certificate(&self, certificate: &[u8]) -> bool {
        self.banned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(Sha256::digest(certificate).as_slice())
    }

    fn subject_name(&self, certificate: &[u8]) -> Option<String> {
        Certificate::from_bytes(certificate).ok().map(|cert| cert.subject)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A world with one authority; `peer` hands out services for named identities.
    pub(crate) struct TestWorld {
        pub authority: CertificateAuthority,
        pub admins: Vec<String>,
    }

    impl TestWorld {
        pub(crate) fn new() -> Self {
            TestWorld {
                authority: CertificateAuthority::generate(),
                admins: vec!["admin".to_string()],
            }
        }

        pub(crate) fn peer(&self, name: &str) -> Ed25519CertificateService {
            let identity = Identity::generate(name, &self.authority).unwrap();
            Ed25519CertificateService::new(identity, self.authority.verifying_key())
                .with_admins(self.admins.clone())
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let bob = world.peer("bob");
        let signature = alice.sign_data(b"data");
        assert_eq!(
            bob.verify_signature(b"data", &signature, alice.own_certificate()),
            ValidationState::Valid
        );
        assert_eq!(
            bob.verify_signature(b"tampered", &signature, alice.own_certificate()),
            ValidationState::InvalidSignature
        );
        assert_eq!(
            bob.verify_signature(b"data", &signature, bob.own_certificate()),
            ValidationState::InvalidSignature
        );
    }

    #[test]
    fn test_foreign_authority_is_invalid() {
        let world = TestWorld::new();
        let other_world = TestWorld::new();
        let alice = world.peer("alice");
        let mallory = other_world.peer("mallory");
        let signature = mallory.sign_data(b"data");
        assert!(!alice.is_valid_certificate(mallory.own_certificate()));
        assert_eq!(
            alice.verify_signature(b"data", &signature, mallory.own_certificate()),
            ValidationState::InvalidCertificate
        );
        assert!(!alice.is_valid_certificate(b"garbage"));
    }

    #[test]
    fn test_banned_certificate() {
        let world = TestWorld::new();
        let alice = world.peer("alice");
        let bob = world.peer("bob");
        let signature = bob.sign_data(b"data");
        alice.ban_certificate(bob.own_certificate());
        assert!(alice.is_banned_certificate(bob.own_certificate()));
        assert_eq!(
            alice.verify_signature(b"data", &signature, bob.own_certificate()),
            ValidationState::CertificateBanned
        );
    }

    #[test]
    fn test_admin_certificate() {
        let world = TestWorld::new();
        let admin = world.peer("admin");
        let alice = world.peer("alice");
        assert!(alice.is_admin_certificate(admin.own_certificate()));
        assert!(!alice.is_admin_certificate(alice.own_certificate()));
        assert_eq!(alice.subject_name(admin.own_certificate()).as_deref(), Some("admin"));
    }

    #[test]
    fn test_identity_from_parts() {
        let world = TestWorld::new();
        let identity = Identity::generate("carol", &world.authority).unwrap();
        let restored = Identity::from_parts(&identity.secret_bytes(), identity.certificate().to_vec()).unwrap();
        assert_eq!(restored.name(), "carol");
        let service = Ed25519CertificateService::new(restored, world.authority.verifying_key());
        let signature = service.sign_data(b"x");
        assert_eq!(
            service.verify_signature(b"x", &signature, identity.certificate()),
            ValidationState::Valid
        );
    }
}
