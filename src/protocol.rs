use std::fmt;

use rand::RngCore;

use crate::certificate::CertificateService;
use crate::codec::{put_prefixed, truncate_chars, Reader};
use crate::constants::{MESSAGE_ID_LENGTH, MESSAGE_MAGIC, MESSAGE_STRING_MAX_LENGTH, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::job::{Job, JobId};
use crate::network::PeerId;

/// Wire tag of a management message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Undefined = 0,
    RequestJobList = 10,
    ResponseJobList = 11,
    RequestJob = 20,
    ResponseJob = 21,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Undefined),
            10 => Ok(MessageType::RequestJobList),
            11 => Ok(MessageType::ResponseJobList),
            20 => Ok(MessageType::RequestJob),
            21 => Ok(MessageType::ResponseJob),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fixed part of every message; the signature covers all of it except itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: [u8; MESSAGE_ID_LENGTH],
    pub message_type: MessageType,
    pub payload_length: u16,
    pub world_name: String,
    pub sender_name: String,
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Typed content of a message.
#[derive(Debug, Clone)]
pub enum MessageBody {
    /// Asks peers to announce the jobs they know.
    RequestJobList,
    /// Announces jobs, without payloads and epoch states.
    ResponseJobList(Vec<Job>),
    /// Asks for the full copy of one job.
    RequestJob(JobId),
    /// Carries the full copy of one job.
    ResponseJob(Box<Job>),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::RequestJobList => MessageType::RequestJobList,
            MessageBody::ResponseJobList(_) => MessageType::ResponseJobList,
            MessageBody::RequestJob(_) => MessageType::RequestJob,
            MessageBody::ResponseJob(_) => MessageType::ResponseJob,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            MessageBody::RequestJobList => Ok(Vec::new()),
            MessageBody::ResponseJobList(jobs) => {
                let count = u16::try_from(jobs.len()).map_err(|_| ProtocolError::FieldTooLong {
                    field: "job list",
                    len: jobs.len(),
                    max: u16::MAX as usize,
                })?;
                let mut out = count.to_le_bytes().to_vec();
                for job in jobs {
                    put_prefixed(&mut out, &job.serialize()?, "job list entry")?;
                }
                Ok(out)
            }
            MessageBody::RequestJob(job_id) => Ok(job_id.to_bytes()),
            MessageBody::ResponseJob(job) => job.serialize(),
        }
    }

    fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        match message_type {
            MessageType::Undefined => Err(ProtocolError::UndefinedMessageType),
            MessageType::RequestJobList => Ok(MessageBody::RequestJobList),
            MessageType::ResponseJobList => {
                let mut reader = Reader::new(payload);
                let count = reader.read_u16("job list count")?;
                let jobs = (0..count)
                    .map(|_| Job::deserialize(reader.read_prefixed("job list entry")?))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MessageBody::ResponseJobList(jobs))
            }
            MessageType::RequestJob => Ok(MessageBody::RequestJob(JobId::from_bytes(payload)?)),
            MessageType::ResponseJob => Ok(MessageBody::ResponseJob(Box::new(Job::deserialize(payload)?))),
        }
    }
}

/// A framed, optionally signed management message.
///
/// ```text
/// magic(10) | version(1) | message id(16) | type(1) | payload length(u16)
///   | world(u16 + utf8) | sender(u16 + utf8) | certificate(u16 + bytes)
///   | signature(u16 + bytes) | payload
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    pub version: u8,
    pub header: MessageHeader,
    pub body: MessageBody,
    /// Payload bytes as sent or received; signatures are checked over these.
    payload: Vec<u8>,
    /// Peer the message came from, set by the receiving side.
    pub peer_id: Option<PeerId>,
}

impl Message {
    /// Builds an unsigned message with a fresh random id.
    pub fn new(body: MessageBody) -> Result<Self, ProtocolError> {
        let payload = body.encode()?;
        let payload_length = u16::try_from(payload.len()).map_err(|_| ProtocolError::FieldTooLong {
            field: "message payload",
            len: payload.len(),
            max: u16::MAX as usize,
        })?;
        let mut message_id = [0u8; MESSAGE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut message_id);
        Ok(Message {
            version: PROTOCOL_VERSION,
            header: MessageHeader {
                message_id,
                message_type: body.message_type(),
                payload_length,
                world_name: String::new(),
                sender_name: String::new(),
                certificate: Vec::new(),
                signature: Vec::new(),
            },
            body,
            payload,
            peer_id: None,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn encode(&self, signature: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let header = &self.header;
        let mut out = Vec::with_capacity(64 + header.certificate.len() + signature.len() + self.payload.len());
        out.extend_from_slice(MESSAGE_MAGIC);
        out.push(self.version);
        out.extend_from_slice(&header.message_id);
        out.push(header.message_type as u8);
        out.extend_from_slice(&header.payload_length.to_le_bytes());
        put_prefixed(
            &mut out,
            truncate_chars(&header.world_name, MESSAGE_STRING_MAX_LENGTH).as_bytes(),
            "world name",
        )?;
        put_prefixed(
            &mut out,
            truncate_chars(&header.sender_name, MESSAGE_STRING_MAX_LENGTH).as_bytes(),
            "sender name",
        )?;
        put_prefixed(&mut out, &header.certificate, "certificate")?;
        put_prefixed(&mut out, signature, "signature")?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode(&self.header.signature)
    }

    /// The frame with an empty signature field: what gets signed and verified.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode(&[])
    }

    /// Stamps the local identity into the header and signs the frame.
    pub fn sign(&mut self, certificates: &dyn CertificateService) -> Result<(), ProtocolError> {
        self.header.sender_name = truncate_chars(certificates.own_name(), MESSAGE_STRING_MAX_LENGTH).to_string();
        self.header.certificate = certificates.own_certificate().to_vec();
        self.header.signature.clear();
        let data = self.signable_bytes()?;
        self.header.signature = certificates.sign_data(&data);
        Ok(())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(data);
        let magic = reader.read_bytes(MESSAGE_MAGIC.len(), "magic number")?;
        if magic != MESSAGE_MAGIC {
            return Err(ProtocolError::BadMagic(magic.to_vec()));
        }
        let version = reader.read_u8("version")?;
        if version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                received: version,
                supported: PROTOCOL_VERSION,
            });
        }
        let message_id = reader.read_array::<MESSAGE_ID_LENGTH>("message id")?;
        let message_type = MessageType::try_from(reader.read_u8("message type")?)?;
        if message_type == MessageType::Undefined {
            return Err(ProtocolError::UndefinedMessageType);
        }
        let payload_length = reader.read_u16("payload length")?;
        let world_name = reader.read_prefixed_string("world name")?;
        let sender_name = reader.read_prefixed_string("sender name")?;
        let certificate = reader.read_prefixed("certificate")?.to_vec();
        let signature = reader.read_prefixed("signature")?.to_vec();
        if reader.remaining() != payload_length as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                announced: payload_length as usize,
                available: reader.remaining(),
            });
        }
        let payload = reader.read_rest().to_vec();
        let body = MessageBody::decode(message_type, &payload)?;
        Ok(Message {
            version,
            header: MessageHeader {
                message_id,
                message_type,
                payload_length,
                world_name,
                sender_name,
                certificate,
                signature,
            },
            body,
            payload,
            peer_id: None,
        })
    }

    pub fn into_job(self) -> Result<Job, ProtocolError> {
        match self.body {
            MessageBody::ResponseJob(job) => Ok(*job),
            _ => Err(ProtocolError::UnexpectedMessageType(self.header.message_type)),
        }
    }
}
