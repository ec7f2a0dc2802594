use std::convert::TryInto;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use super::{MAGIC_ALT_REQUEST, MAGIC_ALT_RESPONSE, MAGIC_REQUEST, MAGIC_RESPONSE};

pub const HEADER_LEN: usize = 24;

static OPAQUE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Produce the next opaque. The opaque is the sole correlation key between
/// a request and its response; it must never repeat while a request is in
/// flight, which a process-wide counter guarantees by construction.
pub fn next_opaque() -> u32 {
    OPAQUE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    InvalidMagic(u8),
    PacketTooSmall,
    BodySizeMismatch,
    TruncatedBody,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidMagic(magic) => write!(f, "Invalid magic byte: {}", magic),
            ProtocolError::PacketTooSmall => write!(f, "Packet smaller than the 24-byte header"),
            ProtocolError::BodySizeMismatch => {
                write!(f, "Body length does not match the header total")
            }
            ProtocolError::TruncatedBody => write!(f, "Body section lengths exceed the body"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    /// Only meaningful on alt-magic frames, where it displaces the high
    /// byte of the key length.
    pub framing_extras_length: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE || self.magic == MAGIC_ALT_RESPONSE
    }

    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Parse a response header from exactly [`HEADER_LEN`] bytes.
    pub fn read_response(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooSmall);
        }
        let magic = bytes[0];
        let (framing_extras_length, key_length) = match magic {
            MAGIC_RESPONSE => (0, u16::from_be_bytes(bytes[2..4].try_into().unwrap())),
            MAGIC_ALT_RESPONSE => (bytes[2], bytes[3] as u16),
            other => return Err(ProtocolError::InvalidMagic(other)),
        };
        Ok(Header {
            magic,
            opcode: bytes[1],
            framing_extras_length,
            key_length,
            extras_length: bytes[4],
            data_type: bytes[5],
            vbucket_or_status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }

    /// Split a body into its framing-extras/extras/key/value sections.
    pub fn read_packet(self, body: &[u8]) -> Result<Packet, ProtocolError> {
        if body.len() != self.body_len as usize {
            return Err(ProtocolError::BodySizeMismatch);
        }
        let sections =
            self.framing_extras_length as usize + self.extras_length as usize + self.key_length as usize;
        if sections > body.len() {
            return Err(ProtocolError::TruncatedBody);
        }

        let (framing_extras, body) = body.split_at(self.framing_extras_length as usize);
        let (extras, body) = body.split_at(self.extras_length as usize);
        let (key, value) = body.split_at(self.key_length as usize);

        Ok(Packet {
            header: self,
            framing_extras: Bytes::copy_from_slice(framing_extras),
            extras: Bytes::copy_from_slice(extras),
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        })
    }
}

/// One request or response frame. Section lengths in the header are kept
/// in sync by [`Packet::seal`].
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Packet {
    pub header: Header,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    /// Recompute the section lengths from the section buffers. Requests
    /// with framing extras are sealed under the alt magic.
    pub fn seal(&mut self) {
        if !self.framing_extras.is_empty() && self.header.magic == MAGIC_REQUEST {
            self.header.magic = MAGIC_ALT_REQUEST;
        }
        self.header.framing_extras_length = self.framing_extras.len() as u8;
        self.header.key_length = self.key.len() as u16;
        self.header.extras_length = self.extras.len() as u8;
        self.header.body_len = (self.framing_extras.len()
            + self.extras.len()
            + self.key.len()
            + self.value.len()) as u32;
    }

    /// Encode into `buf` without intermediate allocation; the caller hands
    /// in a reused buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.header.body_len as usize);
        buf.put_u8(self.header.magic);
        buf.put_u8(self.header.opcode);
        if self.header.magic == MAGIC_ALT_REQUEST || self.header.magic == MAGIC_ALT_RESPONSE {
            buf.put_u8(self.header.framing_extras_length);
            buf.put_u8(self.header.key_length as u8);
        } else {
            buf.put_u16(self.header.key_length);
        }
        buf.put_u8(self.header.extras_length);
        buf.put_u8(self.header.data_type);
        buf.put_u16(self.header.vbucket_or_status);
        buf.put_u32(self.header.body_len);
        buf.put_u32(self.header.opaque);
        buf.put_u64(self.header.cas);
        buf.put_slice(&self.framing_extras);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }

    pub fn status(&self) -> super::Status {
        super::Status::from(self.header.vbucket_or_status)
    }

    pub fn error_for_status(&self) -> Result<(), super::Status> {
        match self.header.vbucket_or_status {
            0 => Ok(()),
            it => Err(super::Status::from(it)),
        }
    }

    /// The mutation token a successful mutation carries in its extras
    /// once mutation-seqno support is negotiated.
    pub fn mutation_token(&self) -> Option<MutationToken> {
        if self.extras.len() < 16 {
            return None;
        }
        Some(MutationToken {
            vbucket_uuid: u64::from_be_bytes(self.extras[0..8].try_into().unwrap()),
            seqno: u64::from_be_bytes(self.extras[8..16].try_into().unwrap()),
        })
    }
}

/// Identifies a mutation within a vBucket's history, for observe-based
/// durability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket_uuid: u64,
    pub seqno: u64,
}
