//! Sub-document operations: lookups and mutations addressing JSON paths
//! inside a document without shipping the whole value. Multiple specs
//! travel in one frame; each spec carries its own status in the response.

use std::convert::TryInto;
use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use super::request::{DocKey, Request};
use super::{opcode, subdoc_opcode, DurabilityLevel, Packet, Status};
use crate::error::Error;

/// Path flags.
pub const FLAG_CREATE_PATH: u8 = 0x01;
pub const FLAG_XATTR_PATH: u8 = 0x04;
pub const FLAG_EXPAND_MACROS: u8 = 0x10;

/// Document flags (carried in the frame extras).
pub const DOC_FLAG_MKDOC: u8 = 0x01;
pub const DOC_FLAG_ADD: u8 = 0x02;
pub const DOC_FLAG_ACCESS_DELETED: u8 = 0x04;

const FRAME_DURABILITY: u8 = 0x01;

/// One path of a multi-lookup.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    pub op: u8,
    pub flags: u8,
    pub path: String,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: subdoc_opcode::GET,
            flags: 0,
            path: path.into(),
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: subdoc_opcode::EXISTS,
            flags: 0,
            path: path.into(),
        }
    }

    pub fn count(path: impl Into<String>) -> Self {
        LookupInSpec {
            op: subdoc_opcode::GET_COUNT,
            flags: 0,
            path: path.into(),
        }
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= FLAG_XATTR_PATH;
        self
    }
}

/// One path of a multi-mutation.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    pub op: u8,
    pub flags: u8,
    pub path: String,
    pub value: Vec<u8>,
}

impl MutateInSpec {
    pub fn new(op: u8, path: impl Into<String>, value: Vec<u8>) -> Self {
        MutateInSpec {
            op,
            flags: 0,
            path: path.into(),
            value,
        }
    }

    pub fn upsert(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(subdoc_opcode::DICT_UPSERT, path, value)
    }

    pub fn insert(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(subdoc_opcode::DICT_ADD, path, value)
    }

    pub fn replace(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(subdoc_opcode::REPLACE, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(subdoc_opcode::DELETE, path, Vec::new())
    }

    pub fn array_append(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(subdoc_opcode::ARRAY_PUSH_LAST, path, value)
    }

    pub fn array_prepend(path: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(subdoc_opcode::ARRAY_PUSH_FIRST, path, value)
    }

    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self::new(
            subdoc_opcode::COUNTER,
            path,
            delta.to_string().into_bytes(),
        )
    }

    pub fn create_path(mut self) -> Self {
        self.flags |= FLAG_CREATE_PATH;
        self
    }

    pub fn xattr(mut self) -> Self {
        self.flags |= FLAG_XATTR_PATH;
        self
    }
}

#[derive(Debug)]
pub struct MultiLookupRequest {
    key: DocKey,
    vbucket: u16,
    specs: Vec<LookupInSpec>,
    doc_flags: u8,
}

impl MultiLookupRequest {
    pub fn new(key: DocKey, vbucket: u16, specs: Vec<LookupInSpec>) -> Self {
        MultiLookupRequest {
            key,
            vbucket,
            specs,
            doc_flags: 0,
        }
    }

    pub fn access_deleted(mut self) -> Self {
        self.doc_flags |= DOC_FLAG_ACCESS_DELETED;
        self
    }
}

impl Request for MultiLookupRequest {
    fn opcode(&self) -> u8 {
        opcode::SUBDOC_MULTI_LOOKUP
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn extras(&mut self) -> Bytes {
        if self.doc_flags == 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(&[self.doc_flags])
        }
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }

    fn value(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        for spec in &self.specs {
            buf.put_u8(spec.op);
            buf.put_u8(spec.flags);
            buf.put_u16(spec.path.len() as u16);
            buf.put_slice(spec.path.as_bytes());
        }
        buf.freeze()
    }
}

#[derive(Debug)]
pub struct MultiMutationRequest {
    key: DocKey,
    vbucket: u16,
    specs: Vec<MutateInSpec>,
    doc_flags: u8,
    cas: u64,
    expiry: u32,
    durability: Option<DurabilityLevel>,
}

impl MultiMutationRequest {
    pub fn new(key: DocKey, vbucket: u16, specs: Vec<MutateInSpec>) -> Self {
        MultiMutationRequest {
            key,
            vbucket,
            specs,
            doc_flags: 0,
            cas: 0,
            expiry: 0,
            durability: None,
        }
    }

    pub fn upsert_document(mut self) -> Self {
        self.doc_flags |= DOC_FLAG_MKDOC;
        self
    }

    pub fn insert_document(mut self) -> Self {
        self.doc_flags |= DOC_FLAG_ADD;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = Some(level);
        self
    }

    pub fn has_durability(&self) -> bool {
        self.durability.is_some()
    }
}

impl Request for MultiMutationRequest {
    fn opcode(&self) -> u8 {
        opcode::SUBDOC_MULTI_MUTATION
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn cas(&self) -> u64 {
        self.cas
    }

    fn framing_extras(&mut self) -> Bytes {
        match self.durability {
            None => Bytes::new(),
            Some(level) => {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u8((FRAME_DURABILITY << 4) | 0x01);
                buf.put_u8(level.into());
                buf.freeze()
            }
        }
    }

    fn extras(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        if self.expiry != 0 {
            buf.put_u32(self.expiry);
        }
        if self.doc_flags != 0 {
            buf.put_u8(self.doc_flags);
        }
        buf.freeze()
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }

    fn value(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        for spec in &mut self.specs {
            buf.put_u8(spec.op);
            buf.put_u8(spec.flags);
            buf.put_u16(spec.path.len() as u16);
            buf.put_u32(spec.value.len() as u32);
            buf.put_slice(spec.path.as_bytes());
            buf.put_slice(&mem::take(&mut spec.value));
        }
        buf.freeze()
    }
}

/// One decoded field of a multi-lookup/mutation response. The overall
/// operation succeeds even when individual paths fail; a path error only
/// surfaces when the field's value is read.
#[derive(Debug, Clone)]
pub struct SubdocField {
    pub index: usize,
    pub status: Status,
    value: Bytes,
}

impl SubdocField {
    pub fn exists(&self) -> bool {
        self.status.is_success()
    }

    pub fn value(&self) -> Result<&Bytes, Error> {
        if self.status.is_success() {
            Ok(&self.value)
        } else {
            Err(Error::SubdocPath {
                index: self.index,
                status: self.status,
            })
        }
    }
}

/// Decode a multi-lookup response body: per spec, a status and a value.
pub fn decode_lookup_fields(packet: &Packet) -> Result<Vec<SubdocField>, Error> {
    let mut fields = Vec::new();
    let mut body = &packet.value[..];
    let mut index = 0;
    while body.len() >= 6 {
        let status = u16::from_be_bytes(body[0..2].try_into().unwrap());
        let len = u32::from_be_bytes(body[2..6].try_into().unwrap()) as usize;
        if body.len() < 6 + len {
            return Err(Error::Protocol(super::ProtocolError::TruncatedBody));
        }
        fields.push(SubdocField {
            index,
            status: Status::from(status),
            value: Bytes::copy_from_slice(&body[6..6 + len]),
        });
        body = &body[6 + len..];
        index += 1;
    }
    Ok(fields)
}

/// Decode a multi-mutation response body: entries appear only for paths
/// that failed or returned a value (counters), keyed by spec index.
pub fn decode_mutation_fields(
    packet: &Packet,
    spec_count: usize,
) -> Result<Vec<SubdocField>, Error> {
    let mut fields: Vec<SubdocField> = (0..spec_count)
        .map(|index| SubdocField {
            index,
            status: Status::Success,
            value: Bytes::new(),
        })
        .collect();

    let mut body = &packet.value[..];
    while body.len() >= 3 {
        let index = body[0] as usize;
        let status = Status::from(u16::from_be_bytes(body[1..3].try_into().unwrap()));
        let mut len = 0;
        if status.is_success() {
            if body.len() < 7 {
                return Err(Error::Protocol(super::ProtocolError::TruncatedBody));
            }
            len = u32::from_be_bytes(body[3..7].try_into().unwrap()) as usize;
            if body.len() < 7 + len {
                return Err(Error::Protocol(super::ProtocolError::TruncatedBody));
            }
            if let Some(field) = fields.get_mut(index) {
                field.value = Bytes::copy_from_slice(&body[7..7 + len]);
            }
            body = &body[7..];
        } else {
            if let Some(field) = fields.get_mut(index) {
                field.status = status;
            }
            body = &body[3..];
        }
        body = &body[len..];
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        decode_lookup_fields, decode_mutation_fields, LookupInSpec, MultiLookupRequest,
        MutateInSpec, MultiMutationRequest,
    };
    use crate::protocol::request::{DocKey, Request};
    use crate::protocol::{subdoc_opcode, Packet, Status};

    #[test]
    fn test_lookup_body_layout() {
        let mut req = MultiLookupRequest::new(
            DocKey::new("doc"),
            7,
            vec![LookupInSpec::get("name"), LookupInSpec::exists("tags[0]")],
        );
        let packet = Packet::from(&mut req);
        let body = packet.value.to_vec();
        assert_eq!(subdoc_opcode::GET, body[0]);
        assert_eq!(0, body[1]);
        assert_eq!([0, 4], body[2..4]);
        assert_eq!(b"name", &body[4..8]);
        assert_eq!(subdoc_opcode::EXISTS, body[8]);
    }

    #[test]
    fn test_mutation_body_layout() {
        let mut req = MultiMutationRequest::new(
            DocKey::new("doc"),
            7,
            vec![MutateInSpec::upsert("name", b"\"x\"".to_vec())],
        );
        let packet = Packet::from(&mut req);
        let body = packet.value.to_vec();
        assert_eq!(subdoc_opcode::DICT_UPSERT, body[0]);
        assert_eq!([0, 4], body[2..4]);
        assert_eq!([0, 0, 0, 3], body[4..8]);
        assert_eq!(b"name\"x\"", &body[8..]);
    }

    #[test]
    fn test_decode_lookup_mixed_statuses() {
        let mut packet = Packet::default();
        let mut body = Vec::new();
        body.extend_from_slice(&0_u16.to_be_bytes());
        body.extend_from_slice(&4_u32.to_be_bytes());
        body.extend_from_slice(b"true");
        body.extend_from_slice(&0xc0_u16.to_be_bytes());
        body.extend_from_slice(&0_u32.to_be_bytes());
        packet.value = Bytes::from(body);

        let fields = decode_lookup_fields(&packet).unwrap();
        assert_eq!(2, fields.len());
        assert_eq!(b"true", &fields[0].value().unwrap()[..]);
        assert_eq!(Status::SubdocPathNotFound, fields[1].status);
        assert!(fields[1].value().is_err());
    }

    #[test]
    fn test_decode_mutation_failure_entry() {
        let mut packet = Packet::default();
        let mut body = Vec::new();
        body.push(1);
        body.extend_from_slice(&0xc9_u16.to_be_bytes());
        packet.value = Bytes::from(body);

        let fields = decode_mutation_fields(&packet, 3).unwrap();
        assert_eq!(3, fields.len());
        assert!(fields[0].exists());
        assert_eq!(Status::SubdocPathExists, fields[1].status);
        assert!(fields[2].exists());
    }
}
