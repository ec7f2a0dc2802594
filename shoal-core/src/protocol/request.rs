//! Request builders. Every request specifies a subset of frame fields;
//! the [`Request`] trait defaults the rest and converts into a sealed
//! [`Packet`] ready for the wire (opaque is assigned at dispatch time by
//! the connection).

use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use super::{opcode, write_uleb128, DurabilityLevel, Packet, MAGIC_REQUEST};

/// Framing-extra id for a durability requirement.
const FRAME_DURABILITY: u8 = 0x01;

pub trait Request {
    fn opcode(&self) -> u8;

    fn vbucket_id(&self) -> Option<u16> {
        None
    }

    fn cas(&self) -> u64 {
        0
    }

    fn data_type(&self) -> u8 {
        0
    }

    fn framing_extras(&mut self) -> Bytes {
        Bytes::new()
    }

    fn extras(&mut self) -> Bytes {
        Bytes::new()
    }

    fn key(&mut self) -> Bytes {
        Bytes::new()
    }

    fn value(&mut self) -> Bytes {
        Bytes::new()
    }
}

impl<R: Request> From<&mut R> for Packet {
    fn from(req: &mut R) -> Self {
        let mut packet = Packet::default();
        packet.header.magic = MAGIC_REQUEST;
        packet.header.opcode = req.opcode();
        packet.header.vbucket_or_status = req.vbucket_id().unwrap_or(0);
        packet.header.cas = req.cas();
        packet.header.data_type = req.data_type();
        packet.framing_extras = req.framing_extras();
        packet.extras = req.extras();
        packet.key = req.key();
        packet.value = req.value();
        packet.seal();
        packet
    }
}

/// A document key, optionally qualified by a collection id once the
/// collections feature is negotiated.
#[derive(Debug, Clone)]
pub struct DocKey {
    pub key: Vec<u8>,
    pub cid: Option<u32>,
}

impl DocKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        DocKey {
            key: key.into(),
            cid: None,
        }
    }

    pub fn in_collection(key: impl Into<Vec<u8>>, cid: u32) -> Self {
        DocKey {
            key: key.into(),
            cid: Some(cid),
        }
    }

    pub(crate) fn encode_key(&mut self) -> Bytes {
        match self.cid {
            None => Bytes::from(mem::take(&mut self.key)),
            Some(cid) => {
                let mut buf = Vec::with_capacity(self.key.len() + 5);
                write_uleb128(&mut buf, cid);
                buf.append(&mut self.key);
                Bytes::from(buf)
            }
        }
    }
}

fn durability_frame(level: Option<DurabilityLevel>) -> Bytes {
    match level {
        None => Bytes::new(),
        Some(level) => {
            let mut buf = BytesMut::with_capacity(2);
            buf.put_u8((FRAME_DURABILITY << 4) | 0x01);
            buf.put_u8(level.into());
            buf.freeze()
        }
    }
}

/// Plain lookups: get, get-and-touch, get-and-lock.
#[derive(Debug)]
pub struct GetRequest {
    opcode: u8,
    key: DocKey,
    vbucket: u16,
    expiry: Option<u32>,
}

impl GetRequest {
    pub fn new(key: DocKey, vbucket: u16) -> Self {
        GetRequest {
            opcode: opcode::GET,
            key,
            vbucket,
            expiry: None,
        }
    }

    /// Get and refresh the expiry in one round trip.
    pub fn new_and_touch(key: DocKey, vbucket: u16, expiry: u32) -> Self {
        GetRequest {
            opcode: opcode::GET_AND_TOUCH,
            key,
            vbucket,
            expiry: Some(expiry),
        }
    }

    /// Get and lock the document for `lock_time` seconds; the returned CAS
    /// is required to unlock or mutate.
    pub fn new_and_lock(key: DocKey, vbucket: u16, lock_time: u32) -> Self {
        GetRequest {
            opcode: opcode::GET_AND_LOCK,
            key,
            vbucket,
            expiry: Some(lock_time),
        }
    }
}

impl Request for GetRequest {
    fn opcode(&self) -> u8 {
        self.opcode
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn extras(&mut self) -> Bytes {
        match self.expiry {
            None => Bytes::new(),
            Some(expiry) => Bytes::copy_from_slice(&expiry.to_be_bytes()),
        }
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }
}

/// Full-document mutations: set, add, replace, append, prepend.
#[derive(Debug)]
pub struct StoreRequest {
    opcode: u8,
    key: DocKey,
    value: Vec<u8>,
    vbucket: u16,
    flags: u32,
    expiry: u32,
    cas: u64,
    data_type: u8,
    durability: Option<DurabilityLevel>,
}

impl StoreRequest {
    pub fn new(opcode: u8, key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        StoreRequest {
            opcode,
            key,
            value,
            vbucket,
            flags: 0,
            expiry: 0,
            cas: 0,
            data_type: super::datatype::RAW,
            durability: None,
        }
    }

    pub fn upsert(key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        Self::new(opcode::SET, key, value, vbucket)
    }

    pub fn insert(key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        Self::new(opcode::ADD, key, value, vbucket)
    }

    pub fn replace(key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        Self::new(opcode::REPLACE, key, value, vbucket)
    }

    pub fn append(key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        Self::new(opcode::APPEND, key, value, vbucket)
    }

    pub fn prepend(key: DocKey, value: Vec<u8>, vbucket: u16) -> Self {
        Self::new(opcode::PREPEND, key, value, vbucket)
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_data_type(mut self, data_type: u8) -> Self {
        self.data_type = data_type;
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

impl Request for StoreRequest {
    fn opcode(&self) -> u8 {
        self.opcode
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn cas(&self) -> u64 {
        self.cas
    }

    fn data_type(&self) -> u8 {
        self.data_type
    }

    fn framing_extras(&mut self) -> Bytes {
        durability_frame(self.durability)
    }

    fn extras(&mut self) -> Bytes {
        // Append/prepend carry no extras on the wire.
        if self.opcode == opcode::APPEND || self.opcode == opcode::PREPEND {
            return Bytes::new();
        }
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.flags);
        buf.put_u32(self.expiry);
        buf.freeze()
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }

    fn value(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.value))
    }
}

#[derive(Debug)]
pub struct DeleteRequest {
    key: DocKey,
    vbucket: u16,
    cas: u64,
    durability: Option<DurabilityLevel>,
}

impl DeleteRequest {
    pub fn new(key: DocKey, vbucket: u16) -> Self {
        DeleteRequest {
            key,
            vbucket,
            cas: 0,
            durability: None,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
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

impl Request for DeleteRequest {
    fn opcode(&self) -> u8 {
        opcode::DELETE
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn cas(&self) -> u64 {
        self.cas
    }

    fn framing_extras(&mut self) -> Bytes {
        durability_frame(self.durability)
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }
}

/// Increment/decrement of a numeric document.
#[derive(Debug)]
pub struct CounterRequest {
    opcode: u8,
    key: DocKey,
    vbucket: u16,
    delta: u64,
    initial: u64,
    expiry: u32,
    durability: Option<DurabilityLevel>,
}

impl CounterRequest {
    pub fn increment(key: DocKey, vbucket: u16, delta: u64) -> Self {
        CounterRequest {
            opcode: opcode::INCREMENT,
            key,
            vbucket,
            delta,
            initial: 0,
            expiry: 0xffff_ffff,
            durability: None,
        }
    }

    pub fn decrement(key: DocKey, vbucket: u16, delta: u64) -> Self {
        CounterRequest {
            opcode: opcode::DECREMENT,
            ..Self::increment(key, vbucket, delta)
        }
    }

    /// Seed the counter when the document does not exist yet. Without this
    /// the server fails a missing key with KeyNotFound.
    pub fn with_initial(mut self, initial: u64, expiry: u32) -> Self {
        self.initial = initial;
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

impl Request for CounterRequest {
    fn opcode(&self) -> u8 {
        self.opcode
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn framing_extras(&mut self) -> Bytes {
        durability_frame(self.durability)
    }

    fn extras(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u64(self.delta);
        buf.put_u64(self.initial);
        buf.put_u32(self.expiry);
        buf.freeze()
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }
}

#[derive(Debug)]
pub struct TouchRequest {
    key: DocKey,
    vbucket: u16,
    expiry: u32,
}

impl TouchRequest {
    pub fn new(key: DocKey, vbucket: u16, expiry: u32) -> Self {
        TouchRequest {
            key,
            vbucket,
            expiry,
        }
    }
}

impl Request for TouchRequest {
    fn opcode(&self) -> u8 {
        opcode::TOUCH
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn extras(&mut self) -> Bytes {
        Bytes::copy_from_slice(&self.expiry.to_be_bytes())
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }
}

/// Release a lock taken by get-and-lock; the CAS must match the one the
/// lock returned.
#[derive(Debug)]
pub struct UnlockRequest {
    key: DocKey,
    vbucket: u16,
    cas: u64,
}

impl UnlockRequest {
    pub fn new(key: DocKey, vbucket: u16, cas: u64) -> Self {
        UnlockRequest { key, vbucket, cas }
    }
}

impl Request for UnlockRequest {
    fn opcode(&self) -> u8 {
        opcode::UNLOCK
    }

    fn vbucket_id(&self) -> Option<u16> {
        Some(self.vbucket)
    }

    fn cas(&self) -> u64 {
        self.cas
    }

    fn key(&mut self) -> Bytes {
        self.key.encode_key()
    }
}

/// Poll replication/persistence state of a key on one vBucket.
#[derive(Debug)]
pub struct ObserveRequest {
    key: DocKey,
    vbucket: u16,
}

impl ObserveRequest {
    pub fn new(key: DocKey, vbucket: u16) -> Self {
        ObserveRequest { key, vbucket }
    }
}

impl Request for ObserveRequest {
    fn opcode(&self) -> u8 {
        opcode::OBSERVE
    }

    fn value(&mut self) -> Bytes {
        let key = self.key.encode_key();
        let mut buf = BytesMut::with_capacity(4 + key.len());
        buf.put_u16(self.vbucket);
        buf.put_u16(key.len() as u16);
        buf.put_slice(&key);
        buf.freeze()
    }
}

#[derive(Debug)]
pub struct NoopRequest;

impl Request for NoopRequest {
    fn opcode(&self) -> u8 {
        opcode::NOOP
    }
}

/// HELLO feature negotiation. The value is the requested feature codes;
/// the response value is the accepted subset.
#[derive(Debug)]
pub struct HelloRequest {
    client_name: String,
    features: Vec<u16>,
}

impl HelloRequest {
    pub fn new(client_name: impl Into<String>, features: Vec<u16>) -> Self {
        HelloRequest {
            client_name: client_name.into(),
            features,
        }
    }

    pub fn parse_features(value: &[u8]) -> Vec<u16> {
        value
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }
}

impl Request for HelloRequest {
    fn opcode(&self) -> u8 {
        opcode::HELLO
    }

    fn key(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.client_name).into_bytes())
    }

    fn value(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.features.len() * 2);
        for feature in &self.features {
            buf.put_u16(*feature);
        }
        buf.freeze()
    }
}

#[derive(Debug)]
pub struct SaslListMechsRequest;

impl Request for SaslListMechsRequest {
    fn opcode(&self) -> u8 {
        opcode::SASL_LIST_MECHS
    }
}

#[derive(Debug)]
pub struct SaslAuthRequest {
    mechanism: String,
    payload: Vec<u8>,
}

impl SaslAuthRequest {
    pub fn new(mechanism: impl Into<String>, payload: Vec<u8>) -> Self {
        SaslAuthRequest {
            mechanism: mechanism.into(),
            payload,
        }
    }
}

impl Request for SaslAuthRequest {
    fn opcode(&self) -> u8 {
        opcode::SASL_AUTH
    }

    fn key(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.mechanism).into_bytes())
    }

    fn value(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.payload))
    }
}

#[derive(Debug)]
pub struct SaslStepRequest {
    mechanism: String,
    payload: Vec<u8>,
}

impl SaslStepRequest {
    pub fn new(mechanism: impl Into<String>, payload: Vec<u8>) -> Self {
        SaslStepRequest {
            mechanism: mechanism.into(),
            payload,
        }
    }
}

impl Request for SaslStepRequest {
    fn opcode(&self) -> u8 {
        opcode::SASL_STEP
    }

    fn key(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.mechanism).into_bytes())
    }

    fn value(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.payload))
    }
}

/// Bind the session to one bucket's namespace.
#[derive(Debug)]
pub struct SelectBucketRequest {
    bucket: String,
}

impl SelectBucketRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        SelectBucketRequest {
            bucket: bucket.into(),
        }
    }
}

impl Request for SelectBucketRequest {
    fn opcode(&self) -> u8 {
        opcode::SELECT_BUCKET
    }

    fn key(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.bucket).into_bytes())
    }
}

#[derive(Debug)]
pub struct GetErrorMapRequest {
    version: u16,
}

impl GetErrorMapRequest {
    pub fn new(version: u16) -> Self {
        GetErrorMapRequest { version }
    }
}

impl Request for GetErrorMapRequest {
    fn opcode(&self) -> u8 {
        opcode::GET_ERROR_MAP
    }

    fn value(&mut self) -> Bytes {
        Bytes::copy_from_slice(&self.version.to_be_bytes())
    }
}

/// Fetch the authoritative cluster map; scoped to the selected bucket, or
/// global when no bucket is selected.
#[derive(Debug)]
pub struct GetClusterConfigRequest;

impl Request for GetClusterConfigRequest {
    fn opcode(&self) -> u8 {
        opcode::GET_CLUSTER_CONFIG
    }
}

#[derive(Debug)]
pub struct GetCollectionsManifestRequest;

impl Request for GetCollectionsManifestRequest {
    fn opcode(&self) -> u8 {
        opcode::GET_COLLECTIONS_MANIFEST
    }
}

/// Resolve `"scope.collection"` to a collection id.
#[derive(Debug)]
pub struct GetCidRequest {
    path: String,
}

impl GetCidRequest {
    pub fn new(scope: &str, collection: &str) -> Self {
        GetCidRequest {
            path: format!("{}.{}", scope, collection),
        }
    }

    /// The response carries the manifest uid and the cid in the extras.
    pub fn parse_cid(extras: &[u8]) -> Option<u32> {
        if extras.len() < 12 {
            return None;
        }
        Some(u32::from_be_bytes([
            extras[8], extras[9], extras[10], extras[11],
        ]))
    }
}

impl Request for GetCidRequest {
    fn opcode(&self) -> u8 {
        opcode::GET_COLLECTION_ID
    }

    fn value(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.path).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{DocKey, GetRequest, Request, StoreRequest};
    use crate::protocol::{DurabilityLevel, Packet, MAGIC_ALT_REQUEST, MAGIC_REQUEST};

    #[test]
    fn test_get_request_frame() {
        let mut req = GetRequest::new(DocKey::new("Hello"), 0x02aa);
        let packet = Packet::from(&mut req);
        assert_eq!(MAGIC_REQUEST, packet.header.magic);
        assert_eq!(0x02aa, packet.header.vbucket_or_status);
        assert_eq!(5, packet.header.key_length);
        assert_eq!(5, packet.header.body_len);
    }

    #[test]
    fn test_store_request_extras() {
        let mut req = StoreRequest::upsert(DocKey::new("key"), b"value".to_vec(), 9)
            .with_flags(0xdead_beef)
            .with_expiry(0x1c20);
        let packet = Packet::from(&mut req);
        assert_eq!(
            vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x1c, 0x20],
            packet.extras.to_vec()
        );
        assert_eq!(8 + 3 + 5, packet.header.body_len);
    }

    #[test]
    fn test_durable_store_uses_alt_magic() {
        let mut req = StoreRequest::upsert(DocKey::new("k"), b"v".to_vec(), 0)
            .with_durability(DurabilityLevel::Majority);
        let packet = Packet::from(&mut req);
        assert_eq!(MAGIC_ALT_REQUEST, packet.header.magic);
        assert_eq!(vec![0x11, 0x01], packet.framing_extras.to_vec());
        assert_eq!(2, packet.header.framing_extras_length);

        let mut buf = BytesMut::new();
        packet.write_to(&mut buf);
        // framing length and key length share the third/fourth bytes
        assert_eq!(2, buf[2]);
        assert_eq!(1, buf[3]);
    }

    #[test]
    fn test_collection_key_prefix() {
        let mut req = GetRequest::new(DocKey::in_collection("doc", 0x88), 0);
        let packet = Packet::from(&mut req);
        assert_eq!(vec![0x88, 0x01, b'd', b'o', b'c'], packet.key.to_vec());
    }
}
