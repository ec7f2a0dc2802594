//! In-process protocol responders for tests, built on duplex pipes
//! instead of real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use crate::connection::{Connector, Endpoint};
use crate::error::Error;
use crate::protocol::{opcode, Header, Packet, HEADER_LEN, MAGIC_ALT_REQUEST, MAGIC_RESPONSE};

/// A success response frame echoing the request's opcode and opaque.
pub(crate) fn respond_success(request: &Packet) -> Packet {
    let mut response = Packet::default();
    response.header.magic = MAGIC_RESPONSE;
    response.header.opcode = request.header.opcode;
    response.header.opaque = request.header.opaque;
    response.seal();
    response
}

pub(crate) fn respond_status(request: &Packet, status: u16, value: Bytes) -> Packet {
    let mut response = respond_success(request);
    response.header.vbucket_or_status = status;
    response.value = value;
    response.seal();
    response
}

/// A minimal two-node bucket config for topology tests; `rev` and `name`
/// are parameterized so revision ordering can be exercised.
pub(crate) fn sample_config_json(rev: u64, name: &str) -> String {
    format!(
        r#"{{
            "rev": {rev},
            "name": "{name}",
            "nodeLocator": "vbucket",
            "bucketCapabilities": ["collections"],
            "nodesExt": [
                {{"services": {{"kv": 11210, "mgmt": 8091, "n1ql": 8093}}, "hostname": "node-1"}},
                {{"services": {{"kv": 11210, "mgmt": 8091, "capi": 8092}}, "hostname": "node-2"}}
            ],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["node-1:11210", "node-2:11210"],
                "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, 0], [0, -1], [1, 0], [0, 1], [1, 0]]
            }}
        }}"#,
        rev = rev,
        name = name,
    )
}

async fn read_request(
    reader: &mut tokio::io::ReadHalf<DuplexStream>,
) -> std::io::Result<Packet> {
    let mut head = [0_u8; HEADER_LEN];
    reader.read_exact(&mut head).await?;
    let magic = head[0];
    let (framing_extras_length, key_length) = if magic == MAGIC_ALT_REQUEST {
        (head[2], head[3] as u16)
    } else {
        (0, u16::from_be_bytes([head[2], head[3]]))
    };
    let header = Header {
        magic,
        opcode: head[1],
        framing_extras_length,
        key_length,
        extras_length: head[4],
        data_type: head[5],
        vbucket_or_status: u16::from_be_bytes([head[6], head[7]]),
        body_len: u32::from_be_bytes([head[8], head[9], head[10], head[11]]),
        opaque: u32::from_be_bytes([head[12], head[13], head[14], head[15]]),
        cas: u64::from_be_bytes([
            head[16], head[17], head[18], head[19], head[20], head[21], head[22], head[23],
        ]),
    };
    let mut body = vec![0_u8; header.body_len as usize];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    header
        .read_packet(&body)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}

async fn write_response(
    writer: &Arc<Mutex<tokio::io::WriteHalf<DuplexStream>>>,
    response: &Packet,
) {
    let mut buf = BytesMut::new();
    response.write_to(&mut buf);
    let _ = writer.lock().await.write_all(&buf).await;
}

type ServerHandler = Arc<dyn Fn(Packet, usize) -> (Packet, Duration) + Send + Sync>;

/// One scripted peer for direct [`Connection`] tests.
///
/// [`Connection`]: crate::connection::Connection
pub(crate) struct MockServer {
    client: DuplexStream,
}

impl MockServer {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(Packet, usize) -> (Packet, Duration) + Send + Sync + 'static,
    {
        let (client, server) = tokio::io::duplex(1 << 16);
        let handler: ServerHandler = Arc::new(handler);
        tokio::spawn(async move {
            let (mut reader, writer) = tokio::io::split(server);
            let writer = Arc::new(Mutex::new(writer));
            let mut index = 0;
            while let Ok(request) = read_request(&mut reader).await {
                let (response, delay) = handler(request, index);
                index += 1;
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_response(&writer, &response).await;
                });
            }
        });
        MockServer { client }
    }

    /// A peer that closes immediately; every read on the client side hits
    /// EOF.
    pub(crate) fn hangup() -> Self {
        let (client, server) = tokio::io::duplex(1 << 16);
        drop(server);
        MockServer { client }
    }

    /// A peer that speaks enough of the bootstrap sequence for
    /// `Connection::initialize`: HELLO accepts every requested feature,
    /// the error map is empty, PLAIN auth and select-bucket succeed.
    pub(crate) fn scripted() -> Self {
        MockServer::new(|request, _| {
            let response = match request.header.opcode {
                opcode::HELLO => {
                    let mut response = respond_success(&request);
                    response.value = request.value.clone();
                    response.seal();
                    response
                }
                opcode::GET_ERROR_MAP => respond_status(
                    &request,
                    0,
                    Bytes::from_static(br#"{"version":2,"revision":1,"errors":{}}"#),
                ),
                opcode::SASL_LIST_MECHS => {
                    respond_status(&request, 0, Bytes::from_static(b"PLAIN SCRAM-SHA-1"))
                }
                _ => respond_success(&request),
            };
            (response, Duration::from_millis(0))
        })
    }

    pub(crate) fn io(self) -> DuplexStream {
        self.client
    }
}

#[derive(Default)]
pub(crate) struct ConnStats {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub served: AtomicUsize,
}

impl ConnStats {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type ConnectorHandler = Arc<dyn Fn(&Packet) -> Packet + Send + Sync>;

/// A factory of scripted connections for pool, node, and cluster tests.
/// The first `dead_first` connections hang up immediately; the rest run
/// a responder that answers after `delay`.
pub(crate) struct MockConnector {
    delay: Duration,
    dead_first: usize,
    fail_connects: usize,
    connects: AtomicUsize,
    stats: SyncMutex<Vec<Arc<ConnStats>>>,
    global: Arc<ConnStats>,
    handler: Option<ConnectorHandler>,
}

impl MockConnector {
    pub(crate) fn new(delay: Duration) -> Self {
        MockConnector {
            delay,
            dead_first: 0,
            fail_connects: 0,
            connects: AtomicUsize::new(0),
            stats: SyncMutex::new(Vec::new()),
            global: Arc::new(ConnStats::default()),
            handler: None,
        }
    }

    pub(crate) fn with_dead_first(mut self, dead_first: usize) -> Self {
        self.dead_first = dead_first;
        self
    }

    /// The first `n` connect calls fail outright with a refused error.
    pub(crate) fn with_failing_connects(mut self, fail_connects: usize) -> Self {
        self.fail_connects = fail_connects;
        self
    }

    pub(crate) fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Packet) -> Packet + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Highest number of requests observed in flight on any single
    /// connection.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.stats
            .lock()
            .iter()
            .map(|stats| stats.max_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    /// Highest number of requests in flight across all connections at
    /// once.
    pub(crate) fn global_max_in_flight(&self) -> usize {
        self.global.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn total_served(&self) -> usize {
        self.stats
            .lock()
            .iter()
            .map(|stats| stats.served.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type IO = DuplexStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<DuplexStream, Error> {
        let index = self.connects.fetch_add(1, Ordering::SeqCst);
        if index < self.fail_connects {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("mock refused connect to {}", endpoint),
            )));
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        if index < self.fail_connects + self.dead_first {
            drop(server);
            return Ok(client);
        }

        let stats = Arc::new(ConnStats::default());
        self.stats.lock().push(stats.clone());
        let global = self.global.clone();
        let delay = self.delay;
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let (mut reader, writer) = tokio::io::split(server);
            let writer = Arc::new(Mutex::new(writer));
            while let Ok(request) = read_request(&mut reader).await {
                stats.enter();
                global.enter();
                let response = match &handler {
                    Some(handler) => handler(&request),
                    None => respond_success(&request),
                };
                let writer = writer.clone();
                let stats = stats.clone();
                let global = global.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    write_response(&writer, &response).await;
                    stats.exit();
                    global.exit();
                });
            }
        });

        Ok(client)
    }
}
