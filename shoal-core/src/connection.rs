//! One authenticated TCP session. A dedicated reader task demultiplexes
//! response frames into a pending-request table keyed by opaque; sends
//! serialize under the writer lock. A connection that hits a fatal I/O
//! error is marked dead and never resurrected.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::errormap::ErrorMap;
use crate::options::ClusterOptions;
use crate::protocol::request::{
    GetErrorMapRequest, HelloRequest, Request, SaslAuthRequest, SaslStepRequest,
    SelectBucketRequest,
};
use crate::protocol::{feature, next_opaque, Header, Packet, Status, HEADER_LEN};
use crate::sasl::{plain_payload, Mechanism, ScramSha1Client};

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

const ERROR_MAP_VERSION: u16 = 2;

/// A KV endpoint: host and port of one node's data service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Dials the raw byte stream a [`Connection`] runs over. The tokio
/// companion crate provides TCP and TLS connectors; tests plug in
/// in-memory duplex streams.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type IO: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::IO, Error>;
}

/// What a connection negotiates during initialization.
#[derive(Debug, Default)]
pub struct NegotiatedSession {
    pub features: Vec<u16>,
    pub error_map: Option<ErrorMap>,
}

/// Parameters for connection initialization: HELLO feature set, error
/// map fetch, SASL credentials, and the bucket to select.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub client_name: String,
    pub features: Vec<u16>,
    pub credentials: Option<(String, String)>,
    pub mechanism: Option<Mechanism>,
    pub tls: bool,
    pub bucket: Option<String>,
    pub fetch_error_map: bool,
}

impl SessionOptions {
    pub fn from_cluster(options: &ClusterOptions) -> Self {
        let mut features = vec![
            feature::DATATYPE,
            feature::XATTR,
            feature::XERROR,
            feature::SELECT_BUCKET,
            feature::ALT_REQUEST,
            feature::SYNC_REPLICATION,
            feature::COLLECTIONS,
        ];
        if options.enable_mutation_tokens {
            features.push(feature::MUTATION_SEQNO);
        }
        if options.enable_operation_duration_tracing {
            features.push(feature::SERVER_DURATION);
        }
        SessionOptions {
            client_name: "shoal".to_string(),
            features,
            credentials: if options.username.is_empty() {
                None
            } else {
                Some((options.username.clone(), options.password.clone()))
            },
            mechanism: options
                .sasl_mechanism
                .as_deref()
                .and_then(Mechanism::from_name),
            tls: options.tls_enabled,
            bucket: None,
            fetch_error_map: true,
        }
    }

    pub fn for_bucket(options: &ClusterOptions, bucket: &str) -> Self {
        SessionOptions {
            bucket: Some(bucket.to_string()),
            ..Self::from_cluster(options)
        }
    }
}

type PendingTable = Arc<SyncMutex<HashMap<u32, oneshot::Sender<Packet>>>>;

struct WriterState<IO> {
    io: WriteHalf<IO>,
    buf: BytesMut,
}

pub struct Connection<IO> {
    id: u64,
    endpoint: Endpoint,
    writer: Mutex<WriterState<IO>>,
    pending: PendingTable,
    dead: Arc<AtomicBool>,
    closing: AtomicBool,
    last_dispatch: SyncMutex<Instant>,
    features: SyncMutex<Vec<u16>>,
    shutdown: CancellationToken,
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an established stream and start its reader task.
    pub fn spawn(io: IO, endpoint: Endpoint) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let connection = Arc::new(Connection {
            id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            endpoint,
            writer: Mutex::new(WriterState {
                io: write_half,
                buf: BytesMut::with_capacity(4096),
            }),
            pending: Arc::new(SyncMutex::new(HashMap::new())),
            dead: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
            last_dispatch: SyncMutex::new(Instant::now()),
            features: SyncMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            read_half,
            connection.pending.clone(),
            connection.dead.clone(),
            connection.shutdown.clone(),
            connection.id,
        ));

        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_dispatch.lock().elapsed()
    }

    pub fn features(&self) -> Vec<u16> {
        self.features.lock().clone()
    }

    pub fn has_feature(&self, code: u16) -> bool {
        self.features.lock().contains(&code)
    }

    #[cfg(test)]
    pub(crate) fn set_idle_for_test(&self, idle: Duration) {
        if let Some(instant) = Instant::now().checked_sub(idle) {
            *self.last_dispatch.lock() = instant;
        }
    }

    /// Send one frame and await its response. The opaque is assigned
    /// here, registered in the pending table before the bytes hit the
    /// wire, and removed either by the reader on delivery or by
    /// cancellation. Late responses for a cancelled opaque are discarded
    /// by the reader.
    pub async fn send(&self, mut packet: Packet, cancel: &CancellationToken) -> Result<Packet, Error> {
        if self.is_dead() {
            return Err(Error::ConnectionDead);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosing);
        }

        let opaque = next_opaque();
        packet.header.opaque = opaque;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(opaque, reply_tx);

        {
            let mut writer = self.writer.lock().await;
            let WriterState { io, buf } = &mut *writer;
            buf.clear();
            packet.write_to(buf);
            if let Err(err) = io.write_all(buf).await {
                self.dead.store(true, Ordering::Release);
                self.pending.lock().remove(&opaque);
                return Err(err.into());
            }
        }
        *self.last_dispatch.lock() = Instant::now();

        tokio::select! {
            response = reply_rx => response.map_err(|_| Error::ConnectionDead),
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&opaque);
                Err(Error::Cancelled)
            }
        }
    }

    pub async fn send_request<R: Request>(
        &self,
        request: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Packet, Error> {
        self.send(Packet::from(request), cancel).await
    }

    /// HELLO feature negotiation, error map fetch, SASL, and the
    /// optional bucket selection, in that order.
    pub async fn initialize(
        &self,
        session: &SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<NegotiatedSession, Error> {
        let mut negotiated = NegotiatedSession::default();

        if !session.features.is_empty() {
            let mut hello =
                HelloRequest::new(session.client_name.clone(), session.features.clone());
            let response = self.send_request(&mut hello, cancel).await?;
            response
                .error_for_status()
                .map_err(|status| Error::from_status(status, false, None))?;
            negotiated.features = HelloRequest::parse_features(&response.value);
            *self.features.lock() = negotiated.features.clone();
            tracing::debug!(
                connection = self.id,
                features = ?negotiated.features,
                "negotiated session features"
            );
        }

        if session.fetch_error_map {
            let mut request = GetErrorMapRequest::new(ERROR_MAP_VERSION);
            let response = self.send_request(&mut request, cancel).await?;
            if response.status() == Status::Success {
                match ErrorMap::parse(&response.value) {
                    Ok(map) => negotiated.error_map = Some(map),
                    Err(err) => {
                        tracing::warn!(connection = self.id, error = %err, "ignoring malformed error map")
                    }
                }
            }
        }

        if let Some((username, password)) = &session.credentials {
            let mechanism = session
                .mechanism
                .unwrap_or_else(|| Mechanism::for_transport(session.tls));
            self.authenticate(username, password, mechanism, cancel)
                .await?;
        }

        if let Some(bucket) = &session.bucket {
            self.select_bucket(bucket, cancel).await?;
        }

        Ok(negotiated)
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        mechanism: Mechanism,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match mechanism {
            Mechanism::Plain => {
                let mut request =
                    SaslAuthRequest::new(mechanism.as_str(), plain_payload(username, password));
                let response = self.send_request(&mut request, cancel).await?;
                if response.status() != Status::Success {
                    return Err(Error::AuthenticationFailure(format!(
                        "PLAIN rejected with {:?}",
                        response.status()
                    )));
                }
            }
            Mechanism::ScramSha1 => {
                let mut client = ScramSha1Client::new(username, password);
                let mut request =
                    SaslAuthRequest::new(mechanism.as_str(), client.client_first());
                let response = self.send_request(&mut request, cancel).await?;
                match response.status() {
                    Status::AuthenticationContinue => {
                        let proof = client.step(&response.value)?;
                        let mut step = SaslStepRequest::new(mechanism.as_str(), proof);
                        let response = self.send_request(&mut step, cancel).await?;
                        if response.status() != Status::Success {
                            return Err(Error::AuthenticationFailure(format!(
                                "SCRAM-SHA-1 rejected with {:?}",
                                response.status()
                            )));
                        }
                        client.verify_server_final(&response.value)?;
                    }
                    status => {
                        return Err(Error::AuthenticationFailure(format!(
                            "expected continue, server answered {:?}",
                            status
                        )));
                    }
                }
            }
        }
        tracing::debug!(connection = self.id, mechanism = mechanism.as_str(), "authenticated");
        Ok(())
    }

    pub async fn select_bucket(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut request = SelectBucketRequest::new(bucket);
        let response = self.send_request(&mut request, cancel).await?;
        response
            .error_for_status()
            .map_err(|status| Error::from_status(status, false, None))
    }

    /// Stop accepting new sends, wait up to `grace` for in-flight
    /// responses, then shut the socket down.
    pub async fn close(&self, grace: Duration) {
        self.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 && Instant::now() < deadline && !self.is_dead() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.shutdown.cancel();
        self.dead.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
        tracing::debug!(connection = self.id, endpoint = %self.endpoint, "connection closed");
    }
}

async fn read_loop<R>(
    mut reader: ReadHalf<R>,
    pending: PendingTable,
    dead: Arc<AtomicBool>,
    shutdown: CancellationToken,
    connection_id: u64,
) where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(packet) => {
                    let opaque = packet.header.opaque;
                    let slot = pending.lock().remove(&opaque);
                    match slot {
                        Some(reply) => {
                            // receiver may have been cancelled in the meantime
                            let _ = reply.send(packet);
                        }
                        None => {
                            tracing::trace!(
                                connection = connection_id,
                                opaque,
                                "discarding response with no pending request"
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(connection = connection_id, error = %err, "reader stopped");
                    break;
                }
            }
        }
    }
    dead.store(true, Ordering::Release);
    // Dropping the senders completes every waiting future with an error.
    pending.lock().clear();
}

async fn read_frame<R>(reader: &mut ReadHalf<R>) -> Result<Packet, Error>
where
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut header_buf = [0_u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = Header::read_response(&header_buf)?;
    let mut body = vec![0_u8; header.body_len as usize];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    Ok(header.read_packet(&body)?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::{Connection, Endpoint, SessionOptions};
    use crate::protocol::request::{GetRequest, DocKey};
    use crate::protocol::{Packet, Status};
    use crate::sasl::Mechanism;
    use crate::testutil::{respond_success, MockServer};

    fn test_endpoint() -> Endpoint {
        Endpoint::new("mock", 11210)
    }

    #[tokio::test]
    async fn test_responses_correlate_by_opaque() {
        // Replies arrive out of order: the first request is delayed, the
        // second answered immediately.
        let server = MockServer::new(move |request: Packet, index| {
            let delay = if index == 0 { 80 } else { 0 };
            let mut response = respond_success(&request);
            response.value = request.key.clone();
            response.seal();
            (response, Duration::from_millis(delay))
        });
        let connection = Connection::spawn(server.io(), test_endpoint());

        let cancel = CancellationToken::new();
        let first = connection.send(
            Packet::from(&mut GetRequest::new(DocKey::new("alpha"), 1)),
            &cancel,
        );
        let second = connection.send(
            Packet::from(&mut GetRequest::new(DocKey::new("beta"), 1)),
            &cancel,
        );
        let (first, second) = tokio::join!(first, second);

        assert_eq!(b"alpha", &first.unwrap().value[..]);
        assert_eq!(b"beta", &second.unwrap().value[..]);
    }

    #[tokio::test]
    async fn test_cancellation_is_prompt() {
        // A server that never answers.
        let server = MockServer::new(|request: Packet, _| {
            (respond_success(&request), Duration::from_secs(3600))
        });
        let connection = Connection::spawn(server.io(), test_endpoint());

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let started = Instant::now();
        let result = connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(crate::error::Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(0, connection.in_flight());
    }

    #[tokio::test]
    async fn test_dead_after_server_hangup() {
        let server = MockServer::hangup();
        let connection = Connection::spawn(server.io(), test_endpoint());

        let cancel = CancellationToken::new();
        let result = connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(connection.is_dead());
        // never resurrected
        let result = connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(crate::error::Error::ConnectionDead)));
    }

    #[tokio::test]
    async fn test_initialize_hello_and_auth() {
        let server = MockServer::scripted();
        let connection = Connection::spawn(server.io(), test_endpoint());

        let session = SessionOptions {
            client_name: "test".into(),
            features: vec![
                crate::protocol::feature::XERROR,
                crate::protocol::feature::SELECT_BUCKET,
            ],
            credentials: Some(("user".into(), "pass".into())),
            mechanism: Some(Mechanism::Plain),
            tls: true,
            bucket: Some("travel".into()),
            fetch_error_map: true,
        };
        let cancel = CancellationToken::new();
        let negotiated = connection.initialize(&session, &cancel).await.unwrap();

        assert!(negotiated
            .features
            .contains(&crate::protocol::feature::SELECT_BUCKET));
        assert!(negotiated.error_map.is_some());
        assert!(connection.has_feature(crate::protocol::feature::SELECT_BUCKET));
    }

    #[tokio::test]
    async fn test_close_refuses_new_sends() {
        let server = MockServer::new(|request: Packet, _| {
            (respond_success(&request), Duration::from_millis(0))
        });
        let connection = Connection::spawn(server.io(), test_endpoint());
        connection.close(Duration::from_millis(50)).await;

        let cancel = CancellationToken::new();
        let result = connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cas_is_echoed() {
        let server = MockServer::new(|request: Packet, _| {
            let mut response = respond_success(&request);
            response.header.cas = 0x1122_3344_5566_7788;
            (response, Duration::from_millis(0))
        });
        let connection = Connection::spawn(server.io(), test_endpoint());

        let cancel = CancellationToken::new();
        let response = connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(Status::Success, response.status());
        assert_eq!(0x1122_3344_5566_7788, response.header.cas);
    }

    #[tokio::test]
    async fn test_idle_time_resets_on_dispatch() {
        let server = MockServer::new(|request: Packet, _| {
            (respond_success(&request), Duration::from_millis(0))
        });
        let connection: Arc<Connection<_>> = Connection::spawn(server.io(), test_endpoint());
        connection.set_idle_for_test(Duration::from_secs(120));
        assert!(connection.idle_time() >= Duration::from_secs(119));

        let cancel = CancellationToken::new();
        connection
            .send(
                Packet::from(&mut GetRequest::new(DocKey::new("k"), 0)),
                &cancel,
            )
            .await
            .unwrap();
        assert!(connection.idle_time() < Duration::from_secs(1));
    }
}
