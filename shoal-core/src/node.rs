//! One server node: identity, negotiated features, server error map,
//! service URIs, circuit breaker, bucket binding, and its connection
//! pool. The send pipeline consults the breaker, applies the effective
//! timeout, dispatches through the pool, and translates response
//! statuses into error kinds. Not-my-vbucket responses publish their
//! embedded config to the cluster context before surfacing a retriable
//! error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{BreakerDecision, BreakerOptions, CircuitBreaker};
use crate::config::BucketConfig;
use crate::connection::{Connector, Endpoint, SessionOptions};
use crate::error::Error;
use crate::errormap::ErrorMap;
use crate::options::{ClusterOptions, ServiceType};
use crate::pool::ConnectionPool;
use crate::protocol::request::{GetCidRequest, NoopRequest};
use crate::protocol::{Packet, Status};

/// A config snapshot on its way to the serialized cluster handler.
#[derive(Debug)]
pub struct ConfigEvent {
    pub config: BucketConfig,
    pub origin: ConfigOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// The HTTP streaming endpoint.
    Stream,
    /// Extracted from a not-my-vbucket response.
    InBand,
}

pub type ConfigPublisher = mpsc::UnboundedSender<ConfigEvent>;

/// One KV operation as the node sees it: the sealed frame plus the
/// attributes that drive timeout selection and error refinement.
#[derive(Debug, Clone)]
pub struct KvCommand {
    pub packet: Packet,
    pub mutation: bool,
    pub durable: bool,
    pub cas_op: bool,
    pub timeout_override: Option<Duration>,
}

impl KvCommand {
    pub fn read(packet: Packet) -> Self {
        KvCommand {
            packet,
            mutation: false,
            durable: false,
            cas_op: false,
            timeout_override: None,
        }
    }

    pub fn mutation(packet: Packet, durable: bool, cas_op: bool) -> Self {
        KvCommand {
            packet,
            mutation: true,
            durable,
            cas_op,
            timeout_override: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }
}

pub struct Node<C: Connector> {
    id: Uuid,
    endpoint: Endpoint,
    /// The hostname the node was first reached through, kept for `$HOST`
    /// substitution in configs it hands us.
    bootstrap_hostname: String,
    services: SyncMutex<HashMap<ServiceType, String>>,
    last_activity: SyncMutex<HashMap<ServiceType, Instant>>,
    breaker: CircuitBreaker,
    owner: SyncMutex<Option<String>>,
    pool: Arc<ConnectionPool<C>>,
    config_tx: ConfigPublisher,
    options: Arc<ClusterOptions>,
}

impl<C: Connector> Node<C> {
    pub fn new(
        connector: Arc<C>,
        endpoint: Endpoint,
        options: Arc<ClusterOptions>,
        session: SessionOptions,
        config_tx: ConfigPublisher,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(
            connector,
            endpoint.clone(),
            options.pool.clone(),
            session,
        );
        Arc::new(Node {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            bootstrap_hostname: endpoint.host,
            services: SyncMutex::new(HashMap::new()),
            last_activity: SyncMutex::new(HashMap::new()),
            breaker: CircuitBreaker::new(BreakerOptions::default()),
            owner: SyncMutex::new(None),
            pool,
            config_tx,
            options,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub fn error_map(&self) -> Option<Arc<ErrorMap>> {
        self.pool
            .negotiated_session()
            .and_then(|session| session.error_map.clone().map(Arc::new))
    }

    pub fn set_service_uri(&self, service: ServiceType, uri: Option<String>) {
        let mut services = self.services.lock();
        match uri {
            Some(uri) => {
                services.insert(service, uri);
            }
            None => {
                services.remove(&service);
            }
        }
    }

    pub fn service_uri(&self, service: ServiceType) -> Option<String> {
        self.services.lock().get(&service).cloned()
    }

    pub fn has_service(&self, service: ServiceType) -> bool {
        self.services.lock().contains_key(&service)
    }

    pub fn last_activity(&self, service: ServiceType) -> Option<Instant> {
        self.last_activity.lock().get(&service).copied()
    }

    fn touch(&self, service: ServiceType) {
        self.last_activity.lock().insert(service, Instant::now());
    }

    /// Open the pool.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        self.pool.initialize(cancel).await
    }

    /// Bind the node to a bucket: SELECT_BUCKET on every pooled
    /// connection (under the pool's structural lock), then record the
    /// owner.
    pub async fn select_bucket(&self, bucket: &str) -> Result<(), Error> {
        self.pool.select_bucket(bucket).await?;
        *self.owner.lock() = Some(bucket.to_string());
        tracing::debug!(node = %self.endpoint, bucket, "node bound to bucket");
        Ok(())
    }

    /// The full send pipeline.
    pub async fn send(
        self: &Arc<Self>,
        command: KvCommand,
        cancel: &CancellationToken,
    ) -> Result<Packet, Error> {
        match self.breaker.precheck() {
            BreakerDecision::Allow => {}
            BreakerDecision::Reject => return Err(Error::CircuitBreakerOpen),
            BreakerDecision::Canary => {
                self.spawn_canary();
                return Err(Error::CircuitBreakerOpen);
            }
        }

        let timeout = command.timeout_override.unwrap_or(if command.durable {
            self.options.kv_durability_timeout
        } else {
            self.options.kv_timeout
        });

        // The linked token separates "the caller gave up" from "the
        // deadline fired": both cancel the dispatched operation, but they
        // surface as different error kinds.
        let linked = cancel.child_token();
        let dispatch = self.pool.send(command.packet, linked.clone());
        tokio::pin!(dispatch);

        let result = tokio::select! {
            result = &mut dispatch => result,
            _ = tokio::time::sleep(timeout) => {
                linked.cancel();
                Err(Error::Timeout { ambiguous: command.mutation })
            }
            _ = cancel.cancelled() => {
                linked.cancel();
                Err(Error::Cancelled)
            }
        };

        match result {
            Ok(packet) => self.complete(command.cas_op, packet),
            Err(err) => {
                if CircuitBreaker::counts_as_failure(&err) {
                    self.breaker.mark_failure();
                }
                Err(err)
            }
        }
    }

    fn complete(&self, cas_op: bool, packet: Packet) -> Result<Packet, Error> {
        self.touch(ServiceType::KeyValue);
        match packet.status() {
            status if status.is_success() => {
                self.breaker.mark_success();
                Ok(packet)
            }
            // The overall operation succeeded; per-path errors surface
            // when each spec's value is read.
            Status::SubdocMultiPathFailure | Status::SubdocMultiPathFailureDeleted => {
                self.breaker.mark_success();
                Ok(packet)
            }
            Status::NotMyVbucket => {
                self.breaker.mark_success();
                self.publish_embedded_config(&packet);
                Err(Error::NotMyVbucket)
            }
            status => {
                let error = Error::from_status(status, cas_op, self.error_map().as_deref());
                Err(error)
            }
        }
    }

    /// Not-my-vbucket responses embed the config revision the server
    /// wants us to see.
    fn publish_embedded_config(&self, packet: &Packet) {
        if packet.value.is_empty() {
            return;
        }
        match BucketConfig::parse(&packet.value, &self.bootstrap_hostname) {
            Ok(config) => {
                tracing::debug!(
                    node = %self.endpoint,
                    rev = config.rev,
                    "publishing config embedded in not-my-vbucket response"
                );
                let _ = self.config_tx.send(ConfigEvent {
                    config,
                    origin: ConfigOrigin::InBand,
                });
            }
            Err(err) => {
                tracing::warn!(node = %self.endpoint, error = %err, "discarding malformed embedded config");
            }
        }
    }

    fn spawn_canary(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let timeout = node.breaker.canary_timeout();
            let dispatch = node
                .pool
                .send(Packet::from(&mut NoopRequest), cancel.clone());
            tokio::pin!(dispatch);
            let outcome = tokio::select! {
                result = &mut dispatch => result,
                _ = tokio::time::sleep(timeout) => {
                    cancel.cancel();
                    Err(Error::Timeout { ambiguous: false })
                }
            };
            match outcome {
                Ok(packet) if packet.status().is_success() => node.breaker.mark_success(),
                _ => node.breaker.mark_failure(),
            }
        });
    }

    /// Resolve a collection id by name on this node, for the cid-refresh
    /// path.
    pub async fn fetch_cid(
        self: &Arc<Self>,
        scope: &str,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        let mut request = GetCidRequest::new(scope, collection);
        let packet = Packet::from(&mut request);
        let response = self.send(KvCommand::read(packet), cancel).await?;
        GetCidRequest::parse_cid(&response.extras).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "GET_COLLECTION_ID for {}.{} returned no cid",
                scope, collection
            ))
        })
    }

    /// Close the pool and every connection in it. The node must not be
    /// used afterwards.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
        tracing::debug!(node = %self.endpoint, "node disposed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{ConfigOrigin, KvCommand, Node};
    use crate::connection::{Endpoint, SessionOptions};
    use crate::options::ClusterOptions;
    use crate::pool::PoolOptions;
    use crate::protocol::request::{DocKey, GetRequest};
    use crate::protocol::{opcode, Packet, Status};
    use crate::testutil::{respond_status, respond_success, sample_config_json, MockConnector};

    fn cluster_options() -> Arc<ClusterOptions> {
        Arc::new(ClusterOptions::default().with_pool(PoolOptions::fixed(1)))
    }

    async fn connected_node(
        connector: MockConnector,
    ) -> (
        Arc<Node<MockConnector>>,
        mpsc::UnboundedReceiver<super::ConfigEvent>,
    ) {
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let node = Node::new(
            Arc::new(connector),
            Endpoint::new("node-1", 11210),
            cluster_options(),
            SessionOptions::default(),
            config_tx,
        );
        node.connect(&CancellationToken::new()).await.unwrap();
        (node, config_rx)
    }

    fn get_command(key: &str) -> KvCommand {
        KvCommand::read(Packet::from(&mut GetRequest::new(DocKey::new(key), 3)))
    }

    #[tokio::test]
    async fn test_success_path_touches_activity() {
        let (node, _config_rx) =
            connected_node(MockConnector::new(Duration::from_millis(0))).await;
        assert!(node.last_activity(crate::options::ServiceType::KeyValue).is_none());

        let response = node
            .send(get_command("doc"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(Status::Success, response.status());
        assert!(node.last_activity(crate::options::ServiceType::KeyValue).is_some());
    }

    #[tokio::test]
    async fn test_not_my_vbucket_publishes_embedded_config() {
        let config_json = sample_config_json(10, "travel");
        let connector = MockConnector::new(Duration::from_millis(0)).with_handler(move |request| {
            if request.header.opcode == opcode::GET {
                respond_status(request, 0x07, Bytes::from(config_json.clone()))
            } else {
                respond_success(request)
            }
        });
        let (node, mut config_rx) = connected_node(connector).await;

        let error = node
            .send(get_command("doc"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, crate::error::Error::NotMyVbucket));
        assert!(error.is_retriable());

        let event = config_rx.recv().await.unwrap();
        assert_eq!(ConfigOrigin::InBand, event.origin);
        assert_eq!(10, event.config.rev);
        assert_eq!("travel", event.config.name);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_cancel() {
        let connector = MockConnector::new(Duration::from_secs(3600));
        let (node, _config_rx) = connected_node(connector).await;

        let command = get_command("slow").with_timeout(Duration::from_millis(30));
        let result = node.send(command, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Timeout { ambiguous: false })
        ));

        let mut command = get_command("cancelled").with_timeout(Duration::from_secs(30));
        command.mutation = true;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = node.send(command, &cancel).await;
        assert!(matches!(result, Err(crate::error::Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_mutation_timeout_is_ambiguous() {
        let connector = MockConnector::new(Duration::from_secs(3600));
        let (node, _config_rx) = connected_node(connector).await;

        let mut command = get_command("slow-mutation").with_timeout(Duration::from_millis(30));
        command.mutation = true;
        let result = node.send(command, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Timeout { ambiguous: true })
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_dispatch() {
        let (node, _config_rx) =
            connected_node(MockConnector::new(Duration::from_millis(0))).await;
        for _ in 0..20 {
            node.breaker().mark_failure();
        }

        let result = node
            .send(get_command("rejected"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::CircuitBreakerOpen)
        ));
    }

    #[tokio::test]
    async fn test_status_translation() {
        let connector = MockConnector::new(Duration::from_millis(0)).with_handler(|request| {
            respond_status(request, 0x01, Bytes::new())
        });
        let (node, _config_rx) = connected_node(connector).await;

        let result = node
            .send(get_command("missing"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(crate::error::Error::NotFound)));
    }
}
