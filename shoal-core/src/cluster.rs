//! The cluster context: node registry, bucket registry, bootstrap, and
//! the serialized config handler that both config sources (the HTTP
//! stream and in-band not-my-vbucket payloads) feed into. An explicit
//! value owned by the application and threaded into every component; no
//! ambient state.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::Bucket;
use crate::config::{service_key, BucketConfig, CollectionsManifest, NodeAddress};
use crate::connection::{Connector, Endpoint, SessionOptions};
use crate::error::Error;
use crate::node::{ConfigEvent, ConfigPublisher, KvCommand, Node};
use crate::options::{ClusterOptions, ServiceType};
use crate::protocol::request::{GetClusterConfigRequest, GetCollectionsManifestRequest};
use crate::protocol::{feature, Packet, Status};

/// State shared between the context and its buckets: options, the
/// connector, the endpoint-keyed node registry, and the config intake.
/// Buckets hold this instead of the context itself, so ownership stays
/// acyclic; a node refers back to its bucket only by name.
pub struct ClusterShared<C: Connector> {
    pub(crate) options: Arc<ClusterOptions>,
    pub(crate) connector: Arc<C>,
    pub(crate) registry: DashMap<Endpoint, Arc<Node<C>>>,
    pub(crate) config_tx: ConfigPublisher,
}

impl<C: Connector> ClusterShared<C> {
    pub(crate) fn new(
        connector: Arc<C>,
        options: Arc<ClusterOptions>,
        config_tx: ConfigPublisher,
    ) -> Arc<Self> {
        Arc::new(ClusterShared {
            options,
            connector,
            registry: DashMap::new(),
            config_tx,
        })
    }

    /// Look up the node for `endpoint`, creating, connecting, and (when
    /// a bucket is given) select-bucketing it on first sight. A bootstrap
    /// node reached again through a config is updated in place rather
    /// than duplicated.
    pub(crate) async fn ensure_node(
        &self,
        endpoint: &Endpoint,
        bucket: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node<C>>, Error> {
        if let Some(existing) = self.registry.get(endpoint) {
            let node = existing.value().clone();
            drop(existing);
            if let Some(bucket) = bucket {
                if node.owner().as_deref() != Some(bucket) {
                    node.select_bucket(bucket).await?;
                }
            }
            return Ok(node);
        }

        let session = match bucket {
            Some(bucket) => SessionOptions::for_bucket(&self.options, bucket),
            None => SessionOptions::from_cluster(&self.options),
        };
        let node = Node::new(
            self.connector.clone(),
            endpoint.clone(),
            self.options.clone(),
            session,
            self.config_tx.clone(),
        );
        node.connect(cancel).await?;
        if let Some(bucket) = bucket {
            node.select_bucket(bucket).await?;
        }

        // another task may have raced us here; keep the registered one
        if let Some(existing) = self.registry.get(endpoint) {
            let winner = existing.value().clone();
            drop(existing);
            node.dispose().await;
            return Ok(winner);
        }
        tracing::debug!(node = %endpoint, bucket = ?bucket, "node created");
        self.registry.insert(endpoint.clone(), node.clone());
        Ok(node)
    }
}

pub struct ClusterContext<C: Connector> {
    shared: Arc<ClusterShared<C>>,
    buckets: DashMap<String, Arc<Bucket<C>>>,
    bootstrap_endpoints: SyncMutex<Vec<Endpoint>>,
    global_config: SyncMutex<Option<BucketConfig>>,
    cluster_version: SyncMutex<Option<String>>,
}

impl<C: Connector> ClusterContext<C> {
    pub fn new(connector: C, options: ClusterOptions) -> Arc<Self> {
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let shared = ClusterShared::new(Arc::new(connector), Arc::new(options), config_tx);
        let context = Arc::new(ClusterContext {
            shared,
            buckets: DashMap::new(),
            bootstrap_endpoints: SyncMutex::new(Vec::new()),
            global_config: SyncMutex::new(None),
            cluster_version: SyncMutex::new(None),
        });
        context.spawn_config_handler(config_rx);
        context
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.shared.options
    }

    /// Where external config sources (the HTTP streamer) publish
    /// snapshots.
    pub fn config_publisher(&self) -> ConfigPublisher {
        self.shared.config_tx.clone()
    }

    pub fn node_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The last global (bucket-less) cluster map seen, if any.
    pub fn global_config(&self) -> Option<BucketConfig> {
        self.global_config.lock().clone()
    }

    /// Walk the bootstrap endpoints until one yields a global cluster
    /// map. Servers too old for a global map answer "no bucket"; those
    /// still get their node registered and bucket-level bootstrap takes
    /// over later.
    pub async fn bootstrap(
        &self,
        endpoints: Vec<Endpoint>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        *self.bootstrap_endpoints.lock() = endpoints.clone();
        let mut last_error = None;

        for endpoint in &endpoints {
            match self.bootstrap_endpoint(endpoint, cancel).await {
                Ok(()) => return Ok(()),
                Err(Error::Server {
                    status: Status::NoBucket,
                    ..
                }) => {
                    tracing::debug!(
                        node = %endpoint,
                        "server has no global cluster map, falling back to bucket bootstrap"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(node = %endpoint, error = %err, "bootstrap endpoint failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Bootstrap("no bootstrap endpoints".into())))
    }

    async fn bootstrap_endpoint(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let node = self.shared.ensure_node(endpoint, None, cancel).await?;
        let response = node
            .send(
                KvCommand::read(Packet::from(&mut GetClusterConfigRequest)),
                cancel,
            )
            .await?;
        let config = BucketConfig::parse(&response.value, &endpoint.host)?;
        tracing::debug!(node = %endpoint, rev = config.rev, "global cluster map loaded");

        self.sync_global_nodes(&config, cancel).await;
        *self.global_config.lock() = Some(config);
        Ok(())
    }

    /// Create or update a node per entry of the cluster map and populate
    /// its service URIs.
    async fn sync_global_nodes(&self, config: &BucketConfig, cancel: &CancellationToken) {
        let options = &self.shared.options;
        for address in config.node_addresses(options.network_resolution) {
            let endpoint = match address.kv_endpoint(options.tls_enabled) {
                Some((host, port)) => Endpoint::new(host, port),
                None => continue,
            };
            match self.shared.ensure_node(&endpoint, None, cancel).await {
                Ok(node) => populate_service_uris(&node, &address, options.tls_enabled),
                Err(err) => {
                    tracing::warn!(node = %endpoint, error = %err, "failed to reach node from cluster map");
                }
            }
        }
    }

    /// The bucket if already open, otherwise bootstrap it against each
    /// endpoint until one succeeds.
    pub async fn get_or_create_bucket(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Bucket<C>>, Error> {
        if let Some(bucket) = self.buckets.get(name) {
            return Ok(bucket.value().clone());
        }

        let endpoints = self.bootstrap_endpoints.lock().clone();
        for endpoint in &endpoints {
            match self.bootstrap_bucket(endpoint, name, cancel).await {
                Ok(bucket) => return Ok(bucket),
                Err(err) => {
                    tracing::debug!(
                        node = %endpoint,
                        bucket = name,
                        error = %err,
                        "bucket bootstrap attempt failed"
                    );
                }
            }
        }
        Err(Error::BucketNotFound(name.to_string()))
    }

    /// Select the bucket on a node, fetch the collections manifest when
    /// supported, load the bucket's cluster map, and hand it to the
    /// bucket to build its key mapper and node list.
    async fn bootstrap_bucket(
        &self,
        endpoint: &Endpoint,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Bucket<C>>, Error> {
        let node = self.shared.ensure_node(endpoint, Some(name), cancel).await?;
        let bucket = Bucket::new(name, self.shared.clone());

        let collections = node
            .pool()
            .negotiated_session()
            .map(|session| session.features.contains(&feature::COLLECTIONS))
            .unwrap_or(false);
        if collections {
            match node
                .send(
                    KvCommand::read(Packet::from(&mut GetCollectionsManifestRequest)),
                    cancel,
                )
                .await
            {
                Ok(response) => match CollectionsManifest::parse(&response.value) {
                    Ok(manifest) => bucket.apply_manifest(&manifest),
                    Err(err) => {
                        tracing::warn!(bucket = name, error = %err, "malformed collections manifest")
                    }
                },
                Err(err) => {
                    tracing::debug!(bucket = name, error = %err, "collections manifest unavailable")
                }
            }
        }

        let response = node
            .send(
                KvCommand::read(Packet::from(&mut GetClusterConfigRequest)),
                cancel,
            )
            .await?;
        let config = BucketConfig::parse(&response.value, &endpoint.host)?;
        bucket.config_updated(&config, cancel).await?;

        self.buckets.insert(name.to_string(), bucket.clone());
        tracing::debug!(bucket = name, rev = config.rev, "bucket opened");
        Ok(bucket)
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<Bucket<C>>> {
        self.buckets.get(name).map(|bucket| bucket.value().clone())
    }

    /// Pick a node hosting `service`, uniformly at random; bucket-scoped
    /// lookups (views) restrict to nodes owned by that bucket.
    pub fn service_endpoint(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> Result<String, Error> {
        let candidates: Vec<String> = self
            .shared
            .registry
            .iter()
            .filter(|entry| match bucket {
                Some(bucket) => entry.value().owner().as_deref() == Some(bucket),
                None => true,
            })
            .filter_map(|entry| entry.value().service_uri(service))
            .collect();

        if candidates.is_empty() {
            return Err(Error::ServiceMissing(service));
        }
        let pick = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[pick].clone())
    }

    /// Cluster compatibility version: the minimum across nodes, probed
    /// over HTTP by the runtime crate.
    pub fn set_cluster_version(&self, version: String) {
        *self.cluster_version.lock() = Some(version);
    }

    pub fn cluster_version(&self) -> Option<String> {
        self.cluster_version.lock().clone()
    }

    /// Dispose every node and forget every bucket. Terminal.
    pub async fn shutdown(&self) {
        let endpoints: Vec<Endpoint> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for endpoint in endpoints {
            if let Some((_, node)) = self.shared.registry.remove(&endpoint) {
                node.dispose().await;
            }
        }
        self.buckets.clear();
        tracing::debug!("cluster context shut down");
    }

    /// The single serialized consumer of both config sources.
    fn spawn_config_handler(
        self: &Arc<Self>,
        mut config_rx: mpsc::UnboundedReceiver<ConfigEvent>,
    ) {
        let context = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = config_rx.recv().await {
                let context = match context.upgrade() {
                    Some(context) => context,
                    None => break,
                };
                context.apply_config(event).await;
            }
        });
    }

    async fn apply_config(&self, event: ConfigEvent) {
        let cancel = CancellationToken::new();
        if event.config.name.is_empty() {
            // a global map: refresh the node registry only
            self.sync_global_nodes(&event.config, &cancel).await;
            *self.global_config.lock() = Some(event.config);
            return;
        }
        let bucket = self
            .buckets
            .get(&event.config.name)
            .map(|bucket| bucket.value().clone());
        match bucket {
            Some(bucket) => {
                if let Err(err) = bucket.config_updated(&event.config, &cancel).await {
                    tracing::warn!(
                        bucket = %event.config.name,
                        origin = ?event.origin,
                        error = %err,
                        "failed to apply config"
                    );
                }
            }
            None => {
                tracing::trace!(
                    bucket = %event.config.name,
                    "dropping config for a bucket that is not open"
                );
            }
        }
    }
}

fn populate_service_uris<C: Connector>(node: &Arc<Node<C>>, address: &NodeAddress, tls: bool) {
    let scheme = if tls { "https" } else { "http" };
    for service in [
        ServiceType::Query,
        ServiceType::Analytics,
        ServiceType::Search,
        ServiceType::Views,
        ServiceType::Management,
    ]
    .iter()
    {
        let uri = address
            .port(service_key(*service, tls))
            .map(|port| format!("{}://{}:{}", scheme, address.hostname, port));
        node.set_service_uri(*service, uri);
    }
    if let Some(port) = address.kv_port(tls) {
        node.set_service_uri(
            ServiceType::KeyValue,
            Some(format!("{}:{}", address.hostname, port)),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::ClusterContext;
    use crate::connection::Endpoint;
    use crate::options::{ClusterOptions, ServiceType};
    use crate::pool::PoolOptions;
    use crate::protocol::{opcode, Packet};
    use crate::testutil::{respond_status, respond_success, sample_config_json, MockConnector};

    fn options() -> ClusterOptions {
        ClusterOptions::default().with_pool(PoolOptions::fixed(1))
    }

    /// A connector whose nodes answer the bucket bootstrap sequence.
    fn bootstrap_connector(bucket: &str, rev: u64) -> MockConnector {
        let config = sample_config_json(rev, bucket);
        let manifest = r#"{"uid": "1", "scopes": [
            {"name": "_default", "uid": "0", "collections": [{"name": "_default", "uid": "0"}]}
        ]}"#;
        MockConnector::new(Duration::from_millis(0)).with_handler(move |request: &Packet| {
            match request.header.opcode {
                opcode::GET_CLUSTER_CONFIG => {
                    respond_status(request, 0, Bytes::from(config.clone()))
                }
                opcode::GET_COLLECTIONS_MANIFEST => {
                    respond_status(request, 0, Bytes::from(manifest.to_string()))
                }
                opcode::HELLO => {
                    let mut response = respond_success(request);
                    response.value = request.value.clone();
                    response.seal();
                    response
                }
                _ => respond_success(request),
            }
        })
    }

    #[tokio::test]
    async fn test_bootstrap_registers_cluster_nodes() {
        let context = ClusterContext::new(bootstrap_connector("", 4), options());
        context
            .bootstrap(
                vec![Endpoint::new("node-1", 11210)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // the map lists node-1 and node-2; the bootstrap node is reused
        assert_eq!(2, context.node_count());
    }

    #[tokio::test]
    async fn test_get_or_create_bucket_is_cached() {
        let context = ClusterContext::new(bootstrap_connector("travel", 7), options());
        let cancel = CancellationToken::new();
        context
            .bootstrap(vec![Endpoint::new("node-1", 11210)], &cancel)
            .await
            .unwrap();

        let bucket = context.get_or_create_bucket("travel", &cancel).await.unwrap();
        assert_eq!(Some((0, 7)), bucket.current_revision());
        assert!(bucket.route(b"hello").is_ok());

        let again = context.get_or_create_bucket("travel", &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&bucket, &again));
    }

    #[tokio::test]
    async fn test_unknown_bucket_reports_not_found() {
        // select-bucket rejections make every endpoint fail
        let connector =
            MockConnector::new(Duration::from_millis(0)).with_handler(|request: &Packet| {
                match request.header.opcode {
                    opcode::SELECT_BUCKET => respond_status(request, 0x08, Bytes::new()),
                    _ => respond_success(request),
                }
            });
        let context = ClusterContext::new(connector, options());
        let cancel = CancellationToken::new();
        context
            .bootstrap(vec![Endpoint::new("node-1", 11210)], &cancel)
            .await
            .ok();

        let result = context.get_or_create_bucket("missing", &cancel).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_service_endpoint_selection() {
        let context = ClusterContext::new(bootstrap_connector("", 4), options());
        let cancel = CancellationToken::new();
        context
            .bootstrap(vec![Endpoint::new("node-1", 11210)], &cancel)
            .await
            .unwrap();

        // only node-1 exposes the query service in the sample config
        let uri = context.service_endpoint(ServiceType::Query, None).unwrap();
        assert_eq!("http://node-1:8093", uri);

        let missing = context.service_endpoint(ServiceType::Analytics, None);
        assert!(matches!(
            missing,
            Err(crate::error::Error::ServiceMissing(ServiceType::Analytics))
        ));
    }

    #[tokio::test]
    async fn test_stream_published_config_reaches_bucket() {
        let context = ClusterContext::new(bootstrap_connector("travel", 7), options());
        let cancel = CancellationToken::new();
        context
            .bootstrap(vec![Endpoint::new("node-1", 11210)], &cancel)
            .await
            .unwrap();
        let bucket = context.get_or_create_bucket("travel", &cancel).await.unwrap();
        assert_eq!(Some((0, 7)), bucket.current_revision());

        let publisher = context.config_publisher();
        let newer = crate::config::BucketConfig::parse(
            sample_config_json(9, "travel").as_bytes(),
            "node-1",
        )
        .unwrap();
        publisher
            .send(crate::node::ConfigEvent {
                config: newer,
                origin: crate::node::ConfigOrigin::Stream,
            })
            .unwrap();

        // the serialized handler applies it shortly
        for _ in 0..50 {
            if bucket.current_revision() == Some((0, 9)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Some((0, 9)), bucket.current_revision());
    }

    #[tokio::test]
    async fn test_shutdown_disposes_nodes() {
        let context = ClusterContext::new(bootstrap_connector("", 4), options());
        let cancel = CancellationToken::new();
        context
            .bootstrap(vec![Endpoint::new("node-1", 11210)], &cancel)
            .await
            .unwrap();
        assert!(context.node_count() > 0);

        context.shutdown().await;
        assert_eq!(0, context.node_count());
    }
}
