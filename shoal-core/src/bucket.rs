//! A bucket: the routing scope of the key/value namespace. Holds the key
//! mapper (swapped atomically on config change), the node list in
//! routing order, and the collection-id cache. `config_updated` is the
//! single entry point through which topology evolves; it is only ever
//! invoked from the cluster context's serialized config handler.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterShared;
use crate::config::{BucketConfig, CollectionsManifest, ConfigDiff, NodeLocator};
use crate::connection::{Connector, Endpoint};
use crate::error::Error;
use crate::node::{KvCommand, Node};
use crate::protocol::request::DocKey;
use crate::protocol::Packet;
use crate::retry::RetryOrchestrator;
use crate::router::{KeyMapper, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    /// Sharded over a vBucket map.
    Document,
    /// Routed by consistent hashing.
    Memcached,
}

/// A scope/collection pair addressed by name; the numeric cid is
/// resolved (and re-resolved) through the bucket's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub scope: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(scope: impl Into<String>, collection: impl Into<String>) -> Self {
        CollectionRef {
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    fn cache_key(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }
}

struct BucketState {
    revision: Option<(u64, u64)>,
    config: Option<BucketConfig>,
}

pub struct Bucket<C: Connector> {
    name: String,
    shared: Arc<ClusterShared<C>>,
    mapper: ArcSwapOption<KeyMapper>,
    nodes: ArcSwap<Vec<Arc<Node<C>>>>,
    state: SyncMutex<BucketState>,
    cids: DashMap<String, u32>,
    manifest_uid: SyncMutex<Option<String>>,
}

impl<C: Connector> Bucket<C> {
    pub(crate) fn new(name: impl Into<String>, shared: Arc<ClusterShared<C>>) -> Arc<Self> {
        Arc::new(Bucket {
            name: name.into(),
            shared,
            mapper: ArcSwapOption::empty(),
            nodes: ArcSwap::new(Arc::new(Vec::new())),
            state: SyncMutex::new(BucketState {
                revision: None,
                config: None,
            }),
            cids: DashMap::new(),
            manifest_uid: SyncMutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_type(&self) -> BucketType {
        let state = self.state.lock();
        match state.config.as_ref().and_then(|config| config.node_locator) {
            Some(NodeLocator::Ketama) => BucketType::Memcached,
            _ => BucketType::Document,
        }
    }

    pub fn current_revision(&self) -> Option<(u64, u64)> {
        self.state.lock().revision
    }

    pub fn manifest_uid(&self) -> Option<String> {
        self.manifest_uid.lock().clone()
    }

    pub fn key_mapper(&self) -> Option<Arc<KeyMapper>> {
        self.mapper.load_full()
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node<C>>>> {
        self.nodes.load_full()
    }

    pub fn route(&self, key: &[u8]) -> Result<Route, Error> {
        let mapper = self.key_mapper().ok_or(Error::NotBootstrapped)?;
        Ok(mapper.route(key))
    }

    fn node_for(&self, route: &Route) -> Result<Arc<Node<C>>, Error> {
        if route.server < 0 {
            // the slot is unowned mid-rebalance; retriable
            return Err(Error::Temporary);
        }
        let nodes = self.nodes.load();
        nodes
            .get(route.server as usize)
            .cloned()
            .ok_or(Error::Temporary)
    }

    /// The cached cid, or a GET_CID round trip through any node.
    pub async fn resolve_cid(
        &self,
        collection: &CollectionRef,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        if let Some(cid) = self.cids.get(&collection.cache_key()) {
            return Ok(*cid);
        }
        self.refresh_cid(collection, None, cancel).await
    }

    /// Re-resolve a cid by name, preferring `node` (the one that told us
    /// the id was outdated) so the retry lands on a consistent view.
    async fn refresh_cid(
        &self,
        collection: &CollectionRef,
        node: Option<&Arc<Node<C>>>,
        cancel: &CancellationToken,
    ) -> Result<u32, Error> {
        let node = match node {
            Some(node) => node.clone(),
            None => {
                let nodes = self.nodes.load();
                nodes.first().cloned().ok_or(Error::NotBootstrapped)?
            }
        };
        let cid = node
            .fetch_cid(&collection.scope, &collection.collection, cancel)
            .await?;
        tracing::debug!(
            bucket = %self.name,
            collection = %collection.cache_key(),
            cid,
            "collection id refreshed"
        );
        self.cids.insert(collection.cache_key(), cid);
        Ok(cid)
    }

    pub(crate) fn apply_manifest(&self, manifest: &CollectionsManifest) {
        for scope in &manifest.scopes {
            for collection in &scope.collections {
                if let Ok(cid) = u32::from_str_radix(&collection.uid, 16) {
                    self.cids
                        .insert(format!("{}.{}", scope.name, collection.name), cid);
                }
            }
        }
        *self.manifest_uid.lock() = Some(manifest.uid.clone());
    }

    /// Route, dispatch, and orchestrate retries for one operation. The
    /// command's frame is re-stamped with the routed vBucket id on every
    /// attempt; a CollectionOutdated answer refreshes the cid and retries
    /// once on the same node.
    pub async fn send(
        &self,
        key: &[u8],
        command: KvCommand,
        collection: Option<&CollectionRef>,
        cancel: &CancellationToken,
    ) -> Result<Packet, Error> {
        let mut command = command;
        let budget = command.timeout_override.unwrap_or(if command.durable {
            self.shared.options.kv_durability_timeout
        } else {
            self.shared.options.kv_timeout
        });
        let mut orchestrator = RetryOrchestrator::new(budget);
        let mut cid_refreshed = false;

        loop {
            let attempt_result = self.attempt(key, &command, cancel).await;
            let (node, error) = match attempt_result {
                Ok(packet) => return Ok(packet),
                Err((node, error)) => (node, error),
            };

            if let Error::CollectionOutdated = error {
                let collection = match collection {
                    Some(collection) => collection,
                    None => return Err(error),
                };
                if cid_refreshed {
                    return Err(error);
                }
                cid_refreshed = true;
                let cid = self.refresh_cid(collection, node.as_ref(), cancel).await?;
                Self::rewrite_cid(&mut command.packet, key, cid);
                continue;
            }

            let error_map = node.as_ref().and_then(|node| node.error_map());
            if !orchestrator
                .should_retry(&error, error_map.as_deref())
                .await
            {
                return Err(error);
            }
        }
    }

    async fn attempt(
        &self,
        key: &[u8],
        command: &KvCommand,
        cancel: &CancellationToken,
    ) -> Result<Packet, (Option<Arc<Node<C>>>, Error)> {
        let route = self.route(key).map_err(|err| (None, err))?;
        let node = self.node_for(&route).map_err(|err| (None, err))?;

        let mut attempt = command.clone();
        if let Some(vbucket) = route.vbucket {
            attempt.packet.header.vbucket_or_status = vbucket;
        }
        match node.send(attempt, cancel).await {
            Ok(packet) => Ok(packet),
            Err(err) => Err((Some(node), err)),
        }
    }

    /// Stamp a fresh cid into an already-built frame, after a refresh.
    pub fn rewrite_cid(packet: &mut Packet, key: &[u8], cid: u32) {
        let mut doc_key = DocKey::in_collection(key.to_vec(), cid);
        packet.key = doc_key.encode_key();
        packet.seal();
    }

    /// Apply one config snapshot, in revision order:
    /// 1. lower (or equal) revisions are dropped,
    /// 2. configs for another bucket are dropped,
    /// 3. a changed vBucket map rebuilds the key mapper,
    /// 4. a changed node list is diffed against the registry and the
    ///    bucket's node list replaced atomically,
    /// 5. registry nodes absent from the new list are pruned.
    pub async fn config_updated(
        &self,
        config: &BucketConfig,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let diff = {
            let state = self.state.lock();
            if let Some(current) = state.revision {
                if config.revision() <= current {
                    tracing::trace!(
                        bucket = %self.name,
                        current = ?current,
                        offered = ?config.revision(),
                        "dropping stale config revision"
                    );
                    return Ok(());
                }
            }
            if config.name != self.name {
                tracing::trace!(
                    bucket = %self.name,
                    offered = %config.name,
                    "dropping config for another bucket"
                );
                return Ok(());
            }
            match &state.config {
                Some(old) => config.diff(old),
                None => ConfigDiff {
                    vbucket_map_changed: true,
                    cluster_nodes_changed: true,
                },
            }
        };

        let options = &self.shared.options;
        if diff.vbucket_map_changed {
            let mapper =
                KeyMapper::from_config(config, options.network_resolution, options.tls_enabled)?;
            self.mapper.store(Some(Arc::new(mapper)));
            tracing::debug!(bucket = %self.name, rev = config.rev, "key mapper rebuilt");
        }

        if diff.cluster_nodes_changed {
            let endpoints: Vec<Endpoint> = config
                .data_endpoints(options.network_resolution, options.tls_enabled)
                .into_iter()
                .map(|(host, port)| Endpoint::new(host, port))
                .collect();

            let mut nodes = Vec::with_capacity(endpoints.len());
            for endpoint in &endpoints {
                let node = self
                    .shared
                    .ensure_node(endpoint, Some(&self.name), cancel)
                    .await?;
                nodes.push(node);
            }
            self.nodes.store(Arc::new(nodes));
            tracing::debug!(
                bucket = %self.name,
                rev = config.rev,
                nodes = endpoints.len(),
                "node list replaced"
            );

            self.prune_registry(config).await;
        }

        let mut state = self.state.lock();
        state.revision = Some(config.revision());
        state.config = Some(config.clone());
        Ok(())
    }

    /// Drop registry nodes whose address no longer appears in the
    /// config; their pools close in the background.
    async fn prune_registry(&self, config: &BucketConfig) {
        let options = &self.shared.options;
        let keep: HashSet<Endpoint> = config
            .kv_endpoints(options.network_resolution, options.tls_enabled)
            .into_iter()
            .chain(config.server_endpoints(options.network_resolution, options.tls_enabled))
            .map(|(host, port)| Endpoint::new(host, port))
            .collect();

        let stale: Vec<Endpoint> = self
            .shared
            .registry
            .iter()
            .filter(|entry| !keep.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for endpoint in stale {
            if let Some((_, node)) = self.shared.registry.remove(&endpoint) {
                tracing::debug!(bucket = %self.name, node = %endpoint, "pruning node absent from config");
                tokio::spawn(async move {
                    node.dispose().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{Bucket, BucketType};
    use crate::cluster::ClusterShared;
    use crate::config::BucketConfig;
    use crate::connection::Endpoint;
    use crate::options::ClusterOptions;
    use crate::pool::PoolOptions;
    use crate::testutil::{sample_config_json, MockConnector};

    fn shared_with(connector: MockConnector) -> Arc<ClusterShared<MockConnector>> {
        let (config_tx, _config_rx) = tokio::sync::mpsc::unbounded_channel();
        ClusterShared::new(
            Arc::new(connector),
            Arc::new(ClusterOptions::default().with_pool(PoolOptions::fixed(1))),
            config_tx,
        )
    }

    fn parse(json: &str) -> BucketConfig {
        BucketConfig::parse(json.as_bytes(), "node-1").unwrap()
    }

    #[tokio::test]
    async fn test_first_config_builds_mapper_and_nodes() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("travel", shared.clone());
        let config = parse(&sample_config_json(7, "travel"));

        bucket
            .config_updated(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(Some((0, 7)), bucket.current_revision());
        assert_eq!(BucketType::Document, bucket.bucket_type());
        assert!(bucket.key_mapper().is_some());
        assert_eq!(2, bucket.nodes().len());
        assert_eq!(2, shared.registry.len());

        let route = bucket.route(b"hello").unwrap();
        assert!(route.vbucket.is_some());
        assert!(route.server >= 0);
    }

    #[tokio::test]
    async fn test_revision_regression_is_ignored() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("travel", shared.clone());
        let cancel = CancellationToken::new();

        bucket
            .config_updated(&parse(&sample_config_json(7, "travel")), &cancel)
            .await
            .unwrap();
        let mapper_at_seven = bucket.key_mapper().unwrap();

        // an older revision with a different topology must not win
        let mut stale = sample_config_json(5, "travel");
        stale = stale.replace("node-2", "node-9");
        bucket
            .config_updated(&parse(&stale), &cancel)
            .await
            .unwrap();

        assert_eq!(Some((0, 7)), bucket.current_revision());
        assert_eq!(2, bucket.nodes().len());
        assert!(Arc::ptr_eq(
            &mapper_at_seven,
            &bucket.key_mapper().unwrap()
        ));
        assert!(shared
            .registry
            .iter()
            .all(|entry| entry.key().host != "node-9"));
    }

    #[tokio::test]
    async fn test_same_revision_applied_twice_is_idempotent() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("travel", shared.clone());
        let cancel = CancellationToken::new();
        let config = parse(&sample_config_json(7, "travel"));

        bucket.config_updated(&config, &cancel).await.unwrap();
        let mapper = bucket.key_mapper().unwrap();
        let nodes = bucket.nodes();
        let connects = shared.connector.connect_count();

        bucket.config_updated(&config, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&mapper, &bucket.key_mapper().unwrap()));
        assert!(Arc::ptr_eq(&nodes, &bucket.nodes()));
        assert_eq!(connects, shared.connector.connect_count());
    }

    #[tokio::test]
    async fn test_config_for_other_bucket_is_dropped() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("travel", shared);
        let config = parse(&sample_config_json(9, "beer-sample"));

        bucket
            .config_updated(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(None, bucket.current_revision());
        assert!(bucket.key_mapper().is_none());
    }

    #[tokio::test]
    async fn test_node_removed_from_config_is_pruned() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("travel", shared.clone());
        let cancel = CancellationToken::new();

        bucket
            .config_updated(&parse(&sample_config_json(7, "travel")), &cancel)
            .await
            .unwrap();
        let removed = shared
            .registry
            .get(&Endpoint::new("node-2", 11210))
            .map(|entry| entry.value().clone())
            .unwrap();

        let shrunk = r#"{
            "rev": 8,
            "name": "travel",
            "nodeLocator": "vbucket",
            "nodesExt": [
                {"services": {"kv": 11210, "mgmt": 8091}, "hostname": "node-1"}
            ],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["node-1:11210"],
                "vBucketMap": [[0], [0], [0], [0], [0], [0], [0], [0]]
            }
        }"#;
        bucket
            .config_updated(&parse(shrunk), &cancel)
            .await
            .unwrap();

        assert_eq!(1, bucket.nodes().len());
        assert!(shared.registry.get(&Endpoint::new("node-2", 11210)).is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(removed.pool().is_disposed());
    }

    #[tokio::test]
    async fn test_ketama_bucket_routes_without_server_map() {
        let shared = shared_with(MockConnector::new(Duration::from_millis(0)));
        let bucket = Bucket::new("cache", shared);
        let config = r#"{
            "rev": 3,
            "name": "cache",
            "nodeLocator": "ketama",
            "nodesExt": [
                {"services": {"kv": 11210}, "hostname": "node-1"},
                {"services": {"kv": 11210}, "hostname": "node-2"}
            ]
        }"#;
        bucket
            .config_updated(&parse(config), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(BucketType::Memcached, bucket.bucket_type());
        let route = bucket.route(b"session:1").unwrap();
        assert_eq!(None, route.vbucket);
        assert!(route.server >= 0 && route.server < 2);
    }
}
