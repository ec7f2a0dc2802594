//! The cluster configuration model: an immutable snapshot of bucket
//! topology identified by a monotonically increasing revision. Snapshots
//! arrive as JSON from the HTTP config stream, from GetClusterConfig, or
//! embedded in not-my-vbucket responses; server strings may carry a
//! `$HOST` placeholder standing for the host the config was read from.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Error;
use crate::options::{NetworkResolution, ServiceType};

pub const NETWORK_DEFAULT: &str = "default";
pub const NETWORK_EXTERNAL: &str = "external";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub rev: u64,
    #[serde(default, rename = "revEpoch")]
    pub rev_epoch: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "nodeLocator")]
    pub node_locator: Option<NodeLocator>,
    #[serde(default, rename = "nodesExt")]
    pub nodes_ext: Vec<NodeExt>,
    #[serde(default, rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VbucketServerMap>,
    #[serde(default, rename = "bucketCapabilities")]
    pub bucket_capabilities: Vec<String>,
    /// Host the config was fetched from; substituted for `$HOST` and the
    /// fallback for entries without a hostname.
    #[serde(skip)]
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocator {
    Vbucket,
    Ketama,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeExt {
    #[serde(default)]
    pub services: HashMap<String, u16>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, rename = "thisNode")]
    pub this_node: bool,
    #[serde(default, rename = "alternateAddresses")]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlternateAddress {
    pub hostname: String,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VbucketServerMap {
    #[serde(default, rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: u32,
    #[serde(default, rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// What changed between two config revisions, driving which parts of the
/// topology are rebuilt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigDiff {
    pub vbucket_map_changed: bool,
    pub cluster_nodes_changed: bool,
}

/// The address of one node under a resolved network, with its service
/// port table.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAddress {
    pub hostname: String,
    pub this_node: bool,
    services: HashMap<String, u16>,
}

impl NodeAddress {
    pub fn port(&self, key: &str) -> Option<u16> {
        self.services.get(key).copied()
    }

    pub fn kv_port(&self, tls: bool) -> Option<u16> {
        self.port(if tls { "kvSSL" } else { "kv" })
    }

    pub fn service_port(&self, service: ServiceType, tls: bool) -> Option<u16> {
        self.port(service_key(service, tls))
    }

    pub fn kv_endpoint(&self, tls: bool) -> Option<(String, u16)> {
        self.kv_port(tls).map(|port| (self.hostname.clone(), port))
    }
}

pub fn service_key(service: ServiceType, tls: bool) -> &'static str {
    match (service, tls) {
        (ServiceType::KeyValue, false) => "kv",
        (ServiceType::KeyValue, true) => "kvSSL",
        (ServiceType::Query, false) => "n1ql",
        (ServiceType::Query, true) => "n1qlSSL",
        (ServiceType::Analytics, false) => "cbas",
        (ServiceType::Analytics, true) => "cbasSSL",
        (ServiceType::Search, false) => "fts",
        (ServiceType::Search, true) => "ftsSSL",
        (ServiceType::Views, false) => "capi",
        (ServiceType::Views, true) => "capiSSL",
        (ServiceType::Management, false) => "mgmt",
        (ServiceType::Management, true) => "mgmtSSL",
    }
}

impl BucketConfig {
    /// Parse one config, substituting `$HOST` with the host it was read
    /// from.
    pub fn parse(raw: &[u8], origin_host: &str) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|err| Error::InvalidConfig(format!("config is not utf-8: {}", err)))?;
        let text = text.replace("$HOST", origin_host);
        let mut config: BucketConfig = serde_json::from_str(&text)?;
        config.origin = origin_host.to_string();
        Ok(config)
    }

    /// Total revision order. A lower revision must never overwrite a
    /// higher one.
    pub fn revision(&self) -> (u64, u64) {
        (self.rev_epoch, self.rev)
    }

    pub fn diff(&self, old: &BucketConfig) -> ConfigDiff {
        ConfigDiff {
            vbucket_map_changed: self.vbucket_server_map != old.vbucket_server_map,
            cluster_nodes_changed: self.node_addresses(NetworkResolution::Default)
                != old.node_addresses(NetworkResolution::Default)
                || self.node_addresses(NetworkResolution::External)
                    != old.node_addresses(NetworkResolution::External),
        }
    }

    /// Pick the address family. `Auto` resolves to external only when the
    /// origin host appears among the alternate hostnames, meaning we
    /// bootstrapped through the external surface.
    pub fn effective_network(&self, requested: NetworkResolution) -> &'static str {
        match requested {
            NetworkResolution::Default => NETWORK_DEFAULT,
            NetworkResolution::External => NETWORK_EXTERNAL,
            NetworkResolution::Auto => {
                let external_match = self.nodes_ext.iter().any(|node| {
                    node.alternate_addresses
                        .get(NETWORK_EXTERNAL)
                        .map(|alt| alt.hostname == self.origin)
                        .unwrap_or(false)
                });
                if external_match {
                    NETWORK_EXTERNAL
                } else {
                    NETWORK_DEFAULT
                }
            }
        }
    }

    /// Addresses of every node under the requested network resolution.
    pub fn node_addresses(&self, requested: NetworkResolution) -> Vec<NodeAddress> {
        let network = self.effective_network(requested);
        self.nodes_ext
            .iter()
            .map(|node| {
                let hostname = node
                    .hostname
                    .clone()
                    .unwrap_or_else(|| self.origin.clone());
                match node.alternate_addresses.get(network) {
                    Some(alt) if network == NETWORK_EXTERNAL => NodeAddress {
                        hostname: alt.hostname.clone(),
                        this_node: node.this_node,
                        // Alternate blocks may omit ports that are
                        // unchanged from the default family.
                        services: node
                            .services
                            .iter()
                            .map(|(key, port)| {
                                (key.clone(), alt.ports.get(key).copied().unwrap_or(*port))
                            })
                            .collect(),
                    },
                    _ => NodeAddress {
                        hostname,
                        this_node: node.this_node,
                        services: node.services.clone(),
                    },
                }
            })
            .collect()
    }

    /// KV endpoints in `nodesExt` order.
    pub fn kv_endpoints(&self, requested: NetworkResolution, tls: bool) -> Vec<(String, u16)> {
        self.node_addresses(requested)
            .into_iter()
            .filter_map(|address| address.kv_endpoint(tls))
            .collect()
    }

    /// KV endpoints in `serverList` order — the order vBucket server
    /// indices refer to. Entries are written in the default address
    /// family with plain KV ports; each is translated to the requested
    /// family by matching it against the default-family address table.
    pub fn server_endpoints(&self, requested: NetworkResolution, tls: bool) -> Vec<(String, u16)> {
        let server_list = match &self.vbucket_server_map {
            Some(map) => &map.server_list,
            None => return Vec::new(),
        };
        let defaults = self.node_addresses(NetworkResolution::Default);
        let resolved = self.node_addresses(requested);

        server_list
            .iter()
            .map(|entry| {
                let (host, port) = match entry.rsplit_once(':') {
                    Some((host, port)) => (host, port.parse::<u16>().unwrap_or(0)),
                    None => (entry.as_str(), 0),
                };
                let index = defaults.iter().position(|address| {
                    address.hostname == host && address.kv_port(false) == Some(port)
                });
                match index.and_then(|index| resolved.get(index)) {
                    Some(address) => address
                        .kv_endpoint(tls)
                        .unwrap_or_else(|| (host.to_string(), port)),
                    None => (host.to_string(), port),
                }
            })
            .collect()
    }

    /// The endpoints a bucket's node list is built from, aligned with
    /// the routing indices of its locator.
    pub fn data_endpoints(&self, requested: NetworkResolution, tls: bool) -> Vec<(String, u16)> {
        match self.node_locator {
            Some(NodeLocator::Ketama) => self.kv_endpoints(requested, tls),
            _ => {
                let servers = self.server_endpoints(requested, tls);
                if servers.is_empty() {
                    self.kv_endpoints(requested, tls)
                } else {
                    servers
                }
            }
        }
    }

    pub fn supports_collections(&self) -> bool {
        self.bucket_capabilities
            .iter()
            .any(|capability| capability == "collections")
    }
}

/// The collections manifest for a bucket: uids are hex strings on the
/// wire, numeric cids in the protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsManifest {
    pub uid: String,
    #[serde(default)]
    pub scopes: Vec<ManifestScope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestScope {
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub collections: Vec<ManifestCollection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestCollection {
    pub name: String,
    pub uid: String,
}

impl CollectionsManifest {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn cid(&self, scope: &str, collection: &str) -> Option<u32> {
        self.scopes
            .iter()
            .find(|candidate| candidate.name == scope)?
            .collections
            .iter()
            .find(|candidate| candidate.name == collection)
            .and_then(|found| u32::from_str_radix(&found.uid, 16).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::{BucketConfig, CollectionsManifest, NodeLocator};
    use crate::options::NetworkResolution;

    pub(crate) const SAMPLE: &str = r#"{
        "rev": 7,
        "revEpoch": 1,
        "name": "travel",
        "uuid": "b6b5434e",
        "nodeLocator": "vbucket",
        "bucketCapabilities": ["collections", "xattr"],
        "nodesExt": [
            {
                "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "n1ql": 8093},
                "hostname": "$HOST",
                "thisNode": true
            },
            {
                "services": {"kv": 11210, "mgmt": 8091, "capi": 8092},
                "hostname": "node2.internal",
                "alternateAddresses": {
                    "external": {
                        "hostname": "203.0.113.7",
                        "ports": {"kv": 21210}
                    }
                }
            }
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["$HOST:11210", "node2.internal:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, 0]]
        }
    }"#;

    #[test]
    fn test_parse_substitutes_host() {
        let config = BucketConfig::parse(SAMPLE.as_bytes(), "10.1.1.5").unwrap();
        assert_eq!((1, 7), config.revision());
        assert_eq!("travel", config.name);
        assert_eq!(Some(NodeLocator::Vbucket), config.node_locator);
        assert!(config.supports_collections());

        let addresses = config.node_addresses(NetworkResolution::Default);
        assert_eq!("10.1.1.5", addresses[0].hostname);
        assert!(addresses[0].this_node);
        assert_eq!(
            vec![
                ("10.1.1.5".to_string(), 11210),
                ("node2.internal".to_string(), 11210)
            ],
            config.kv_endpoints(NetworkResolution::Default, false)
        );
    }

    #[test]
    fn test_external_network() {
        let config = BucketConfig::parse(SAMPLE.as_bytes(), "10.1.1.5").unwrap();
        let endpoints = config.kv_endpoints(NetworkResolution::External, false);
        // node 1 has no alternate block and keeps its default address
        assert_eq!(("10.1.1.5".to_string(), 11210), endpoints[0]);
        assert_eq!(("203.0.113.7".to_string(), 21210), endpoints[1]);
    }

    #[test]
    fn test_auto_network_prefers_matching_origin() {
        let config = BucketConfig::parse(SAMPLE.as_bytes(), "203.0.113.7").unwrap();
        assert_eq!(super::NETWORK_EXTERNAL, config.effective_network(NetworkResolution::Auto));

        let config = BucketConfig::parse(SAMPLE.as_bytes(), "10.1.1.5").unwrap();
        assert_eq!(super::NETWORK_DEFAULT, config.effective_network(NetworkResolution::Auto));
    }

    #[test]
    fn test_diff() {
        let old = BucketConfig::parse(SAMPLE.as_bytes(), "10.1.1.5").unwrap();
        let same = BucketConfig::parse(SAMPLE.as_bytes(), "10.1.1.5").unwrap();
        let diff = same.diff(&old);
        assert!(!diff.vbucket_map_changed);
        assert!(!diff.cluster_nodes_changed);

        let moved = SAMPLE.replace("node2.internal", "node3.internal");
        let moved = BucketConfig::parse(moved.as_bytes(), "10.1.1.5").unwrap();
        let diff = moved.diff(&old);
        assert!(diff.vbucket_map_changed);
        assert!(diff.cluster_nodes_changed);
    }

    #[test]
    fn test_manifest_cid() {
        let manifest = CollectionsManifest::parse(
            br#"{
                "uid": "2",
                "scopes": [
                    {"name": "_default", "uid": "0", "collections": [
                        {"name": "_default", "uid": "0"}
                    ]},
                    {"name": "inventory", "uid": "8", "collections": [
                        {"name": "hotels", "uid": "9"},
                        {"name": "routes", "uid": "a"}
                    ]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(Some(0x9), manifest.cid("inventory", "hotels"));
        assert_eq!(Some(0xa), manifest.cid("inventory", "routes"));
        assert_eq!(None, manifest.cid("inventory", "planes"));
    }
}
