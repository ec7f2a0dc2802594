//! Key-to-node routing. Document buckets hash keys onto a fixed vBucket
//! map; memcached-type buckets use a consistent-hash ring over the node
//! set. Mappers are immutable once built and swapped by reference when a
//! new config revision lands.

mod ketama;
mod vbucket;

pub use ketama::KetamaRing;
pub use vbucket::VbucketMap;

use crate::config::{BucketConfig, NodeLocator};
use crate::error::Error;
use crate::options::NetworkResolution;

/// Where a key routes: the vBucket it hashed to (document buckets only)
/// and a server index into the config's node list. A server index of -1
/// means no node currently owns the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub vbucket: Option<u16>,
    pub server: i32,
}

#[derive(Debug)]
pub enum KeyMapper {
    Vbucket(VbucketMap),
    Ketama(KetamaRing),
}

impl KeyMapper {
    pub fn from_config(
        config: &BucketConfig,
        network: NetworkResolution,
        tls: bool,
    ) -> Result<Self, Error> {
        match config.node_locator {
            Some(NodeLocator::Ketama) => {
                let endpoints: Vec<String> = config
                    .kv_endpoints(network, tls)
                    .into_iter()
                    .map(|(host, port)| format!("{}:{}", host, port))
                    .collect();
                Ok(KeyMapper::Ketama(KetamaRing::new(&endpoints)?))
            }
            _ => {
                let server_map = config.vbucket_server_map.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("config carries no vBucket server map".into())
                })?;
                Ok(KeyMapper::Vbucket(VbucketMap::new(
                    server_map.vbucket_map.clone(),
                    server_map.num_replicas as usize,
                )?))
            }
        }
    }

    /// Route a key to its primary.
    pub fn route(&self, key: &[u8]) -> Route {
        match self {
            KeyMapper::Vbucket(map) => {
                let vbucket = map.vbucket_id(key);
                Route {
                    vbucket: Some(vbucket),
                    server: map.primary(vbucket),
                }
            }
            KeyMapper::Ketama(ring) => Route {
                vbucket: None,
                server: ring.server_index(key) as i32,
            },
        }
    }

    /// Route a key to replica `index` (0-based). Only meaningful for
    /// document buckets.
    pub fn replica_route(&self, key: &[u8], index: usize) -> Option<Route> {
        match self {
            KeyMapper::Vbucket(map) => {
                let vbucket = map.vbucket_id(key);
                Some(Route {
                    vbucket: Some(vbucket),
                    server: map.replica(vbucket, index),
                })
            }
            KeyMapper::Ketama(_) => None,
        }
    }
}
