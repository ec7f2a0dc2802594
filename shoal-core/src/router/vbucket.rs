use crate::error::Error;

/// The vBucket map: an array of shards, each listing the primary server
/// index followed by the replica indices. The key hash is the standard
/// CRC-32, folded to 15 bits the way the server computes placement.
#[derive(Debug, Clone, PartialEq)]
pub struct VbucketMap {
    map: Vec<Vec<i32>>,
    num_replicas: usize,
}

impl VbucketMap {
    pub fn new(map: Vec<Vec<i32>>, num_replicas: usize) -> Result<Self, Error> {
        if map.is_empty() {
            return Err(Error::InvalidConfig("empty vBucket map".into()));
        }
        Ok(VbucketMap { map, num_replicas })
    }

    pub fn vbucket_count(&self) -> usize {
        self.map.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn vbucket_id(&self, key: &[u8]) -> u16 {
        let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
        (hash % self.map.len() as u32) as u16
    }

    /// Server index owning the vBucket, or -1 while unassigned (e.g.
    /// mid-rebalance).
    pub fn primary(&self, vbucket: u16) -> i32 {
        self.map
            .get(vbucket as usize)
            .and_then(|entry| entry.first())
            .copied()
            .unwrap_or(-1)
    }

    /// Replica `index` (0-based) of the vBucket; -1 means no replica is
    /// available in that slot.
    pub fn replica(&self, vbucket: u16, index: usize) -> i32 {
        if index >= self.num_replicas {
            return -1;
        }
        self.map
            .get(vbucket as usize)
            .and_then(|entry| entry.get(index + 1))
            .copied()
            .unwrap_or(-1)
    }
}
