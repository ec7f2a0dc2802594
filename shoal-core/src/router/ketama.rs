use murmur3::murmur3_32;

use crate::error::Error;

const DEFAULT_SIZE: usize = 360;

/// A consistent-hash ring mapping keys to server indices, used for
/// memcached-type buckets. Each server owns an equal share of ring
/// positions, so topology changes reshuffle only a fraction of the keys.
#[derive(Debug, Clone)]
pub struct KetamaRing {
    buckets: Vec<(u32, usize)>,
}

impl KetamaRing {
    pub fn new(servers: &[String]) -> Result<Self, Error> {
        Self::new_with_size(servers, DEFAULT_SIZE)
    }

    pub fn new_with_size(servers: &[String], size: usize) -> Result<Self, Error> {
        if servers.is_empty() {
            return Err(Error::InvalidConfig("ketama ring with no servers".into()));
        }
        let mut buckets = Vec::with_capacity(size);
        let share = size / servers.len();
        for (server_index, server) in servers.iter().enumerate() {
            for position in 0..share {
                let hash = murmur3_32(&mut server.as_bytes(), position as u32)?;
                buckets.push((hash, server_index));
            }
        }
        buckets.sort_unstable();
        Ok(KetamaRing { buckets })
    }

    /// Index of the server owning the ring position the key hashes to.
    pub fn server_index(&self, mut key: &[u8]) -> usize {
        let ring_pos = murmur3_32(&mut key, 0).unwrap_or(0);
        let bucket_search = self.buckets.binary_search_by_key(&ring_pos, |(hash, _)| *hash);
        let bucket_index = bucket_search.unwrap_or_else(|next_bucket| next_bucket);
        let (_, server_index) = self.buckets.get(bucket_index).unwrap_or(&self.buckets[0]);
        *server_index
    }
}

#[cfg(test)]
mod tests {
    use super::KetamaRing;

    #[test]
    fn test_stable_assignment() {
        let servers = vec![
            "node-a:11210".to_string(),
            "node-b:11210".to_string(),
            "node-c:11210".to_string(),
        ];
        let ring = KetamaRing::new(&servers).unwrap();
        let first = ring.server_index(b"session:42");
        for _ in 0..32 {
            assert_eq!(first, ring.server_index(b"session:42"));
        }
        assert!(first < servers.len());
    }

    #[test]
    fn test_spread_across_servers() {
        let servers = vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()];
        let ring = KetamaRing::new(&servers).unwrap();
        let mut seen = [false; 3];
        for index in 0..500_u32 {
            let key = format!("key-{}", index);
            seen[ring.server_index(key.as_bytes())] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }

    #[test]
    fn test_wraps_past_last_bucket() {
        let servers = vec!["only:1".to_string()];
        let ring = KetamaRing::new_with_size(&servers, 2).unwrap();
        assert_eq!(0, ring.server_index(b"anything"));
    }

    #[test]
    fn test_rejects_empty_server_list() {
        assert!(KetamaRing::new(&[]).is_err());
    }
}
