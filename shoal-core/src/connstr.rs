//! Connection string parsing: `shoal://host1[:port][,host2...][/bucket]`
//! or `shoals://...` for TLS. A bare single host with no explicit port is
//! eligible for DNS-SRV expansion. Hand-parsed because the multi-host
//! authority is not a valid RFC 3986 URI.

use std::collections::HashMap;

use crate::error::Error;

pub const SCHEME: &str = "shoal";
pub const SCHEME_TLS: &str = "shoals";

/// SRV service labels, completed as `_shoal._tcp.<host>`.
pub const SRV_SERVICE: &str = "_shoal._tcp";
pub const SRV_SERVICE_TLS: &str = "_shoals._tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub tls: bool,
    pub hosts: Vec<(String, Option<u16>)>,
    pub bucket: Option<String>,
    pub params: HashMap<String, String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (tls, rest) = if let Some(rest) = raw.strip_prefix("shoals://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("shoal://") {
            (false, rest)
        } else if raw.contains("://") {
            return Err(Error::InvalidConnectionString(format!(
                "unsupported scheme in '{}'",
                raw
            )));
        } else {
            (false, raw)
        };

        let (rest, params) = match rest.split_once('?') {
            Some((rest, query)) => (rest, parse_params(query)),
            None => (rest, HashMap::new()),
        };

        let (authority, bucket) = match rest.split_once('/') {
            Some((authority, bucket)) if !bucket.is_empty() => {
                (authority, Some(bucket.to_string()))
            }
            Some((authority, _)) => (authority, None),
            None => (rest, None),
        };

        if authority.is_empty() {
            return Err(Error::InvalidConnectionString(
                "no hosts in connection string".into(),
            ));
        }

        let mut hosts = Vec::new();
        for part in authority.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::InvalidConnectionString(format!("bad port in '{}'", part))
                    })?;
                    hosts.push((host.to_string(), Some(port)));
                }
                None => hosts.push((part.to_string(), None)),
            }
        }

        if hosts.is_empty() {
            return Err(Error::InvalidConnectionString(
                "no hosts in connection string".into(),
            ));
        }

        Ok(ConnectionString {
            tls,
            hosts,
            bucket,
            params,
        })
    }

    /// SRV expansion applies only to a single bare hostname. An explicit
    /// port or host list means the caller already knows the topology.
    pub fn srv_eligible(&self) -> bool {
        self.hosts.len() == 1 && self.hosts[0].1.is_none()
    }

    pub fn srv_name(&self) -> Option<String> {
        if !self.srv_eligible() {
            return None;
        }
        let service = if self.tls { SRV_SERVICE_TLS } else { SRV_SERVICE };
        Some(format!("{}.{}", service, self.hosts[0].0))
    }

    /// Hosts with the scheme-appropriate default KV port filled in.
    pub fn bootstrap_endpoints(&self, default_port: u16) -> Vec<(String, u16)> {
        self.hosts
            .iter()
            .map(|(host, port)| (host.clone(), port.unwrap_or(default_port)))
            .collect()
    }
}

fn parse_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::ConnectionString;

    #[test]
    fn test_single_host() {
        let cs = ConnectionString::parse("shoal://db.example.com").unwrap();
        assert!(!cs.tls);
        assert_eq!(vec![("db.example.com".to_string(), None)], cs.hosts);
        assert_eq!(None, cs.bucket);
        assert!(cs.srv_eligible());
        assert_eq!(
            Some("_shoal._tcp.db.example.com".to_string()),
            cs.srv_name()
        );
    }

    #[test]
    fn test_multi_host_with_bucket() {
        let cs = ConnectionString::parse("shoals://a:11207,b,c:9999/travel").unwrap();
        assert!(cs.tls);
        assert_eq!(3, cs.hosts.len());
        assert_eq!(("a".to_string(), Some(11207)), cs.hosts[0]);
        assert_eq!(("b".to_string(), None), cs.hosts[1]);
        assert_eq!(Some("travel".to_string()), cs.bucket);
        assert!(!cs.srv_eligible());
    }

    #[test]
    fn test_params_and_defaults() {
        let cs = ConnectionString::parse("shoal://a/b?network=external&kv_timeout=5000").unwrap();
        assert_eq!(Some("external"), cs.params.get("network").map(String::as_str));
        assert_eq!(vec![("a".to_string(), 11210)], cs.bootstrap_endpoints(11210));
    }

    #[test]
    fn test_schemeless() {
        let cs = ConnectionString::parse("10.0.0.1:11210").unwrap();
        assert_eq!(vec![("10.0.0.1".to_string(), Some(11210))], cs.hosts);
        assert!(!cs.srv_eligible());
    }

    #[test]
    fn test_rejects_foreign_scheme() {
        assert!(ConnectionString::parse("http://example.com").is_err());
        assert!(ConnectionString::parse("shoal://").is_err());
    }
}
