//! The server-published error map: metadata about status codes the client
//! may not know, including whether and how to retry them.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMap {
    pub version: u32,
    pub revision: u32,
    errors: HashMap<String, ErrorCode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorCode {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(default)]
    pub attrs: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySpec {
    pub strategy: RetryStrategy,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub after: Option<u64>,
    #[serde(rename = "max-duration", default)]
    pub max_duration: Option<u64>,
    #[serde(default)]
    pub ceil: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    Constant,
    Linear,
    Exponential,
}

impl ErrorMap {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Error map keys are lower-case hex status codes.
    pub fn lookup(&self, status: u16) -> Option<&ErrorCode> {
        self.errors.get(&format!("{:x}", status))
    }
}

impl ErrorCode {
    pub fn is_retriable(&self) -> bool {
        self.retry.is_some()
            || self
                .attrs
                .iter()
                .any(|attr| attr == "retry-now" || attr == "retry-later" || attr == "auto-retry")
    }
}

impl RetrySpec {
    /// Delay before retry `attempt` (1-based), honoring the published
    /// strategy and ceiling. The optional `after` offset applies to the
    /// first attempt only.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            RetryStrategy::Constant => self.interval,
            RetryStrategy::Linear => self.interval.saturating_mul(attempt as u64),
            RetryStrategy::Exponential => self
                .interval
                .saturating_mul(1_u64 << attempt.saturating_sub(1).min(32)),
        };
        let mut millis = match self.ceil {
            Some(ceil) if ceil > 0 => base.min(ceil),
            _ => base,
        };
        if attempt == 1 {
            if let Some(after) = self.after {
                millis = millis.max(after);
            }
        }
        Duration::from_millis(millis)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.max_duration.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ErrorMap, RetryStrategy};

    const SAMPLE: &str = r#"{
        "version": 1,
        "revision": 4,
        "errors": {
            "7": {
                "name": "NOT_MY_VBUCKET",
                "desc": "Request for vbucket belonging to another server",
                "attrs": ["invalid-arguments", "auto-retry"]
            },
            "86": {
                "name": "ETMPFAIL",
                "desc": "Temporary failure, try again later",
                "attrs": ["temp", "retry-later"],
                "retry": {
                    "strategy": "exponential",
                    "interval": 2,
                    "after": 10,
                    "max-duration": 1000,
                    "ceil": 200
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(4, map.revision);

        let nmv = map.lookup(0x07).unwrap();
        assert_eq!("NOT_MY_VBUCKET", nmv.name);
        assert!(nmv.is_retriable());
        assert!(nmv.retry.is_none());

        assert!(map.lookup(0x99).is_none());
    }

    #[test]
    fn test_retry_delays() {
        let map = ErrorMap::parse(SAMPLE.as_bytes()).unwrap();
        let retry = map.lookup(0x86).unwrap().retry.as_ref().unwrap();
        assert_eq!(RetryStrategy::Exponential, retry.strategy);

        // first attempt is floored by `after`
        assert_eq!(Duration::from_millis(10), retry.delay(1));
        assert_eq!(Duration::from_millis(4), retry.delay(2));
        assert_eq!(Duration::from_millis(8), retry.delay(3));
        // capped by ceil
        assert_eq!(Duration::from_millis(200), retry.delay(12));
        assert_eq!(Some(Duration::from_millis(1000)), retry.budget());
    }
}
