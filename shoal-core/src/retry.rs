//! Retry orchestration. Decisions consume the rich error kinds; when the
//! server published a retry strategy for the underlying status, that
//! strategy (constant, linear, exponential) governs the backoff, always
//! subject to the caller's deadline.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::errormap::ErrorMap;
use crate::protocol::Status;

/// Not-my-vbucket re-dispatches are immediate but bounded; beyond this
/// the topology is clearly churning and the error surfaces.
const NMV_RETRY_BUDGET: u32 = 5;

/// Fallback backoff when the error map has no strategy: exponential from
/// 1ms, capped.
const FALLBACK_CAP: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct RetryOrchestrator {
    deadline: Instant,
    attempt: u32,
    nmv_attempts: u32,
}

impl RetryOrchestrator {
    pub fn new(timeout: Duration) -> Self {
        RetryOrchestrator {
            deadline: Instant::now() + timeout,
            attempt: 0,
            nmv_attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Whether to retry after `error`, sleeping the appropriate backoff
    /// first. Returns false once the error is terminal, the NMV budget is
    /// spent, or the next delay would cross the deadline.
    pub async fn should_retry(&mut self, error: &Error, error_map: Option<&ErrorMap>) -> bool {
        if !error.is_retriable() {
            return false;
        }
        self.attempt += 1;

        if let Error::NotMyVbucket = error {
            // an updated config is already on its way; retry immediately
            self.nmv_attempts += 1;
            return self.nmv_attempts <= NMV_RETRY_BUDGET && Instant::now() < self.deadline;
        }

        let delay = self.delay_for(error, error_map);
        if Instant::now() + delay >= self.deadline {
            return false;
        }
        tokio::time::sleep(delay).await;
        true
    }

    fn delay_for(&self, error: &Error, error_map: Option<&ErrorMap>) -> Duration {
        let status = match error {
            Error::Temporary => Some(Status::TemporaryFailure),
            Error::Locked => Some(Status::Locked),
            Error::SyncWriteInProgress => Some(Status::SyncWriteInProgress),
            Error::CollectionOutdated => Some(Status::UnknownCollection),
            _ => None,
        };
        let published = status
            .and_then(|status| error_map?.lookup(u16::from(status)))
            .and_then(|code| code.retry.as_ref())
            .map(|spec| spec.delay(self.attempt));
        published.unwrap_or_else(|| {
            let exponent = self.attempt.saturating_sub(1).min(16);
            Duration::from_millis(1_u64 << exponent).min(FALLBACK_CAP)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryOrchestrator;
    use crate::error::Error;
    use crate::errormap::ErrorMap;

    #[tokio::test]
    async fn test_terminal_errors_never_retry() {
        let mut orchestrator = RetryOrchestrator::new(Duration::from_secs(5));
        assert!(!orchestrator.should_retry(&Error::NotFound, None).await);
        assert!(!orchestrator.should_retry(&Error::Cancelled, None).await);
        assert!(
            !orchestrator
                .should_retry(&Error::CircuitBreakerOpen, None)
                .await
        );
    }

    #[tokio::test]
    async fn test_nmv_budget_is_bounded() {
        let mut orchestrator = RetryOrchestrator::new(Duration::from_secs(5));
        let mut granted = 0;
        while orchestrator.should_retry(&Error::NotMyVbucket, None).await {
            granted += 1;
            assert!(granted < 100);
        }
        assert_eq!(super::NMV_RETRY_BUDGET, granted);
    }

    #[tokio::test]
    async fn test_deadline_stops_retries() {
        let mut orchestrator = RetryOrchestrator::new(Duration::from_millis(20));
        let mut granted = 0;
        while orchestrator.should_retry(&Error::Temporary, None).await {
            granted += 1;
            assert!(granted < 100);
        }
        // 1ms + 2ms + 4ms + 8ms fits in 20ms, 16ms more does not
        assert!(granted <= 5);
    }

    #[tokio::test]
    async fn test_published_strategy_is_used() {
        let map = ErrorMap::parse(
            br#"{
                "version": 1,
                "revision": 1,
                "errors": {
                    "86": {
                        "name": "ETMPFAIL",
                        "desc": "try later",
                        "attrs": ["retry-later"],
                        "retry": {"strategy": "constant", "interval": 1, "ceil": 1}
                    }
                }
            }"#,
        )
        .unwrap();
        let mut orchestrator = RetryOrchestrator::new(Duration::from_millis(500));
        // constant 1ms delays fit the deadline many times over
        for _ in 0..10 {
            assert!(orchestrator.should_retry(&Error::Temporary, Some(&map)).await);
        }
    }
}
