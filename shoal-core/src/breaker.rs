//! A per-node circuit breaker. Closed tracks a rolling failure window;
//! Open fast-fails everything until the sleep window elapses; HalfOpen
//! admits a single canary no-op whose outcome decides between Closed and
//! another Open period.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct BreakerOptions {
    pub enabled: bool,
    /// Minimum samples in the rolling window before the breaker may trip.
    pub volume_threshold: u32,
    pub error_threshold_percentage: u32,
    pub sleep_window: Duration,
    pub rolling_window: Duration,
    pub canary_timeout: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        BreakerOptions {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
            canary_timeout: Duration::from_millis(2_500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// What the send pipeline should do with the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Reject,
    /// Reject the request, but probe the node with a canary no-op.
    Canary,
}

#[derive(Debug)]
struct Window {
    state: BreakerState,
    window_start: Instant,
    total: u32,
    failed: u32,
    opened_at: Instant,
    canary_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    options: BreakerOptions,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(options: BreakerOptions) -> Self {
        CircuitBreaker {
            options,
            window: Mutex::new(Window {
                state: BreakerState::Closed,
                window_start: Instant::now(),
                total: 0,
                failed: 0,
                opened_at: Instant::now(),
                canary_in_flight: false,
            }),
        }
    }

    pub fn canary_timeout(&self) -> Duration {
        self.options.canary_timeout
    }

    pub fn state(&self) -> BreakerState {
        self.window.lock().state
    }

    pub fn precheck(&self) -> BreakerDecision {
        if !self.options.enabled {
            return BreakerDecision::Allow;
        }
        let mut window = self.window.lock();
        match window.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                if window.opened_at.elapsed() >= self.options.sleep_window {
                    window.state = BreakerState::HalfOpen;
                    window.canary_in_flight = true;
                    BreakerDecision::Canary
                } else {
                    BreakerDecision::Reject
                }
            }
            BreakerState::HalfOpen => {
                if window.canary_in_flight {
                    BreakerDecision::Reject
                } else {
                    window.canary_in_flight = true;
                    BreakerDecision::Canary
                }
            }
        }
    }

    pub fn mark_success(&self) {
        if !self.options.enabled {
            return;
        }
        let mut window = self.window.lock();
        match window.state {
            BreakerState::HalfOpen => {
                tracing::debug!("circuit breaker closed after successful canary");
                reset_window(&mut window, BreakerState::Closed);
            }
            BreakerState::Closed => {
                roll(&mut window, self.options.rolling_window);
                window.total += 1;
            }
            BreakerState::Open => {}
        }
    }

    pub fn mark_failure(&self) {
        if !self.options.enabled {
            return;
        }
        let mut window = self.window.lock();
        match window.state {
            BreakerState::HalfOpen => {
                tracing::debug!("circuit breaker reopened after failed canary");
                reset_window(&mut window, BreakerState::Open);
                window.opened_at = Instant::now();
            }
            BreakerState::Closed => {
                roll(&mut window, self.options.rolling_window);
                window.total += 1;
                window.failed += 1;
                if window.total >= self.options.volume_threshold
                    && window.failed * 100 / window.total >= self.options.error_threshold_percentage
                {
                    tracing::warn!(
                        total = window.total,
                        failed = window.failed,
                        "circuit breaker opened"
                    );
                    reset_window(&mut window, BreakerState::Open);
                    window.opened_at = Instant::now();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut window = self.window.lock();
        reset_window(&mut window, BreakerState::Closed);
    }

    /// Which completions count against the breaker: transport-level
    /// failures and timeouts, not server-side statuses like a missing
    /// key.
    pub fn counts_as_failure(error: &Error) -> bool {
        matches!(
            error,
            Error::Io(_) | Error::ConnectionDead | Error::Timeout { .. }
        )
    }
}

fn reset_window(window: &mut Window, state: BreakerState) {
    window.state = state;
    window.window_start = Instant::now();
    window.total = 0;
    window.failed = 0;
    window.canary_in_flight = false;
}

fn roll(window: &mut Window, rolling_window: Duration) {
    if window.window_start.elapsed() >= rolling_window {
        window.window_start = Instant::now();
        window.total = 0;
        window.failed = 0;
    }
}
