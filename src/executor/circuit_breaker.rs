use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::{Duration, Instant};

/// Breaker settings
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failures inside `window` that open the breaker
    pub failure_threshold: u32,
    /// Sliding window for failure counting
    pub window: Duration,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call decides between closed and open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Failure-isolation state machine for one agent
///
/// Time is passed in by the caller so the executor and tests share one clock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    /// When the breaker opened, or when the current probe was admitted
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Current state, without advancing the cooldown
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures currently inside the window
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    /// Asks permission for one call
    ///
    /// An open breaker whose cooldown elapsed becomes half-open and admits
    /// exactly one probe; further calls are refused until that probe reports.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |opened| now.duration_since(opened) >= self.config.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.opened_at = Some(now);
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // a probe whose caller vanished is replaced after one cooldown
                let stale = self
                    .opened_at
                    .map_or(true, |probed| now.duration_since(probed) >= self.config.cooldown);
                if self.probe_in_flight && !stale {
                    false
                } else {
                    self.opened_at = Some(now);
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Reports a successful call
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Reports a failed call; returns true when this failure opened the breaker
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                self.trip(now);
                true
            }
            CircuitState::Open => false,
            CircuitState::Closed => {
                self.failures.push_back(now);
                while let Some(oldest) = self.failures.front() {
                    if now.duration_since(*oldest) > self.config.window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() >= self.config.failure_threshold.max(1) as usize {
                    self.trip(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Instant::now();
        let mut cb = breaker(3);
        assert!(!cb.record_failure(now));
        assert!(!cb.record_failure(now));
        assert!(cb.record_failure(now));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);

        let later = now + Duration::from_secs(6);
        assert!(cb.try_acquire(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire(later));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(later));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);
        let later = now + Duration::from_secs(6);
        assert!(cb.try_acquire(later));
        assert!(cb.record_failure(later));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_old_failures_leave_the_window() {
        let now = Instant::now();
        let mut cb = breaker(2);
        cb.record_failure(now);
        assert!(!cb.record_failure(now + Duration::from_secs(11)));
        assert_eq!(cb.recent_failures(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    proptest! {
        #[test]
        fn open_breaker_never_admits_before_cooldown(offsets in proptest::collection::vec(0u64..4_999, 1..20)) {
            let now = Instant::now();
            let mut cb = breaker(1);
            cb.record_failure(now);
            for ms in offsets {
                prop_assert!(!cb.try_acquire(now + Duration::from_millis(ms)));
            }
        }
    }
}
