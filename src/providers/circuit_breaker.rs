use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-provider circuit breaker: closed/open/half-open, threshold N
/// consecutive failures opens it, a reset timeout half-opens it; a
/// half-open success closes it, a half-open failure reopens it. Counters
/// are mutated under a local lock since this is purely in-process state.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether a call should be allowed through right now. An open breaker
    /// past its reset timeout transitions to half-open and allows exactly
    /// one probe call through.
    pub fn allow_call(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
            }
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(cb.allow_call());
        cb.on_failure();
        cb.on_failure();
        assert!(!cb.is_open());
        cb.on_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_call());
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.on_failure();
        assert!(cb.is_open());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_call()); // transitions to half-open
        cb.on_success();
        assert!(!cb.is_open());
    }

    #[test]
    fn half_open_failure_reopens_breaker() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.on_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow_call());
        cb.on_failure();
        assert!(cb.is_open());
    }
}
