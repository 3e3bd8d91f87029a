//! Count-based sliding-window circuit breaker.
//!
//! Closed: outcomes are recorded in a fixed window; once at least
//! `minimum_calls` are present and the failure rate or slow-call rate
//! reaches the threshold, the breaker opens. Open: calls fail fast until
//! `open_duration` elapses. Half-open: a fixed number of probe calls run;
//! any probe failure re-opens, an all-clear closes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::store::{BreakerPolicy, StoreError};

#[derive(Debug, Clone, Copy)]
struct Outcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { started: u32, finished: u32, failed: u32 },
}

pub struct CircuitBreaker {
    policy: BreakerPolicy,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    window: VecDeque<Outcome>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        CircuitBreaker {
            policy,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::new(),
            }),
        }
    }

    /// Ask permission to run one call. Fails fast with
    /// [`StoreError::CircuitOpen`] while the breaker is open or the
    /// half-open probe budget is spent.
    pub fn try_acquire(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.state {
            State::Closed => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    info!("circuit breaker half-open, admitting probe calls");
                    inner.state = State::HalfOpen {
                        started: 1,
                        finished: 0,
                        failed: 0,
                    };
                    Ok(())
                } else {
                    Err(StoreError::CircuitOpen)
                }
            }
            State::HalfOpen {
                started,
                finished,
                failed,
            } => {
                if started < self.policy.half_open_trials {
                    inner.state = State::HalfOpen {
                        started: started + 1,
                        finished,
                        failed,
                    };
                    Ok(())
                } else {
                    Err(StoreError::CircuitOpen)
                }
            }
        }
    }

    /// Record the outcome of a permitted call.
    pub fn record(&self, call_failed: bool, elapsed: Duration) {
        let slow = elapsed >= self.policy.slow_call_threshold;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        match inner.state {
            State::Closed => {
                inner.window.push_back(Outcome {
                    failed: call_failed,
                    slow,
                });
                while inner.window.len() > self.policy.window_size {
                    inner.window.pop_front();
                }
                if self.window_trips(&inner.window) {
                    warn!(
                        open_for = ?self.policy.open_duration,
                        "circuit breaker opened"
                    );
                    inner.window.clear();
                    inner.state = State::Open {
                        until: Instant::now() + self.policy.open_duration,
                    };
                }
            }
            State::HalfOpen {
                started,
                finished,
                failed,
            } => {
                let finished = finished + 1;
                let failed = failed + u32::from(call_failed || slow);
                if failed > 0 {
                    warn!("half-open probe failed, re-opening circuit breaker");
                    inner.state = State::Open {
                        until: Instant::now() + self.policy.open_duration,
                    };
                } else if finished >= self.policy.half_open_trials && finished >= started {
                    info!("circuit breaker closed");
                    inner.window.clear();
                    inner.state = State::Closed;
                } else {
                    inner.state = State::HalfOpen {
                        started,
                        finished,
                        failed,
                    };
                }
            }
            // a straggler from before the breaker opened; nothing to count
            State::Open { .. } => {}
        }
    }

    fn window_trips(&self, window: &VecDeque<Outcome>) -> bool {
        if window.len() < self.policy.minimum_calls {
            return false;
        }
        let total = window.len() as f64;
        let failures = window.iter().filter(|o| o.failed).count() as f64;
        let slow = window.iter().filter(|o| o.slow).count() as f64;
        failures * 100.0 / total >= self.policy.failure_rate_threshold
            || slow * 100.0 / total >= self.policy.slow_call_rate_threshold
    }
}
