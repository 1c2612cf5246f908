//! Rate limiter for callback invocations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::resources::Scheduler;

/// At most `count` firings within any window of `window` length.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub window: Duration,
    pub count: u32,
}

impl RateLimit {
    pub fn new(window: Duration, count: u32) -> Self {
        assert!(count > 0, "rate limit count must be positive");
        assert!(
            window > Duration::ZERO,
            "rate limit window must be positive"
        );
        Self { window, count }
    }
}

struct ThrottleState {
    recent_fires_ms: VecDeque<u64>,
    deferred: bool,
}

/// Bounds how often a wrapped listener fires. Calls to `fire` inside a
/// closed window collapse into a single deferred firing scheduled for the
/// end of the window.
pub struct Throttle {
    rate_limits: Vec<RateLimit>,
    scheduler: Arc<dyn Scheduler>,
    listener: Arc<dyn Fn() + Send + Sync>,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    pub fn new(
        rate_limits: Vec<RateLimit>,
        scheduler: Arc<dyn Scheduler>,
        listener: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            rate_limits,
            scheduler,
            listener,
            state: Mutex::new(ThrottleState {
                recent_fires_ms: VecDeque::new(),
                deferred: false,
            }),
        }
    }

    /// Requests a listener firing. Fires immediately when all rate limits
    /// allow it; otherwise schedules one deferred firing for the moment the
    /// tightest violated limit reopens.
    pub fn fire(self: &Arc<Self>) {
        let now_ms = self.scheduler.now_ms();
        let wait = {
            let mut state = self.state.lock().expect("throttle lock");
            if state.deferred {
                return;
            }
            match self.retry_in(&state, now_ms) {
                Some(wait) => {
                    state.deferred = true;
                    Some(wait)
                }
                None => {
                    Self::record_fire(&mut state, &self.rate_limits, now_ms);
                    None
                }
            }
        };

        match wait {
            Some(wait) => {
                let this = Arc::clone(self);
                self.scheduler.schedule(wait, Box::new(move || this.deferred_fire()));
            }
            None => (self.listener)(),
        }
    }

    fn deferred_fire(&self) {
        let now_ms = self.scheduler.now_ms();
        {
            let mut state = self.state.lock().expect("throttle lock");
            state.deferred = false;
            Self::record_fire(&mut state, &self.rate_limits, now_ms);
        }
        (self.listener)();
    }

    /// Milliseconds until every limit permits another firing, or `None` if
    /// one is allowed right now.
    fn retry_in(&self, state: &ThrottleState, now_ms: u64) -> Option<Duration> {
        let mut wait_ms: u64 = 0;
        for limit in &self.rate_limits {
            let window_ms = limit.window.as_millis() as u64;
            let in_window = state
                .recent_fires_ms
                .iter()
                .filter(|fired| now_ms.saturating_sub(**fired) < window_ms)
                .count();
            if in_window >= limit.count as usize {
                // The oldest firing still inside the window bounds when the
                // window reopens.
                let oldest = state
                    .recent_fires_ms
                    .iter()
                    .copied()
                    .filter(|fired| now_ms.saturating_sub(*fired) < window_ms)
                    .min()
                    .unwrap_or(now_ms);
                let reopen = oldest.saturating_add(window_ms).saturating_sub(now_ms);
                wait_ms = wait_ms.max(reopen.max(1));
            }
        }
        (wait_ms > 0).then(|| Duration::from_millis(wait_ms))
    }

    fn record_fire(state: &mut ThrottleState, rate_limits: &[RateLimit], now_ms: u64) {
        state.recent_fires_ms.push_back(now_ms);
        let max_window_ms = rate_limits
            .iter()
            .map(|limit| limit.window.as_millis() as u64)
            .max()
            .unwrap_or(0);
        while state
            .recent_fires_ms
            .front()
            .is_some_and(|fired| now_ms.saturating_sub(*fired) >= max_window_ms)
        {
            state.recent_fires_ms.pop_front();
        }
    }
}
