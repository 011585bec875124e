//! Client-side fixed-window request limiter. The ceiling is meant to sit
//! below the remote's own limit.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::common::clock::SharedClock;
use crate::common::lock;
use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    /// Calls admitted in the current window.
    pub requests: u32,
    pub window_start: u64,
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub requests: u32,
    pub window_start: u64,
    pub blocked: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
}

pub struct RateLimiter {
    state: Mutex<RateLimitState>,
    window_ms: u64,
    max_requests: u32,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(clock: SharedClock, window_ms: u64, max_requests: u32) -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                requests: 0,
                window_start: clock.now_ms(),
                blocked: false,
            }),
            window_ms,
            max_requests,
            clock,
        }
    }

    pub fn from_config(clock: SharedClock, config: &SyncConfig) -> Self {
        Self::new(
            clock,
            config.rate_limit_window_ms,
            config.rate_limit_max_requests,
        )
    }

    fn roll_window(&self, st: &mut RateLimitState, now: u64) {
        if now.saturating_sub(st.window_start) >= self.window_ms {
            *st = RateLimitState {
                requests: 0,
                window_start: now,
                blocked: false,
            };
        }
    }

    /// Whether a new call may go out now. Admission counts against the
    /// current window; denial does not.
    pub fn admit(&self) -> bool {
        let now = self.clock.now_ms();
        let mut st = lock(&self.state);
        self.roll_window(&mut st, now);

        if st.blocked || st.requests >= self.max_requests {
            st.blocked = true;
            return false;
        }

        st.requests += 1;
        if st.requests >= self.max_requests {
            st.blocked = true;
            log::warn!("Rate limit reached, requests will be queued");
        }
        true
    }

    /// The remote rejected a call for rate reasons. Block locally for the rest
    /// of the window, or until `retry_after` when the remote said so.
    pub fn record_server_rejection(&self, retry_after: Option<Duration>) {
        let now = self.clock.now_ms();
        let mut st = lock(&self.state);
        self.roll_window(&mut st, now);

        st.requests = self.max_requests;
        st.blocked = true;
        if let Some(wait) = retry_after {
            let until = now.saturating_add(wait.as_millis() as u64);
            st.window_start = until.saturating_sub(self.window_ms);
        }
        log::warn!("Remote rate limit hit, blocking outgoing calls");
    }

    pub fn snapshot(&self) -> RateLimitState {
        let now = self.clock.now_ms();
        let mut st = lock(&self.state);
        self.roll_window(&mut st, now);
        *st
    }

    pub fn get_rate_limit_info(&self) -> RateLimitInfo {
        let now = self.clock.now_ms();
        let st = self.snapshot();
        let window_end = st.window_start.saturating_add(self.window_ms);
        RateLimitInfo {
            requests: st.requests,
            window_start: st.window_start,
            blocked: st.blocked,
            remaining: self.max_requests.saturating_sub(st.requests),
            reset_in_ms: window_end.saturating_sub(now),
        }
    }

    pub fn reset(&self) {
        let now = self.clock.now_ms();
        *lock(&self.state) = RateLimitState {
            requests: 0,
            window_start: now,
            blocked: false,
        };
    }
}
