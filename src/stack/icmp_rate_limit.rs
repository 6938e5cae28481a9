//! Global limit on ICMP error generation.

use crate::tcpip::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Default sustained rate, errors per second.
pub const DEFAULT_LIMIT: f64 = 1000.0;

/// Default burst size.
pub const DEFAULT_BURST: u32 = 50;

#[derive(Debug)]
struct TokenBucket {
    limit: f64,
    burst: u32,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        if self.limit > 0.0 {
            self.tokens = (self.tokens + elapsed * self.limit).min(self.burst as f64);
        }
    }
}

/// Token bucket deciding whether an ICMP error may be sent.
///
/// Starts full. Tokens come back at `limit` per second up to `burst`.
#[derive(Debug)]
pub struct IcmpRateLimiter {
    clock: Arc<dyn Clock>,
    bucket: Mutex<TokenBucket>,
}

impl IcmpRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limit(DEFAULT_LIMIT, DEFAULT_BURST, clock)
    }

    pub fn with_limit(limit: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            bucket: Mutex::new(TokenBucket {
                limit,
                burst,
                tokens: burst as f64,
                last: now,
            }),
        }
    }

    /// Take a token if one is available.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut b = self.bucket.lock();
        b.refill(now);
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn limit(&self) -> f64 {
        self.bucket.lock().limit
    }

    pub fn burst(&self) -> u32 {
        self.bucket.lock().burst
    }

    /// Change the sustained rate. Tokens earned so far are kept.
    pub fn set_limit(&self, limit: f64) {
        let now = self.clock.now();
        let mut b = self.bucket.lock();
        b.refill(now);
        b.limit = limit;
    }

    pub fn set_burst(&self, burst: u32) {
        let now = self.clock.now();
        let mut b = self.bucket.lock();
        b.refill(now);
        b.burst = burst;
        b.tokens = b.tokens.min(burst as f64);
    }
}
