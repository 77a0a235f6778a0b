//! Token-bucket flow control (ambient DoS hygiene, not named by the core
//! protocol but carried from the teacher's own rate limiting module).

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self { tokens: capacity, capacity, rate_per_sec, last_update: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// One bucket per inbound message class, so a flood of `HashRequest`s can't
/// starve `BlockRequest` handling on the same session.
#[derive(Debug, Clone)]
pub struct PeerRateLimits {
    pub hash_requests: TokenBucket,
    pub block_requests: TokenBucket,
    pub node_requests: TokenBucket,
}

impl PeerRateLimits {
    pub fn new() -> Self {
        Self {
            hash_requests: TokenBucket::new(20.0, 2.0),
            block_requests: TokenBucket::new(40.0, 4.0),
            node_requests: TokenBucket::new(5.0, 0.5),
        }
    }
}

impl Default for PeerRateLimits {
    fn default() -> Self {
        Self::new()
    }
}
