//! Byte-rate throttling for streaming transfers
//!
//! This crate bounds the throughput of a byte stream with a token bucket.
//! Tokens accumulate at the configured rate (one token per byte) up to a
//! burst capacity of twice the rate; a transfer consumes as many tokens as
//! bytes moved. When the bucket is empty the caller waits, in slices of at
//! most 100ms so that cancellation is never delayed by a long sleep.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::{RateLimiter, ThrottledWriter};
//!
//! # async fn example(socket: tokio::net::TcpStream) {
//! // 10 MiB/s; a rate of 0 means unlimited (pass-through)
//! let limiter = RateLimiter::new(10 * 1024 * 1024);
//! let writer = ThrottledWriter::new(socket, limiter.clone());
//! // write payload through `writer`; the rate may be changed mid-stream
//! limiter.set_rate(5 * 1024 * 1024);
//! # }
//! ```
//!
//! The limiter never manufactures I/O errors; wrappers propagate the
//! underlying stream's errors verbatim.

mod io;

pub use io::{ThrottledReader, ThrottledWriter};

use std::sync::{Arc, Mutex};

/// Maximum single sleep while waiting for tokens; bounds cancellation latency.
pub const WAIT_SLICE: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    /// tokens (= bytes) per second
    rate: f64,
    /// burst capacity, 2x rate
    capacity: f64,
    tokens: f64,
    last_refill: tokio::time::Instant,
}

impl Bucket {
    fn new(rate: u64) -> Self {
        let rate = rate as f64;
        Self {
            rate,
            capacity: 2.0 * rate,
            tokens: 2.0 * rate,
            last_refill: tokio::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Shared token-bucket limiter; cheap to clone via [`RateLimiter::new`]
/// returning an [`Arc`].
///
/// A rate of zero disables throttling entirely.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Option<Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Arc<Self> {
        let bucket = if rate_bytes_per_sec == 0 {
            None
        } else {
            Some(Bucket::new(rate_bytes_per_sec))
        };
        Arc::new(Self {
            bucket: Mutex::new(bucket),
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.lock().unwrap().is_none()
    }

    /// Change the rate mid-stream. Capacity is recomputed and the current
    /// token balance is clamped to the new capacity. A rate of zero switches
    /// the limiter to pass-through.
    pub fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut guard = self.bucket.lock().unwrap();
        if rate_bytes_per_sec == 0 {
            *guard = None;
            return;
        }
        match guard.as_mut() {
            Some(bucket) => {
                bucket.refill();
                bucket.rate = rate_bytes_per_sec as f64;
                bucket.capacity = 2.0 * bucket.rate;
                bucket.tokens = bucket.tokens.min(bucket.capacity);
            }
            None => *guard = Some(Bucket::new(rate_bytes_per_sec)),
        }
    }

    /// Try to take up to `want` tokens. Returns the granted count, or the
    /// duration to wait before retrying (at most [`WAIT_SLICE`]).
    pub fn try_acquire(&self, want: usize) -> Result<usize, std::time::Duration> {
        let mut guard = self.bucket.lock().unwrap();
        let Some(bucket) = guard.as_mut() else {
            return Ok(want);
        };
        bucket.refill();
        if bucket.tokens >= 1.0 {
            let granted = (want as f64).min(bucket.tokens).floor() as usize;
            bucket.tokens -= granted as f64;
            return Ok(granted);
        }
        let needed = (want as f64).min(bucket.capacity) - bucket.tokens;
        let wait = std::time::Duration::from_secs_f64(needed / bucket.rate);
        Err(wait.min(WAIT_SLICE))
    }

    /// Take up to `want` tokens, waiting as needed. Returns the granted
    /// count, always >= 1 for a non-empty request.
    pub async fn acquire(&self, want: usize) -> usize {
        if want == 0 {
            return 0;
        }
        loop {
            match self.try_acquire(want) {
                Ok(granted) => return granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Return tokens that were granted but not used (short write).
    pub fn give_back(&self, unused: usize) {
        let mut guard = self.bucket.lock().unwrap();
        if let Some(bucket) = guard.as_mut() {
            bucket.tokens = (bucket.tokens + unused as f64).min(bucket.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_is_pass_through() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_unlimited());
        assert_eq!(limiter.acquire(1 << 30).await, 1 << 30);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_burst_is_twice_the_rate() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.acquire(10_000).await, 2000);
        // bucket is now empty; a single byte must wait
        assert!(limiter.try_acquire(1).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_replenish_over_time() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.acquire(2000).await, 2000);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let granted = limiter.acquire(10_000).await;
        // 500ms at 1000 B/s
        assert!((450..=550).contains(&granted), "granted: {granted}");
    }

    #[tokio::test(start_paused = true)]
    async fn refill_caps_at_capacity() {
        let limiter = RateLimiter::new(1000);
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert_eq!(limiter.acquire(100_000).await, 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded_by_slice() {
        let limiter = RateLimiter::new(10);
        assert_eq!(limiter.acquire(20).await, 20);
        let wait = limiter.try_acquire(1_000_000).unwrap_err();
        assert!(wait <= WAIT_SLICE);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_update_clamps_tokens() {
        let limiter = RateLimiter::new(1_000_000);
        // full bucket: 2M tokens; drop the rate and the balance must clamp
        limiter.set_rate(100);
        assert_eq!(limiter.acquire(100_000).await, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn give_back_restores_tokens() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.acquire(2000).await, 2000);
        limiter.give_back(500);
        assert_eq!(limiter.acquire(10_000).await, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.acquire(2000).await, 2000);
        let before = tokio::time::Instant::now();
        let granted = limiter.acquire(1000).await;
        assert!(granted >= 1);
        // had to wait at least one slice for tokens to accumulate
        assert!(before.elapsed() >= std::time::Duration::from_millis(1));
    }
}
