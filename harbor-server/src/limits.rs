//! Rate limiting.
//!
//! Two mechanisms with different jobs:
//!
//! - [`HandshakeLimits`]: a keyed check guarding against handshake floods,
//!   counted per client fingerprint.
//! - [`ByteBucket`] / [`ThrottleMap`]: token buckets enforcing the
//!   per-library bandwidth cap on streamed chunks. Buckets are keyed per
//!   client so reconnecting does not reset the budget.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use harbor_types::{ClientId, ErrorKind};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::LimitsConfig;
use crate::error::{ServerError, ServerResult};

type KeyedLimiter<K> = RateLimiter<
    K,
    DefaultKeyedStateStore<K>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Keyed handshake-attempt limiter.
pub struct HandshakeLimits {
    limiter: Arc<KeyedLimiter<ClientId>>,
}

impl HandshakeLimits {
    /// Create the limiter from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `handshakes_per_minute` is zero; configuration
    /// validation rejects that before this point.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.handshakes_per_minute.max(1))
            .expect("handshakes_per_minute must be > 0");
        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
        }
    }

    /// Check whether another handshake from this client is allowed.
    pub fn check(&self, client: &ClientId) -> ServerResult<()> {
        self.limiter.check_key(client).map_err(|_| {
            ServerError::op(ErrorKind::RateLimited, "too many handshake attempts")
        })
    }
}

impl std::fmt::Debug for HandshakeLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeLimits").finish_non_exhaustive()
    }
}

/// A token bucket over bytes with continuous refill.
///
/// Capacity equals one second of the configured rate, so a limited party
/// transfers at most `R * W + capacity` bytes in any window `W`. A rate
/// of zero disables the bucket entirely.
#[derive(Debug)]
pub struct ByteBucket {
    rate: u64,
    state: std::sync::Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl ByteBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            state: std::sync::Mutex::new(BucketState {
                tokens: rate_bytes_per_sec as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Consume `n` tokens, sleeping as needed to honor the rate.
    ///
    /// Returns promptly with `ConnectionClosed` when the cancellation
    /// token fires mid-wait (session reaped or server shutting down).
    /// Requests larger than the capacity borrow against future refill,
    /// driving the balance negative so later callers wait longer.
    pub async fn consume(&self, n: u64, cancel: &CancellationToken) -> ServerResult<()> {
        if self.rate == 0 {
            return Ok(());
        }

        let wait = {
            let mut state = self.state.lock().unwrap();
            self.refill(&mut state);
            if state.tokens >= n as f64 {
                state.tokens -= n as f64;
                None
            } else {
                let deficit = n as f64 - state.tokens;
                state.tokens -= n as f64;
                Some(Duration::from_secs_f64(deficit / self.rate as f64))
            }
        };

        if let Some(wait) = wait {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    return Err(ServerError::op(
                        ErrorKind::ConnectionClosed,
                        "cancelled while rate limited",
                    ));
                }
            }
        }
        Ok(())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        state.refilled_at = now;
    }
}

/// Byte buckets keyed by client.
pub struct ThrottleMap {
    buckets: DashMap<ClientId, Arc<ByteBucket>>,
}

impl ThrottleMap {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Bucket for a client, created on first use with the given rate.
    ///
    /// The rate comes from the library the session bound to; a client
    /// reconnecting keeps its existing bucket and budget.
    pub fn bucket(&self, client: &ClientId, rate: u64) -> Arc<ByteBucket> {
        self.buckets
            .entry(client.clone())
            .or_insert_with(|| Arc::new(ByteBucket::new(rate)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for ThrottleMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThrottleMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleMap")
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(tag: u8) -> ClientId {
        ClientId::from_fingerprint(format!("{:02x}", tag).repeat(32))
    }

    #[test]
    fn handshake_limit_trips_after_quota() {
        let limits = HandshakeLimits::new(&LimitsConfig {
            handshakes_per_minute: 3,
            reaper_interval_secs: 30,
        });
        let c = client(1);

        for _ in 0..3 {
            assert!(limits.check(&c).is_ok());
        }
        let err = limits.check(&c).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        // An unrelated client still has quota.
        assert!(limits.check(&client(2)).is_ok());
    }

    #[tokio::test]
    async fn unlimited_bucket_never_waits() {
        let bucket = ByteBucket::new(0);
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            bucket.consume(1 << 20, &cancel).await.unwrap();
        }
        assert!(bucket.is_unlimited());
    }

    #[tokio::test]
    async fn consume_within_capacity_is_immediate() {
        let bucket = ByteBucket::new(1_000_000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        bucket.consume(500_000, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_consume_waits_proportionally() {
        let bucket = ByteBucket::new(1000);
        let cancel = CancellationToken::new();

        // Capacity is 1000; asking for 3000 must wait ~2s for the deficit.
        let start = tokio::time::Instant::now();
        bucket.consume(3000, &cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1900), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(2500), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_wait() {
        let bucket = Arc::new(ByteBucket::new(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.consume(1_000_000, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn throttle_map_shares_buckets_per_client() {
        let map = ThrottleMap::new();
        let a = map.bucket(&client(1), 4096);
        let b = map.bucket(&client(1), 9999);
        // Second lookup returns the existing bucket, rate unchanged.
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);

        let _c = map.bucket(&client(2), 4096);
        assert_eq!(map.len(), 2);
    }
}
