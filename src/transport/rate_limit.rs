//! Rate-limited transport primitives (§4.3). A hand-rolled token bucket
//! rather than the `governor` crate: `governor::Quota` is immutable once
//! built, but the tracker below mutates the limiter's rate at runtime from
//! observed `RateLimit-Remaining`/`RateLimit-Reset` headers, which
//! `governor` has no API for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{RuncoreError, RuncoreResult};

/// Admits requests at a configurable rate with burst capacity. `rate` can
/// be adjusted live by [`RateLimitTracker::update_estimates`].
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            capacity: burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, rate_per_sec: f64) {
        self.state.lock().unwrap().rate_per_sec = rate_per_sec;
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate_per_sec
    }

    /// Non-blocking variant of [`acquire`](Self::acquire): takes a token if
    /// one is immediately available, otherwise leaves the bucket untouched
    /// and returns `false`. Used by the Handler's config debouncer, which
    /// needs a now-or-later decision rather than a wait (§4.8).
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(state: &mut BucketState, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate_per_sec).min(capacity);
        state.last_refill = now;
    }

    /// Block until a token is available or `deadline` passes, whichever is
    /// first. Errors only when the context has a deadline that the wait
    /// would cross (§4.3: "limiter wait returns an error iff the request
    /// context is canceled or its deadline precedes the wait").
    pub async fn acquire(&self, deadline: Option<Instant>) -> RuncoreResult<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                Self::refill(&mut state, self.capacity);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate_per_sec.max(0.001))
            };

            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(RuncoreError::TransportTimeout(wait));
                }
            }
            tokio::time::sleep(wait).await;
        }
    }
}

struct TrackerState {
    requests_per_unit: f64,
    last_remaining: Option<u32>,
    window_start: Instant,
}

/// Sliding-window estimator over observed `RateLimit-Remaining` /
/// `RateLimit-Reset` response headers (§3, §4.3).
pub struct RateLimitTracker {
    state: Mutex<TrackerState>,
    window_requests: AtomicU64,
    target_units_per_sec: f64,
    smoothing: f64,
    min_window: u64,
    min_per_sec: f64,
    max_per_sec: f64,
}

impl RateLimitTracker {
    pub fn new(
        target_units_per_sec: f64,
        smoothing: f64,
        min_window: u64,
        min_per_sec: f64,
        max_per_sec: f64,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                requests_per_unit: max_per_sec / target_units_per_sec,
                last_remaining: None,
                window_start: Instant::now(),
            }),
            window_requests: AtomicU64::new(0),
            target_units_per_sec,
            smoothing,
            min_window,
            min_per_sec,
            max_per_sec,
        }
    }

    /// Lock-free increment; called once per admitted request (§5
    /// shared-resource policy).
    pub fn track_request(&self) {
        self.window_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed one response's rate-limit headers into the estimator and push
    /// the result onto `limiter` (§4.3).
    pub fn update_estimates(&self, remaining: u32, reset: Duration, limiter: &TokenBucket) {
        if reset.as_secs_f64() <= 1.0 {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let consumed = state
            .last_remaining
            .map(|prev| prev.saturating_sub(remaining))
            .unwrap_or(0);
        let window_requests = self.window_requests.swap(0, Ordering::Relaxed);
        let window_exceeded = window_requests >= self.min_window;

        let observed = if consumed < 1 || window_exceeded {
            // Insufficient consumption signal, or a fresh window: ratchet
            // back toward the ceiling so the limiter can recover.
            self.max_per_sec / self.target_units_per_sec
        } else {
            consumed as f64 / reset.as_secs_f64()
        };

        state.requests_per_unit = self.smoothing * state.requests_per_unit
            + (1.0 - self.smoothing) * observed;
        state.last_remaining = Some(remaining);
        state.window_start = Instant::now();

        let target_rate = (state.requests_per_unit * self.target_units_per_sec)
            .clamp(self.min_per_sec, self.max_per_sec);
        limiter.set_rate(target_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_admits_immediately_within_burst() {
        let bucket = TokenBucket::new(100.0, 20.0);
        for _ in 0..20 {
            bucket.acquire(None).await.unwrap();
        }
    }

    #[test]
    fn consumed_requests_pull_rate_toward_observed_ratio() {
        let limiter = TokenBucket::new(100.0, 20.0);
        let tracker = RateLimitTracker::new(50.0, 0.5, 1000, 1.0, 100.0);

        tracker.update_estimates(100, Duration::from_secs(60), &limiter);
        for _ in 0..50 {
            tracker.track_request();
        }
        tracker.update_estimates(50, Duration::from_secs(60), &limiter);

        // consumed=50 over reset=60s -> observed ~0.83 req/unit, pulling the
        // rate down from its initial ceiling.
        assert!(limiter.rate() < 100.0);
    }

    #[test]
    fn unchanged_remaining_ratchets_back_toward_ceiling() {
        let limiter = TokenBucket::new(100.0, 20.0);
        let tracker = RateLimitTracker::new(50.0, 0.0, 1000, 1.0, 100.0);

        tracker.update_estimates(100, Duration::from_secs(60), &limiter);
        tracker.track_request();
        tracker.update_estimates(50, Duration::from_secs(60), &limiter);
        let throttled_rate = limiter.rate();

        // No further consumption observed: ratchet back toward max/target.
        tracker.update_estimates(50, Duration::from_secs(60), &limiter);
        assert!(limiter.rate() >= throttled_rate);
    }

    #[tokio::test]
    async fn deadline_in_the_past_times_out_when_bucket_is_empty() {
        let bucket = TokenBucket::new(1.0, 1.0);
        bucket.acquire(None).await.unwrap();
        let err = bucket
            .acquire(Some(Instant::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuncoreError::TransportTimeout(_)));
    }
}
