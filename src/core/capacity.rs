//! Dual leaky-bucket capacity limiter with a global penalty window.
//!
//! Two buckets refill continuously: capacity units (provider quota) and
//! request slots (calls per minute). A reservation must satisfy both. When an
//! external service signals overload, a penalty window blocks all
//! reservations until it expires; penalties only ever extend.
//!
//! Waits are invisible to callers: `reserve` suspends until capacity is
//! available and the mutex is released before every sleep, so one parked
//! waiter never blocks the others.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{CapacityConfig, CapacityUpdate};
use crate::core::GovernorError;

/// Floor on computed waits so tiny shortfalls do not spin the clock.
const MIN_WAIT: Duration = Duration::from_millis(1000);

/// Reservations remembered for reconciliation and telemetry.
const HISTORY_WINDOW: usize = 32;

/// Age beyond which history entries stop counting as recent.
const RECENT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Reservation {
    cost: f64,
    at: Instant,
}

struct CapacityState {
    limits: CapacityConfig,
    token_bucket: f64,
    request_bucket: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    history: VecDeque<Reservation>,
}

impl CapacityState {
    /// Refill both buckets proportionally to elapsed time, capped at capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed_mins = now.duration_since(self.last_refill).as_secs_f64() / 60.0;
        self.last_refill = now;

        self.token_bucket = (self.token_bucket
            + elapsed_mins * self.limits.max_tokens_per_minute)
            .min(self.limits.burst_capacity);
        self.request_bucket = (self.request_bucket
            + elapsed_mins * self.limits.max_requests_per_minute)
            .min(self.limits.max_requests_per_minute);
    }

    /// Wait until both buckets can satisfy a reservation of `cost` units.
    fn shortfall_wait(&self, cost: f64) -> Duration {
        let token_rate_per_ms = self.limits.max_tokens_per_minute / 60_000.0;
        let request_rate_per_ms = self.limits.max_requests_per_minute / 60_000.0;

        let tokens_needed = (cost - self.token_bucket).max(0.0);
        let requests_needed = (1.0 - self.request_bucket).max(0.0);

        let token_wait_ms = tokens_needed / token_rate_per_ms;
        let request_wait_ms = requests_needed / request_rate_per_ms;

        Duration::from_millis(token_wait_ms.max(request_wait_ms).ceil() as u64).max(MIN_WAIT)
    }

    fn remember(&mut self, reservation: Reservation) {
        if self.history.len() >= HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(reservation);
    }

    fn penalty_remaining(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .and_then(|until| (until > now).then(|| until.duration_since(now)))
    }
}

/// Snapshot of limiter state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityUsage {
    /// Capacity units currently available.
    pub available_tokens: f64,
    /// Request slots currently available.
    pub available_requests: f64,
    /// Configured burst capacity.
    pub burst_capacity: f64,
    /// Configured token refill rate per minute.
    pub max_tokens_per_minute: f64,
    /// Configured request refill rate per minute.
    pub max_requests_per_minute: f64,
    /// Remaining penalty window in milliseconds, 0 when unblocked.
    pub penalty_remaining_ms: u64,
    /// Reservations in the sliding history window.
    pub recent_reservations: usize,
    /// Summed cost of the history window, post-reconciliation.
    pub recent_cost: f64,
}

/// Process-wide dual leaky-bucket regulator. The admission gate before any
/// external call.
pub struct CapacityLimiter {
    state: Mutex<CapacityState>,
}

impl CapacityLimiter {
    /// Create a limiter with full buckets.
    ///
    /// # Errors
    ///
    /// Returns `GovernorError::InvalidConfig` if any rate or capacity is not
    /// positive.
    pub fn new(config: CapacityConfig) -> Result<Self, GovernorError> {
        config.validate().map_err(GovernorError::InvalidConfig)?;
        let now = Instant::now();
        let blocked_until = config
            .penalty_seconds
            .map(|secs| now + Duration::from_secs(secs));
        Ok(Self {
            state: Mutex::new(CapacityState {
                token_bucket: config.burst_capacity,
                request_bucket: config.max_requests_per_minute,
                last_refill: now,
                blocked_until,
                history: VecDeque::with_capacity(HISTORY_WINDOW),
                limits: config,
            }),
        })
    }

    /// Suspend until the reservation can be satisfied, then deduct from both
    /// buckets atomically.
    ///
    /// Costs above the burst capacity are clamped to it, since they could
    /// never be satisfied and the caller must not be parked forever.
    pub async fn reserve(&self, estimated_cost: f64) {
        loop {
            // Penalty window first. After it expires, recompute from scratch;
            // other callers may have drained the buckets meanwhile.
            let penalty = {
                let state = self.state.lock();
                state.penalty_remaining(Instant::now())
            };
            if let Some(wait) = penalty {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "blocked by penalty window");
                tokio::time::sleep(wait).await;
                continue;
            }

            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.refill(now);
                let need = estimated_cost.min(state.limits.burst_capacity);
                if state.token_bucket >= need && state.request_bucket >= 1.0 {
                    state.token_bucket -= need;
                    state.request_bucket -= 1.0;
                    state.remember(Reservation { cost: need, at: now });
                    tracing::debug!(
                        cost = need,
                        tokens_left = state.token_bucket,
                        "capacity reserved"
                    );
                    return;
                }
                state.shortfall_wait(need)
            };
            // Lock released before sleeping so other callers are not parked
            // behind this waiter.
            tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for capacity");
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking reservation attempt. Returns false if either bucket or
    /// the penalty window would require waiting.
    pub fn try_reserve(&self, estimated_cost: f64) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.penalty_remaining(now).is_some() {
            return false;
        }
        state.refill(now);
        let need = estimated_cost.min(state.limits.burst_capacity);
        if state.token_bucket >= need && state.request_bucket >= 1.0 {
            state.token_bucket -= need;
            state.request_bucket -= 1.0;
            state.remember(Reservation { cost: need, at: now });
            true
        } else {
            false
        }
    }

    /// Estimated wait before a reservation of `cost` could succeed.
    /// `Duration::ZERO` means it would be admitted immediately.
    pub fn estimate_wait(&self, cost: f64) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let penalty = state.penalty_remaining(now).unwrap_or(Duration::ZERO);
        state.refill(now);
        let need = cost.min(state.limits.burst_capacity);
        if state.token_bucket >= need && state.request_bucket >= 1.0 {
            return penalty;
        }
        penalty.max(state.shortfall_wait(need))
    }

    /// Adjust the most recent reservation by the delta between its estimate
    /// and the actual cost, clamped so the token bucket stays within bounds.
    pub fn reconcile(&self, actual_cost: f64) {
        let mut state = self.state.lock();
        let Some(last) = state.history.back().copied() else {
            return;
        };
        let delta = last.cost - actual_cost;
        state.token_bucket =
            (state.token_bucket + delta).clamp(0.0, state.limits.burst_capacity);
        if let Some(entry) = state.history.back_mut() {
            entry.cost = actual_cost;
        }
        tracing::debug!(
            estimated = last.cost,
            actual = actual_cost,
            "reconciled reservation"
        );
    }

    /// Extend the global penalty window to at least `seconds` from now.
    /// Penalties are monotonic: an earlier, longer window is never shortened.
    pub fn penalize(&self, seconds: u64) {
        let mut state = self.state.lock();
        let until = Instant::now() + Duration::from_secs(seconds);
        state.blocked_until = match state.blocked_until {
            Some(existing) if existing > until => Some(existing),
            _ => Some(until),
        };
        tracing::warn!(seconds, "capacity penalized; reservations blocked");
    }

    /// Apply a partial limit update live, clamping buckets to any reduced
    /// capacities.
    pub fn update_limits(&self, update: &CapacityUpdate) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        if let Some(rate) = update.max_tokens_per_minute {
            state.limits.max_tokens_per_minute = rate;
        }
        if let Some(rate) = update.max_requests_per_minute {
            state.limits.max_requests_per_minute = rate;
            state.request_bucket = state.request_bucket.min(rate);
        }
        if let Some(burst) = update.burst_capacity {
            state.limits.burst_capacity = burst;
            state.token_bucket = state.token_bucket.min(burst);
        }
        tracing::info!(
            tokens_per_minute = state.limits.max_tokens_per_minute,
            requests_per_minute = state.limits.max_requests_per_minute,
            burst = state.limits.burst_capacity,
            "capacity limits updated"
        );
    }

    /// Snapshot current limiter state after a refill to "now". Reservations
    /// older than the recent window fall out of the reported history.
    pub fn usage_stats(&self) -> CapacityUsage {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill(now);
        state
            .history
            .retain(|r| now.duration_since(r.at) <= RECENT_WINDOW);
        CapacityUsage {
            available_tokens: state.token_bucket,
            available_requests: state.request_bucket,
            burst_capacity: state.limits.burst_capacity,
            max_tokens_per_minute: state.limits.max_tokens_per_minute,
            max_requests_per_minute: state.limits.max_requests_per_minute,
            penalty_remaining_ms: state
                .penalty_remaining(now)
                .map_or(0, |d| d.as_millis() as u64),
            recent_reservations: state.history.len(),
            recent_cost: state.history.iter().map(|r| r.cost).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(tokens_per_min: f64, requests_per_min: f64, burst: f64) -> CapacityLimiter {
        CapacityLimiter::new(CapacityConfig {
            max_tokens_per_minute: tokens_per_min,
            max_requests_per_minute: requests_per_min,
            burst_capacity: burst,
            penalty_seconds: None,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_start_full_and_stay_bounded() {
        let l = limiter(60.0, 10.0, 100.0);
        let stats = l.usage_stats();
        assert!((stats.available_tokens - 100.0).abs() < f64::EPSILON);
        assert!((stats.available_requests - 10.0).abs() < f64::EPSILON);

        // A long idle period must not overfill past the caps.
        tokio::time::sleep(Duration::from_secs(600)).await;
        let stats = l.usage_stats();
        assert!(stats.available_tokens <= 100.0);
        assert!(stats.available_requests <= 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_deducts_both_buckets() {
        let l = limiter(60.0, 10.0, 100.0);
        l.reserve(30.0).await;
        let stats = l.usage_stats();
        assert!(stats.available_tokens <= 70.0 + 1e-6);
        assert!(stats.available_requests <= 9.0 + 1e-6);
        assert!(stats.available_tokens >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn try_reserve_fails_without_capacity() {
        let l = limiter(60.0, 10.0, 100.0);
        assert!(l.try_reserve(80.0));
        assert!(!l.try_reserve(80.0));
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_is_monotonic() {
        let l = limiter(60.0, 10.0, 100.0);
        l.penalize(5);
        l.penalize(2);
        let remaining = l.usage_stats().penalty_remaining_ms;
        assert!(remaining > 4_000, "penalty shortened to {remaining}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_blocks_try_reserve() {
        let l = limiter(60.0, 10.0, 100.0);
        l.penalize(5);
        assert!(!l.try_reserve(1.0));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(l.try_reserve(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_returns_overestimate() {
        let l = limiter(60.0, 10.0, 100.0);
        l.reserve(50.0).await;
        l.reconcile(10.0);
        let stats = l.usage_stats();
        assert!(stats.available_tokens >= 90.0 - 1e-6);
        assert!(stats.available_tokens <= 100.0);
        assert!((stats.recent_cost - 10.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_clamps_at_burst() {
        let l = limiter(60.0, 10.0, 100.0);
        l.reserve(5.0).await;
        // Actual far below estimate cannot push the bucket past burst.
        l.reconcile(0.0);
        assert!(l.usage_stats().available_tokens <= 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_clamps_at_zero() {
        let l = limiter(60.0, 10.0, 100.0);
        l.reserve(90.0).await;
        // Actual far above estimate cannot drive the bucket negative.
        l.reconcile(500.0);
        assert!(l.usage_stats().available_tokens >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_limits_clamps_bucket() {
        let l = limiter(60.0, 10.0, 100.0);
        l.update_limits(&CapacityUpdate {
            burst_capacity: Some(40.0),
            ..CapacityUpdate::default()
        });
        let stats = l.usage_stats();
        assert!((stats.burst_capacity - 40.0).abs() < f64::EPSILON);
        assert!(stats.available_tokens <= 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn estimate_wait_reflects_shortfall() {
        let l = limiter(60.0, 600.0, 100.0);
        assert_eq!(l.estimate_wait(80.0), Duration::ZERO);
        l.reserve(80.0).await;
        // 20 tokens remain; 60 more are needed at 1 token/second.
        let wait = l.estimate_wait(80.0);
        assert!(wait >= Duration::from_secs(55), "wait was {wait:?}");
        assert!(wait <= Duration::from_secs(65), "wait was {wait:?}");
    }

    #[test]
    fn rejects_invalid_config() {
        let err = CapacityLimiter::new(CapacityConfig {
            max_tokens_per_minute: 0.0,
            max_requests_per_minute: 10.0,
            burst_capacity: 100.0,
            penalty_seconds: None,
        });
        assert!(err.is_err());
    }
}
