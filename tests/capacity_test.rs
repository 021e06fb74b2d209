//! Integration tests for the dual leaky-bucket capacity limiter.
//!
//! Timing-sensitive scenarios run on tokio's paused clock so a "60 second"
//! wait is asserted in virtual time.

use std::sync::Arc;
use std::time::Duration;

use workload_governor::config::{CapacityConfig, CapacityUpdate};
use workload_governor::core::CapacityLimiter;

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
async fn first_large_reservation_is_immediate() {
    let l = limiter(60.0, 600.0, 100.0);
    let start = tokio::time::Instant::now();
    l.reserve(80.0).await;
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn capacity_exhaustion_forces_refill_wait() {
    // burst 100, 60 tokens/min: after an 80-token reservation only 20 remain,
    // so a second 80-token reservation must wait ~(80-20)/1 token-per-second.
    let l = limiter(60.0, 600.0, 100.0);
    l.reserve(80.0).await;

    let start = tokio::time::Instant::now();
    l.reserve(80.0).await;
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_secs(55),
        "second reservation admitted too early: {waited:?}"
    );
    assert!(
        waited <= Duration::from_secs(70),
        "second reservation waited too long: {waited:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn bucket_bounds_hold_under_mixed_operations() {
    let l = limiter(120.0, 60.0, 100.0);
    l.reserve(40.0).await;
    l.reconcile(10.0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    l.reserve(20.0).await;
    l.reconcile(90.0);
    tokio::time::sleep(Duration::from_secs(120)).await;

    let stats = l.usage_stats();
    assert!(stats.available_tokens >= 0.0);
    assert!(stats.available_tokens <= stats.burst_capacity);
    assert!(stats.available_requests >= 0.0);
    assert!(stats.available_requests <= stats.max_requests_per_minute);
}

#[tokio::test(start_paused = true)]
async fn request_slots_limit_independently_of_tokens() {
    // Plenty of tokens, only 2 request slots per minute: the third call in a
    // burst has to wait for slot refill even though tokens abound.
    let l = limiter(6_000.0, 2.0, 10_000.0);
    l.reserve(1.0).await;
    l.reserve(1.0).await;

    let start = tokio::time::Instant::now();
    l.reserve(1.0).await;
    assert!(
        start.elapsed() >= Duration::from_secs(25),
        "request slot refill not enforced: {:?}",
        start.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn penalty_blocks_all_reservations_until_expiry() {
    let l = limiter(60.0, 600.0, 100.0);
    l.penalize(30);

    let start = tokio::time::Instant::now();
    l.reserve(1.0).await;
    assert!(
        start.elapsed() >= Duration::from_secs(29),
        "penalty window not honored: {:?}",
        start.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn penalty_is_never_shortened() {
    let l = limiter(60.0, 600.0, 100.0);
    l.penalize(5);
    l.penalize(2);

    let start = tokio::time::Instant::now();
    l.reserve(1.0).await;
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_secs(4),
        "later shorter penalty shortened the window: {waited:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_reservations_never_double_spend() {
    let l = Arc::new(limiter(60_000.0, 6_000.0, 100.0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let l = Arc::clone(&l);
        handles.push(tokio::spawn(async move {
            l.reserve(10.0).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = l.usage_stats();
    assert!(stats.available_tokens >= 0.0, "token bucket went negative");
    assert!(stats.available_tokens <= stats.burst_capacity);
}

#[tokio::test(start_paused = true)]
async fn waiter_does_not_block_other_callers() {
    // One caller waits for a large refill; a cheap reservation submitted
    // afterwards must still be admitted promptly once slots allow.
    let l = Arc::new(limiter(60.0, 600.0, 100.0));
    l.reserve(95.0).await;

    let big = {
        let l = Arc::clone(&l);
        tokio::spawn(async move {
            l.reserve(90.0).await;
        })
    };
    // Give the big waiter a chance to park.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = tokio::time::Instant::now();
    l.reserve(2.0).await;
    assert!(
        start.elapsed() <= Duration::from_secs(5),
        "small reservation starved behind a parked waiter: {:?}",
        start.elapsed()
    );

    big.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn tier_upgrade_shortens_waits() {
    let l = limiter(60.0, 600.0, 100.0);
    l.reserve(100.0).await;
    let slow = l.estimate_wait(60.0);

    l.update_limits(&CapacityUpdate {
        max_tokens_per_minute: Some(600.0),
        ..CapacityUpdate::default()
    });
    let fast = l.estimate_wait(60.0);
    assert!(
        fast < slow,
        "raising the refill rate should shorten waits: {fast:?} vs {slow:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn oversized_cost_is_clamped_to_burst() {
    // A cost above burst capacity can never be satisfied as-is; the limiter
    // clamps it so the caller is not parked forever.
    let l = limiter(6_000.0, 600.0, 50.0);
    let start = tokio::time::Instant::now();
    l.reserve(500.0).await;
    assert!(
        start.elapsed() <= Duration::from_secs(5),
        "oversized reservation parked indefinitely"
    );
}
