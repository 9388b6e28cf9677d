//! Behavior-driven tests for retry and circuit-breaker behavior
//!
//! These tests verify HOW the resiliency layer handles failing backend
//! calls, focusing on attempt counts, backoff bounds and circuit
//! transitions as the caller observes them.

use coral_core::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    error::{ApiError, ApiErrorKind},
    retry::{execute_batch, execute_with_retry, Backoff, RetryConfig, MAX_JITTER},
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Retry: Attempt Accounting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_backend_never_recovers_the_caller_sees_the_final_attempts_error() {
    // Given: An operation that fails on every attempt
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);

    // When: It runs with a retry budget of 3
    let result: Result<(), ApiError> = execute_with_retry(
        move || {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(ApiError::http(502, format!("bad gateway on attempt {attempt}"))) }
        },
        &RetryConfig::exponential(3),
    )
    .await;

    // Then: Exactly max_retries + 1 attempts ran and the last error surfaced
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let error = result.expect_err("exhausted retries must fail");
    assert_eq!(error.message(), "bad gateway on attempt 4");
}

#[tokio::test(start_paused = true)]
async fn when_the_network_flakes_twice_the_call_succeeds_and_reports_each_retry() {
    // Given: An operation that throws a network error twice then succeeds
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let retries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&retries);

    let config = RetryConfig::exponential(3).with_retry_hook(Arc::new(move |retry, _| {
        sink.lock().expect("sink lock").push(retry);
    }));

    // When: The wrapped call runs
    let result = execute_with_retry(
        move || {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 2 {
                    Err(ApiError::network("connection reset"))
                } else {
                    Ok("customer list")
                }
            }
        },
        &config,
    )
    .await;

    // Then: It resolves with the success value and the hook saw retries 1 and 2
    assert_eq!(result.expect("third attempt succeeds"), "customer list");
    assert_eq!(*retries.lock().expect("sink lock"), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn when_the_failure_is_a_client_error_no_retry_is_attempted() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);

    let result: Result<(), ApiError> = execute_with_retry(
        move || {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Err(ApiError::http(403, "forbidden")) }
        },
        &RetryConfig::exponential(5),
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(result.expect_err("must fail").status(), Some(403));
}

// =============================================================================
// Retry: Backoff Bounds
// =============================================================================

#[test]
fn computed_backoff_grows_exponentially_within_base_and_cap() {
    let backoff = Backoff::Exponential {
        base: Duration::from_millis(500),
        factor: 2.0,
        max: Duration::from_secs(30),
    };

    for attempt in 0..12_u32 {
        let computed = backoff.delay(attempt);
        let expected = 0.5_f64 * 2.0_f64.powi(attempt as i32);
        let capped = expected.min(30.0);

        assert!(
            (computed.as_secs_f64() - capped).abs() < 1e-9,
            "attempt {attempt}: computed {computed:?}, expected {capped}s"
        );

        let jittered = backoff.delay_with_jitter(attempt);
        assert!(jittered >= computed, "jitter only ever adds");
        assert!(jittered <= computed + MAX_JITTER);
    }
}

// =============================================================================
// Retry: Batch Windows
// =============================================================================

#[tokio::test]
async fn batch_execution_never_exceeds_its_concurrency_window() {
    // Given: A gauge tracking how many operations are in flight at once
    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    let operations: Vec<_> = (0..12_u32)
        .map(|index| {
            let in_flight = Arc::clone(&in_flight);
            let high_water = Arc::clone(&high_water);
            move || {
                let in_flight = Arc::clone(&in_flight);
                let high_water = Arc::clone(&high_water);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(index)
                }
            }
        })
        .collect();

    // When: The batch runs with a window of 5
    let results = execute_batch(operations, &RetryConfig::no_retry(), 5)
        .await
        .expect("valid concurrency");

    // Then: All results came back in order and the cap held
    assert_eq!(results.len(), 12);
    for (index, result) in results.iter().enumerate() {
        assert_eq!(*result.as_ref().expect("all succeed"), index as u32);
    }
    assert!(
        high_water.load(Ordering::SeqCst) <= 5,
        "window cap was exceeded: {}",
        high_water.load(Ordering::SeqCst)
    );
}

// =============================================================================
// Circuit Breaker: State Machine
// =============================================================================

#[tokio::test]
async fn when_failures_reach_the_threshold_the_circuit_rejects_without_calling() {
    // Given: A breaker with a threshold of 3
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(60),
        monitoring_period: Duration::from_secs(10),
        half_open_successes: 3,
    });

    // When: Exactly threshold qualifying failures arrive in quick succession
    for _ in 0..3 {
        let _: Result<(), ApiError> = breaker
            .call(|| async { Err(ApiError::http(500, "boom")) })
            .await;
    }

    // Then: The circuit is open and the next call never reaches the backend
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&invoked);
    let result: Result<(), ApiError> = breaker
        .call(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

    let error = result.expect_err("open circuit must reject");
    assert_eq!(error.kind(), ApiErrorKind::CircuitOpen);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn after_the_reset_timeout_three_successes_close_the_circuit_again() {
    // Given: An open breaker with a very short reset timeout
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        reset_timeout: Duration::from_millis(20),
        monitoring_period: Duration::from_secs(10),
        half_open_successes: 3,
    });
    let _: Result<(), ApiError> = breaker
        .call(|| async { Err(ApiError::http(500, "boom")) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // When: The timeout elapses and trial calls start succeeding
    tokio::time::sleep(Duration::from_millis(30)).await;

    for round in 1..=3_u32 {
        let result: Result<(), ApiError> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.is_ok(), "probe {round} should pass through");
    }

    // Then: The circuit is closed with its failure count reset
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn one_failure_during_the_half_open_probe_reopens_the_circuit() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        reset_timeout: Duration::from_millis(20),
        monitoring_period: Duration::from_secs(10),
        half_open_successes: 3,
    });
    let _: Result<(), ApiError> = breaker
        .call(|| async { Err(ApiError::http(500, "boom")) })
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;

    // First probe passes, second fails: straight back to open.
    let _: Result<(), ApiError> = breaker.call(|| async { Ok(()) }).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let _: Result<(), ApiError> = breaker
        .call(|| async { Err(ApiError::http(500, "still broken")) })
        .await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow_request());
}
