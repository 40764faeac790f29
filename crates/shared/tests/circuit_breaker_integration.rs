//! 熔断器集成测试
//!
//! 通过 `call` 包装异步操作，验证跳闸、冷却、半开探测的完整生命周期。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dispatch_shared::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, TripsBreaker,
};
use dispatch_shared::clock::ManualClock;
use tokio_test::{assert_err, assert_ok, block_on};

#[derive(Debug)]
enum DialError {
    Unreachable,
    Rejected,
}

impl TripsBreaker for DialError {
    fn trips_breaker(&self) -> bool {
        matches!(self, DialError::Unreachable)
    }
}

fn breaker(clock: &ManualClock) -> CircuitBreaker {
    CircuitBreaker::with_clock(
        CircuitBreakerConfig::new("amqp")
            .with_failure_threshold(3)
            .with_cool_down(Duration::from_secs(60)),
        Arc::new(clock.clone()),
    )
}

#[test]
fn test_open_breaker_skips_calls_until_cool_down() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);
    let calls = AtomicUsize::new(0);

    let attempt = |result: Result<(), DialError>| {
        let breaker = breaker.clone();
        let calls = &calls;
        block_on(async move {
            breaker
                .call(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    result
                })
                .await
        })
    };

    for _ in 0..3 {
        assert_err!(attempt(Err(DialError::Unreachable)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = attempt(Ok(()));
    assert!(matches!(rejected, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(60));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_ok!(attempt(Ok(())));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_non_qualifying_errors_surface_without_tripping() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);

    for _ in 0..5 {
        let result: Result<(), _> =
            block_on(breaker.call(|| async { Err(DialError::Rejected) }));
        assert!(matches!(
            result,
            Err(CircuitBreakerError::ServiceError(DialError::Rejected))
        ));
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[test]
fn test_half_open_trial_failure_reopens() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock);

    for _ in 0..3 {
        breaker.record_failure(&DialError::Unreachable);
    }
    clock.advance(Duration::from_secs(61));
    assert!(breaker.allow_attempt());

    let result: Result<(), _> = block_on(breaker.call(|| async { Err(DialError::Unreachable) }));
    assert_err!(result);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow_attempt());
}
