//! Retry executor behavior
//!
//! Attempt counting, classification of failures and time spent backing off.

use resilient_amqp::error::{reply_code, BrokerError};
use resilient_amqp::retry::{RetryError, RetryExecutor, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(40))
        .multiplier(2.0)
        .jitter(jitter)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_exhausts_after_exactly_max_attempts() {
    let policy = policy(4, true);
    let (lower, upper) = policy.sleep_envelope();
    let executor = RetryExecutor::new(policy);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let started = Instant::now();
    let result: Result<(), _> = executor
        .execute(&CancellationToken::new(), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::connection_lost("reset"))
            }
        })
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(
        result,
        Err(RetryError::Exhausted {
            attempts: 4,
            last: BrokerError::ConnectionLost(_)
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(elapsed >= lower, "slept {elapsed:?}, expected at least {lower:?}");
    // generous upper slack for scheduler noise
    assert!(
        elapsed <= upper + Duration::from_millis(250),
        "slept {elapsed:?}, expected at most {upper:?}"
    );
}

#[tokio::test]
async fn test_succeeds_after_transient_failures() {
    let executor = RetryExecutor::new(policy(5, false));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result = executor
        .execute(&CancellationToken::new(), |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(BrokerError::PublishNacked)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_single_attempt_policy_never_sleeps() {
    let executor = RetryExecutor::new(policy(1, false));

    let started = Instant::now();
    let result: Result<(), _> = executor
        .execute(&CancellationToken::new(), |_| async {
            Err(BrokerError::NotReady)
        })
        .await;

    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    assert!(started.elapsed() < Duration::from_millis(10));
}

#[tokio::test]
async fn test_reply_codes_decide_retry() {
    let executor = RetryExecutor::new(policy(3, false));
    let cancel = CancellationToken::new();

    let not_found: Result<(), _> = executor
        .execute(&cancel, |_| async {
            Err(BrokerError::Protocol {
                code: reply_code::NOT_FOUND,
                message: "no exchange 'missing'".to_string(),
            })
        })
        .await;
    assert!(matches!(not_found, Err(RetryError::Aborted { attempt: 1, .. })));

    let resource: Result<(), _> = executor
        .execute(&cancel, |_| async {
            Err(BrokerError::Protocol {
                code: reply_code::RESOURCE_ERROR,
                message: "memory alarm".to_string(),
            })
        })
        .await;
    assert!(matches!(resource, Err(RetryError::Exhausted { attempts: 3, .. })));

    // codes outside the known lists are not retried
    let unknown: Result<(), _> = executor
        .execute(&cancel, |_| async {
            Err(BrokerError::Protocol {
                code: 999,
                message: "mystery".to_string(),
            })
        })
        .await;
    assert!(matches!(unknown, Err(RetryError::Aborted { attempt: 1, .. })));
}

#[tokio::test]
async fn test_cancel_during_backoff_reports_attempts_made() {
    let policy = RetryPolicy::builder()
        .max_attempts(10)
        .base_delay(Duration::from_millis(200))
        .max_delay(Duration::from_secs(1))
        .build()
        .unwrap();
    let executor = RetryExecutor::new(policy);
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let counter = calls.clone();
    let started = Instant::now();
    let result: Result<(), _> = executor
        .execute(&cancel, |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::NotReady)
            }
        })
        .await;

    assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(200));
}
