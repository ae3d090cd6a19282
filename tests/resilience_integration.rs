//! Resilience Integration Tests
//!
//! Circuit breakers, retries and the transaction manager working together,
//! driven by a virtual clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use assetrun::ai::ProviderError;
use assetrun::core::{
    BreakerRegistry, BudgetLedger, CircuitConfig, CircuitState, Cost, Funding, ManualClock,
    MemoryStorage, RetryConfig, RetryError, RetryPolicy, SpendKind, SpendLabel,
    TransactionError, TransactionManager,
};

fn breaker_config(threshold: u32) -> CircuitConfig {
    CircuitConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(30),
        ..CircuitConfig::default()
    }
}

fn single_attempt() -> RetryConfig {
    RetryConfig { max_attempts: 1, jitter: false, ..RetryConfig::default() }
}

// ============================================================================
// Circuit Breaker Tests
// ============================================================================

mod circuit_breaker {
    use super::*;

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_calling_provider() {
        let clock = Arc::new(ManualClock::new());
        let breakers = BreakerRegistry::with_clock(breaker_config(3), clock.clone());
        let policy = RetryPolicy::new(single_attempt()).with_clock(clock.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let result = policy
                .run("flaky", &breakers, &cancel, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::Server { status: 502, message: "bad gateway".into() }) }
                })
                .await;
            outcomes.push(result.unwrap_err());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcomes[..3].iter().all(|e| matches!(e, RetryError::Exhausted { .. })));
        assert!(outcomes[3..].iter().all(|e| matches!(e, RetryError::CircuitOpen { attempts: 0, .. })));
        assert_eq!(breakers.state("flaky"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let clock = Arc::new(ManualClock::new());
        let breakers = BreakerRegistry::with_clock(breaker_config(2), clock.clone());
        let policy = RetryPolicy::new(single_attempt()).with_clock(clock.clone());
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _ = policy
                .run("p", &breakers, &cancel, |_| async { Err::<(), _>(ProviderError::Unavailable("down".into())) })
                .await;
        }
        assert_eq!(breakers.state("p"), CircuitState::Open);

        clock.advance(Duration::from_secs(31));
        assert_eq!(breakers.state("p"), CircuitState::HalfOpen);

        let probe = policy.run("p", &breakers, &cancel, |_| async { Ok::<_, ProviderError>("back") }).await;
        assert_eq!(probe.unwrap().value, "back");
        assert_eq!(breakers.state("p"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::new());
        let breakers = BreakerRegistry::with_clock(breaker_config(1), clock.clone());
        let policy = RetryPolicy::new(single_attempt()).with_clock(clock.clone());
        let cancel = CancellationToken::new();
        let failing = |_| async { Err::<(), _>(ProviderError::Timeout(Duration::from_secs(1))) };

        let _ = policy.run("p", &breakers, &cancel, failing).await;
        clock.advance(Duration::from_secs(31));
        let _ = policy.run("p", &breakers, &cancel, failing).await;

        assert_eq!(breakers.state("p"), CircuitState::Open);
        let blocked = policy.run("p", &breakers, &cancel, failing).await.unwrap_err();
        assert!(matches!(blocked, RetryError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_breakers_are_per_provider() {
        let breakers = BreakerRegistry::new(breaker_config(1));
        breakers.record_failure("a");
        assert_eq!(breakers.state("a"), CircuitState::Open);
        assert_eq!(breakers.state("b"), CircuitState::Closed);
        assert!(breakers.allow("b"));
    }
}

// ============================================================================
// Retry Tests
// ============================================================================

mod retry {
    use super::*;

    #[tokio::test]
    async fn test_backoff_sleeps_recorded_by_virtual_clock() {
        let clock = Arc::new(ManualClock::new());
        let breakers = BreakerRegistry::new(breaker_config(100));
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
            ..RetryConfig::default()
        })
        .with_clock(clock.clone());
        let calls = AtomicU32::new(0);

        let result = policy
            .run("p", &breakers, &CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(ProviderError::RateLimited { retry_after: None })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(500), Duration::from_millis(1000)]);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let breakers = BreakerRegistry::new(breaker_config(100));
        let policy = RetryPolicy::new(RetryConfig { max_attempts: 5, ..single_attempt() });
        let calls = AtomicU32::new(0);

        let err = policy
            .run("p", &breakers, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::Authentication("bad key".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Permanent { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

// ============================================================================
// Transaction Tests
// ============================================================================

mod transactions {
    use super::*;

    #[tokio::test]
    async fn test_open_circuit_releases_reservation() {
        let ledger = Arc::new(BudgetLedger::new(Cost::from_dollars(1.0)));
        let breakers = BreakerRegistry::new(breaker_config(1));
        breakers.record_failure("painter");
        let manager = TransactionManager::new(
            ledger.clone(),
            breakers,
            RetryPolicy::new(single_attempt()),
            Arc::new(MemoryStorage::new()),
            CancellationToken::new(),
        );
        let calls = AtomicU32::new(0);

        let err = manager
            .execute(
                SpendLabel::new("icon/a", "painter", SpendKind::Image),
                Funding::Reserve(Cost::from_dollars(0.04)),
                "icon/a.png",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ProviderError>(String::from("never")) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransactionError::CircuitOpen { attempts: 0, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.committed(), Cost::ZERO);
        assert_eq!(ledger.reserved(), Cost::ZERO);
        assert_eq!(ledger.open_reservations(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_transactions_never_exceed_ceiling() {
        let ledger = Arc::new(BudgetLedger::new(Cost::from_dollars(0.50)));
        let manager = TransactionManager::new(
            ledger.clone(),
            BreakerRegistry::new(breaker_config(100)),
            RetryPolicy::new(single_attempt()),
            Arc::new(MemoryStorage::new()),
            CancellationToken::new(),
        )
        .with_concurrency(8);

        let tasks = (0..20).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(
                        SpendLabel::new(format!("icon/{i}"), "writer", SpendKind::Prompt),
                        Funding::Reserve(Cost::from_dollars(0.04)),
                        &format!("prompts/s/icon/{i}.writer.txt"),
                        |_| async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, ProviderError>(String::from("prompt"))
                        },
                    )
                    .await
            })
        });
        let results = futures::future::join_all(tasks).await;

        let committed = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let rejected = results.iter().filter(|r| matches!(r, Ok(Err(e)) if e.is_budget())).count();
        assert_eq!(committed, 12);
        assert_eq!(rejected, 8);
        assert_eq!(ledger.committed(), Cost::from_dollars(0.48));
        assert_eq!(ledger.audited_total(), ledger.committed());
    }
}
