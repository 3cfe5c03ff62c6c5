use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use mend_core::config::BreakerConfig;
use mend_core::types::{BreakerDenial, CircuitState};
use mend_harness::TokenBreaker;
use mend_store::{BreakerEventQuery, Store};

fn config() -> BreakerConfig {
    BreakerConfig {
        max_daily_tokens: 1_000,
        max_task_tokens: 800,
        max_concurrent_tasks: 4,
        max_retries: 3,
        token_window: Duration::from_secs(86_400),
        half_open_interval: Duration::from_secs(600),
        trip_threshold: 5,
    }
}

fn breaker_with(config: BreakerConfig) -> (TokenBreaker, Arc<Store>) {
    let store = Arc::new(Store::in_memory());
    (TokenBreaker::new(config, store.clone()), store)
}

// ---------------------------------------------------------------------------
// Admission is atomic under concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_never_overshoot_daily_budget() {
    // 20 tasks each want 100 tokens against a 1 000 budget. Pre-reservation
    // must keep the admitted total within budget plus one task's slack.
    let (breaker, _) = breaker_with(BreakerConfig {
        max_concurrent_tasks: 50,
        ..config()
    });

    let mut handles = Vec::new();
    for _ in 0..20 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            breaker.check("llm", "analyze", 100, Some(Uuid::new_v4())).await
        }));
    }

    let mut allowed = 0u64;
    for handle in handles {
        if handle.await.unwrap().allowed {
            allowed += 1;
        }
    }

    assert!(allowed * 100 <= 1_000 + 800, "admitted {allowed} * 100 tokens");
    assert_eq!(breaker.status().await.daily_tokens_used, allowed * 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_never_exceed_task_cap() {
    let (breaker, _) = breaker_with(BreakerConfig {
        max_concurrent_tasks: 3,
        max_daily_tokens: 1_000_000,
        ..config()
    });

    let mut handles = Vec::new();
    for _ in 0..16 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            breaker.check("llm", "analyze", 10, Some(Uuid::new_v4())).await
        }));
    }
    let admitted = {
        let mut n = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                n += 1;
            }
        }
        n
    };

    assert_eq!(admitted, 3);
    assert_eq!(breaker.status().await.tasks_in_flight, 3);
}

// ---------------------------------------------------------------------------
// Release reconciles usage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_pairs_settle_to_actual_spend() {
    let (breaker, _) = breaker_with(BreakerConfig {
        max_daily_tokens: 100_000,
        max_task_tokens: 100_000,
        ..config()
    });

    let pairs: &[(u64, u64)] = &[(500, 320), (1_000, 1_000), (200, 0), (300, 450)];
    let mut expected = 0u64;
    for (reserved, actual) in pairs {
        let task = Uuid::new_v4();
        assert!(breaker.check("llm", "call", *reserved, Some(task)).await.allowed);
        breaker.release(task, *actual, true).await;
        breaker.release_task(task).await;
        expected += actual;
    }

    let status = breaker.status().await;
    assert_eq!(status.daily_tokens_used, expected);
    assert_eq!(status.tasks_in_flight, 0);
}

// ---------------------------------------------------------------------------
// Trip and recovery (S5)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn five_denials_trip_then_probe_recovers() {
    let (breaker, store) = breaker_with(BreakerConfig {
        max_daily_tokens: 100,
        ..config()
    });

    // Five oversized requests inside the 60 s window: all denied for the
    // daily bucket, tripping the circuit.
    for _ in 0..5 {
        let decision = breaker.check("llm", "analyze", 1_000, None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(BreakerDenial::DailyLimit));
    }
    assert_eq!(breaker.status().await.circuit, CircuitState::Open);

    // Sixth check is refused by the open circuit itself.
    let decision = breaker.check("llm", "analyze", 10, None).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(BreakerDenial::CircuitOpen));

    // After the half-open interval the next check is admitted as a probe.
    tokio::time::advance(Duration::from_secs(601)).await;
    let task = Uuid::new_v4();
    let decision = breaker.check("llm", "analyze", 10, Some(task)).await;
    assert!(decision.allowed);
    assert_eq!(breaker.status().await.circuit, CircuitState::HalfOpen);

    // A successful release closes the circuit.
    breaker.release(task, 10, true).await;
    assert_eq!(breaker.status().await.circuit, CircuitState::Closed);

    // The audit log holds every denial.
    let events = store.list_breaker_events(&BreakerEventQuery::default()).await;
    assert_eq!(events.len(), 6);
    assert!(events.iter().any(|e| e.event_type == BreakerDenial::CircuitOpen));
}

#[tokio::test(start_paused = true)]
async fn denial_during_half_open_extends_the_open_interval() {
    let (breaker, _) = breaker_with(BreakerConfig {
        max_daily_tokens: 100,
        ..config()
    });

    for _ in 0..5 {
        breaker.check("llm", "analyze", 1_000, None).await;
    }
    assert_eq!(breaker.status().await.circuit, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(601)).await;

    // The probe itself violates the daily bucket: back to open.
    let decision = breaker.check("llm", "analyze", 1_000, None).await;
    assert!(!decision.allowed);
    let status = breaker.status().await;
    assert_eq!(status.circuit, CircuitState::Open);
    let remaining = status.open_remaining_ms.unwrap();
    assert!(remaining > 590_000, "interval not extended: {remaining}ms");

    // Still refused before the extended interval elapses.
    tokio::time::advance(Duration::from_secs(300)).await;
    let decision = breaker.check("llm", "analyze", 10, None).await;
    assert_eq!(decision.reason, Some(BreakerDenial::CircuitOpen));
}

#[tokio::test(start_paused = true)]
async fn slow_denials_do_not_trip() {
    let (breaker, _) = breaker_with(BreakerConfig {
        max_daily_tokens: 100,
        ..config()
    });

    // Five denials spread 20 s apart never co-exist in the 60 s window.
    for _ in 0..5 {
        breaker.check("llm", "analyze", 1_000, None).await;
        tokio::time::advance(Duration::from_secs(20)).await;
    }
    assert_eq!(breaker.status().await.circuit, CircuitState::Closed);
}

// ---------------------------------------------------------------------------
// Daily cap across competing tasks (S4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exactly_one_of_two_large_requests_fits_the_daily_budget() {
    let (breaker, store) = breaker_with(BreakerConfig {
        max_daily_tokens: 1_000,
        max_task_tokens: 1_000,
        ..config()
    });

    let first = breaker.check("llm", "analyze", 700, Some(Uuid::new_v4())).await;
    let second = breaker.check("llm", "analyze", 700, Some(Uuid::new_v4())).await;

    assert!(first.allowed);
    assert!(!second.allowed);
    assert_eq!(second.reason, Some(BreakerDenial::DailyLimit));

    let events = store.list_breaker_events(&BreakerEventQuery::default()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, BreakerDenial::DailyLimit);
}

// ---------------------------------------------------------------------------
// No leakage on cancel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn abandoned_tasks_are_reaped_by_housekeeping() {
    let (breaker, _) = breaker_with(config());

    // Simulate tasks cancelled without release_task.
    for _ in 0..3 {
        breaker.check("llm", "analyze", 50, Some(Uuid::new_v4())).await;
    }
    assert_eq!(breaker.status().await.tasks_in_flight, 3);

    tokio::time::advance(Duration::from_secs(3_601)).await;
    breaker.housekeep().await;
    assert_eq!(breaker.status().await.tasks_in_flight, 0);
}

#[tokio::test]
async fn release_task_frees_slot_on_abort_path() {
    let (breaker, _) = breaker_with(BreakerConfig {
        max_concurrent_tasks: 1,
        ..config()
    });

    let task = Uuid::new_v4();
    assert!(breaker.check("llm", "analyze", 50, Some(task)).await.allowed);
    assert!(!breaker.check("llm", "analyze", 50, Some(Uuid::new_v4())).await.allowed);

    // Abort path: reconcile with zero actuals, then free the slot.
    breaker.release(task, 0, false).await;
    breaker.release_task(task).await;

    assert_eq!(breaker.status().await.daily_tokens_used, 0);
    assert!(breaker.check("llm", "analyze", 50, Some(Uuid::new_v4())).await.allowed);
}
