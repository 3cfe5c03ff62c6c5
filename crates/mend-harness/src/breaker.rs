//! Multi-dimensional circuit breaker for external-model usage.
//!
//! One instance guards four budgets at a single policy point: a rolling
//! daily token bucket, a per-task token quota, a concurrent-task cap, and
//! a trip circuit driven by a 60 s denial window. Admission pre-reserves
//! the estimated tokens so concurrent checks cannot jointly overshoot a
//! limit; [`TokenBreaker::release`] reconciles the reservation against the
//! actual spend afterwards.
//!
//! All clocks are `tokio::time::Instant`, so tests can drive the daily
//! window and half-open probing with a paused runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mend_core::config::BreakerConfig;
use mend_core::types::{BreakerDenial, BreakerEvent, BreakerSnapshot, CircuitState};
use mend_store::Store;

/// Window over which denials accumulate toward a trip.
const TRIP_WINDOW: Duration = Duration::from_secs(60);

/// Task entries older than this are expired by housekeeping, freeing
/// their concurrency slot even if the owner never released.
const TASK_TTL: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct BreakerDecision {
    pub allowed: bool,
    pub reason: Option<BreakerDenial>,
    pub snapshot: BreakerSnapshot,
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct TaskEntry {
    tokens_used: u64,
    last_reserved: u64,
    retry_count: u32,
    created_at: Instant,
}

#[derive(Debug)]
struct Inner {
    circuit: Circuit,
    daily_tokens_used: u64,
    window_started: Instant,
    tasks: HashMap<Uuid, TaskEntry>,
    denials: VecDeque<Instant>,
}

impl Inner {
    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_started) >= window {
            debug!(used = self.daily_tokens_used, "daily token window rolled");
            self.daily_tokens_used = 0;
            self.window_started = now;
        }
    }

    fn prune_denials(&mut self, now: Instant) {
        while let Some(front) = self.denials.front() {
            if now.duration_since(*front) > TRIP_WINDOW {
                self.denials.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self, now: Instant, config: &BreakerConfig) -> BreakerSnapshot {
        let (circuit, open_remaining_ms) = match self.circuit {
            Circuit::Closed => (CircuitState::Closed, None),
            Circuit::HalfOpen => (CircuitState::HalfOpen, None),
            Circuit::Open { until } => (
                CircuitState::Open,
                Some(until.saturating_duration_since(now).as_millis() as u64),
            ),
        };
        let window_end = self.window_started + config.token_window;
        BreakerSnapshot {
            circuit,
            daily_tokens_used: self.daily_tokens_used,
            max_daily_tokens: config.max_daily_tokens,
            daily_window_remaining_ms: window_end.saturating_duration_since(now).as_millis()
                as u64,
            tasks_in_flight: self.tasks.len(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            recent_denials: self.denials.len(),
            open_remaining_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBreaker
// ---------------------------------------------------------------------------

/// The single admission authority. Clone-cheap; all state sits behind one
/// mutex so every transition is serialized and check/release appear atomic
/// to callers.
#[derive(Clone)]
pub struct TokenBreaker {
    config: BreakerConfig,
    store: Arc<Store>,
    inner: Arc<Mutex<Inner>>,
}

impl TokenBreaker {
    pub fn new(config: BreakerConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            inner: Arc::new(Mutex::new(Inner {
                circuit: Circuit::Closed,
                daily_tokens_used: 0,
                window_started: Instant::now(),
                tasks: HashMap::new(),
                denials: VecDeque::new(),
            })),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admission check for one prospective model call.
    ///
    /// Tests run in order: circuit, daily bucket, concurrency, per-task
    /// quota. On allow with a task id, the estimate is pre-reserved against
    /// the daily and task totals and a previously-unseen task takes a
    /// concurrency slot. Without a task id the check is a pure probe (the
    /// diagnostic endpoint): nothing is reserved.
    ///
    /// Every denial is appended to the store as a breaker event.
    pub async fn check(
        &self,
        service: &str,
        action: &str,
        estimated_tokens: u64,
        task_id: Option<Uuid>,
    ) -> BreakerDecision {
        let now = Instant::now();
        let (decision, event) = {
            let mut inner = self.inner.lock().await;
            inner.roll_window(now, self.config.token_window);
            inner.prune_denials(now);

            // (i) circuit
            if let Circuit::Open { until } = inner.circuit {
                if now < until {
                    let (decision, event) = self.deny(
                        &mut inner,
                        now,
                        service,
                        action,
                        BreakerDenial::CircuitOpen,
                        task_id,
                    );
                    return self.finish(decision, event).await;
                }
                info!("circuit open interval elapsed, admitting half-open probe");
                inner.circuit = Circuit::HalfOpen;
            }

            // (ii) daily bucket
            if inner.daily_tokens_used + estimated_tokens > self.config.max_daily_tokens {
                let (decision, event) = self.deny(
                    &mut inner,
                    now,
                    service,
                    action,
                    BreakerDenial::DailyLimit,
                    task_id,
                );
                return self.finish(decision, event).await;
            }

            // (iii) concurrency, only a new task takes a slot
            let is_new_task = task_id.is_some_and(|id| !inner.tasks.contains_key(&id));
            if is_new_task && inner.tasks.len() >= self.config.max_concurrent_tasks {
                let (decision, event) = self.deny(
                    &mut inner,
                    now,
                    service,
                    action,
                    BreakerDenial::ConcurrencyLimit,
                    task_id,
                );
                return self.finish(decision, event).await;
            }

            // (iv) per-task quota for already-registered tasks
            if let Some(id) = task_id {
                if let Some(entry) = inner.tasks.get(&id) {
                    if entry.tokens_used + estimated_tokens > self.config.max_task_tokens {
                        let (decision, event) = self.deny(
                            &mut inner,
                            now,
                            service,
                            action,
                            BreakerDenial::TaskLimit,
                            task_id,
                        );
                        return self.finish(decision, event).await;
                    }
                }
            }

            // Allowed: pre-reserve.
            if let Some(id) = task_id {
                inner.daily_tokens_used += estimated_tokens;
                let entry = inner.tasks.entry(id).or_insert_with(|| TaskEntry {
                    tokens_used: 0,
                    last_reserved: 0,
                    retry_count: 0,
                    created_at: now,
                });
                entry.tokens_used += estimated_tokens;
                entry.last_reserved = estimated_tokens;
            }

            let decision = BreakerDecision {
                allowed: true,
                reason: None,
                snapshot: inner.snapshot(now, &self.config),
            };
            (decision, None)
        };
        self.finish(decision, event).await
    }

    /// Reconcile a reservation against the actual token spend. A successful
    /// release while half-open closes the circuit; the task entry stays
    /// registered until [`TokenBreaker::release_task`].
    pub async fn release(&self, task_id: Uuid, actual_tokens: u64, success: bool) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.tasks.get_mut(&task_id) else {
            warn!(%task_id, "release for unknown task ignored");
            return;
        };
        let reserved = entry.last_reserved;
        entry.last_reserved = 0;
        entry.tokens_used = entry
            .tokens_used
            .saturating_sub(reserved)
            .saturating_add(actual_tokens);
        inner.daily_tokens_used = inner
            .daily_tokens_used
            .saturating_sub(reserved)
            .saturating_add(actual_tokens);

        if success && inner.circuit == Circuit::HalfOpen {
            info!("half-open probe succeeded, closing circuit");
            inner.circuit = Circuit::Closed;
            inner.denials.clear();
        }
    }

    /// Drop a task's entry and free its concurrency slot. Called by the
    /// orchestrator on every exit path, including aborts.
    pub async fn release_task(&self, task_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if inner.tasks.remove(&task_id).is_some() {
            debug!(%task_id, in_flight = inner.tasks.len(), "task released");
        }
    }

    /// Bump a task's retry counter. Returns `false` once the count exceeds
    /// the configured maximum, recording a `max_retries` breaker event.
    pub async fn increment_retry(&self, task_id: Uuid) -> bool {
        let now = Instant::now();
        let event = {
            let mut inner = self.inner.lock().await;
            let entry = inner.tasks.entry(task_id).or_insert_with(|| TaskEntry {
                tokens_used: 0,
                last_reserved: 0,
                retry_count: 0,
                created_at: now,
            });
            entry.retry_count += 1;
            if entry.retry_count <= self.config.max_retries {
                None
            } else {
                let snapshot = inner.snapshot(now, &self.config);
                Some(Self::event(
                    "agent",
                    "retry",
                    BreakerDenial::MaxRetries,
                    snapshot,
                    Some(task_id),
                ))
            }
        };
        match event {
            None => true,
            Some(event) => {
                warn!(%task_id, max = self.config.max_retries, "retry budget exhausted");
                self.store.record_breaker_event(event).await;
                false
            }
        }
    }

    pub async fn retry_count(&self, task_id: Uuid) -> u32 {
        let inner = self.inner.lock().await;
        inner.tasks.get(&task_id).map_or(0, |e| e.retry_count)
    }

    /// Observability snapshot.
    pub async fn status(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner.snapshot(now, &self.config)
    }

    /// One housekeeping pass: roll the daily window, expire stale task
    /// entries, trim the denial ring. Public so tests and the loop share it.
    pub async fn housekeep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.roll_window(now, self.config.token_window);
        inner.prune_denials(now);
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, entry| now.duration_since(entry.created_at) < TASK_TTL);
        let expired = before - inner.tasks.len();
        if expired > 0 {
            warn!(expired, "expired stale task entries");
        }
    }

    /// Housekeeping loop at 1 Hz; exits when `shutdown` resolves.
    pub async fn run_housekeeping(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.housekeep().await,
                _ = shutdown.recv() => return,
            }
        }
    }

    // ----- helpers -----

    /// Record a denial: feeds the trip ring, may open the circuit, and
    /// produces the decision plus the event row to append once the lock is
    /// released.
    fn deny(
        &self,
        inner: &mut Inner,
        now: Instant,
        service: &str,
        action: &str,
        reason: BreakerDenial,
        task_id: Option<Uuid>,
    ) -> (BreakerDecision, Option<BreakerEvent>) {
        inner.denials.push_back(now);
        inner.prune_denials(now);

        match inner.circuit {
            Circuit::Closed if inner.denials.len() >= self.config.trip_threshold => {
                warn!(
                    denials = inner.denials.len(),
                    "denial threshold reached, opening circuit"
                );
                inner.circuit = Circuit::Open {
                    until: now + self.config.half_open_interval,
                };
            }
            Circuit::HalfOpen => {
                warn!(%reason, "denial during half-open probe, re-opening circuit");
                inner.circuit = Circuit::Open {
                    until: now + self.config.half_open_interval,
                };
            }
            _ => {}
        }

        let snapshot = inner.snapshot(now, &self.config);
        let decision = BreakerDecision {
            allowed: false,
            reason: Some(reason),
            snapshot: snapshot.clone(),
        };
        let event = Self::event(service, action, reason, snapshot, task_id);
        (decision, Some(event))
    }

    fn event(
        service: &str,
        action: &str,
        event_type: BreakerDenial,
        usage: BreakerSnapshot,
        task_id: Option<Uuid>,
    ) -> BreakerEvent {
        BreakerEvent {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            service: service.to_string(),
            action: action.to_string(),
            event_type,
            usage,
            task_id,
            resolved: false,
            resolution: None,
        }
    }

    async fn finish(
        &self,
        decision: BreakerDecision,
        event: Option<BreakerEvent>,
    ) -> BreakerDecision {
        if let Some(event) = event {
            self.store.record_breaker_event(event).await;
        }
        decision
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
