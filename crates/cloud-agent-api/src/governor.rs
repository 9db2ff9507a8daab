//! Request governor: bounded concurrency, minimum start spacing and
//! in-flight deduplication for every outbound call.
//!
//! The governor never looks at the outcome of an operation. It only decides
//! when the operation is allowed to start and hands back whatever the
//! operation produced.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    pub max_concurrent: usize,
    pub min_spacing: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            min_spacing: DEFAULT_MIN_SPACING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorSnapshot {
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub deduplicated_keys: usize,
}

type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

#[derive(Clone)]
pub struct RequestGovernor {
    inner: Arc<GovernorInner>,
}

struct GovernorInner {
    config: GovernorConfig,
    permits: Semaphore,
    schedule: Mutex<Schedule>,
    keyed: Mutex<HashMap<String, KeyedSlot>>,
    next_slot_id: AtomicU64,
}

/// One shared execution plus the number of callers currently awaiting it.
/// When the last waiter goes away the slot is removed, which drops the
/// shared future and with it any concurrency slot it holds.
struct KeyedSlot {
    id: u64,
    waiters: usize,
    shared: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Schedule {
    last_start: Option<Instant>,
    in_flight: usize,
}

impl RequestGovernor {
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        let config = GovernorConfig {
            max_concurrent: config.max_concurrent.max(1),
            min_spacing: config.min_spacing,
        };
        Self {
            inner: Arc::new(GovernorInner {
                config,
                permits: Semaphore::new(config.max_concurrent),
                schedule: Mutex::new(Schedule::default()),
                keyed: Mutex::new(HashMap::new()),
                next_slot_id: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> GovernorConfig {
        self.inner.config
    }

    #[must_use]
    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            in_flight: lock(&self.inner.schedule).in_flight,
            max_concurrent: self.inner.config.max_concurrent,
            deduplicated_keys: lock(&self.inner.keyed).len(),
        }
    }

    /// Runs `operation` once a concurrency slot is free and the minimum
    /// spacing since the previous start has elapsed.
    ///
    /// The slot is released when the returned future completes or is
    /// dropped, so a caller-side timeout never leaks capacity.
    pub async fn enqueue<T, F, Fut>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // The semaphore is never closed; a missing permit cannot happen.
        let _permit = self.inner.permits.acquire().await.ok();

        let wait = self.inner.reserve_start();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let _running = RunningGuard::enter(&self.inner);
        operation().await
    }

    /// Like [`enqueue`](Self::enqueue), but concurrent callers using the same
    /// `key` share a single execution and each receive a clone of its
    /// outcome. The key is forgotten as soon as that execution finishes, or
    /// as soon as every caller awaiting it has been dropped.
    pub async fn enqueue_keyed<T, F, Fut>(&self, key: impl Into<String>, operation: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let (shared, slot_id) = {
            let mut keyed = lock(&self.inner.keyed);
            let existing = keyed.get_mut(&key).and_then(|slot| {
                let shared = slot.shared.downcast_ref::<SharedOutcome<T>>()?.clone();
                slot.waiters += 1;
                Some((shared, slot.id))
            });
            match existing {
                Some(existing) => {
                    tracing::debug!(key = %key, "joining in-flight request");
                    existing
                }
                None => {
                    let governor = self.clone();
                    let fresh: SharedOutcome<T> =
                        async move { governor.enqueue(operation).await }
                            .boxed()
                            .shared();
                    let id = self.inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
                    let replaced = keyed.insert(
                        key.clone(),
                        KeyedSlot {
                            id,
                            waiters: 1,
                            shared: Box::new(fresh.clone()),
                        },
                    );
                    drop(keyed);
                    drop(replaced);
                    (fresh, id)
                }
            }
        };

        let mut waiter = KeyedWaiter {
            inner: &self.inner,
            key: &key,
            slot_id,
            completed: false,
        };
        let outcome = shared.await;
        waiter.completed = true;
        drop(waiter);
        outcome
    }

    /// Detaches every in-flight keyed execution so later callers start a
    /// fresh one. Callers already awaiting an execution still receive it.
    pub fn forget_keyed(&self) {
        let detached = std::mem::take(&mut *lock(&self.inner.keyed));
        drop(detached);
    }
}

impl Default for RequestGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl std::fmt::Debug for RequestGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGovernor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl GovernorInner {
    /// Claims the next start time and returns how long the caller has to
    /// wait for it. Claiming happens under the lock so two callers can never
    /// be handed start times closer than `min_spacing`.
    fn reserve_start(&self) -> Duration {
        let now = Instant::now();
        let mut schedule = lock(&self.schedule);
        let start = match schedule.last_start {
            Some(last) => (last + self.config.min_spacing).max(now),
            None => now,
        };
        schedule.last_start = Some(start);
        start.saturating_duration_since(now)
    }
}

struct RunningGuard<'a> {
    inner: &'a GovernorInner,
}

impl<'a> RunningGuard<'a> {
    fn enter(inner: &'a GovernorInner) -> Self {
        lock(&inner.schedule).in_flight += 1;
        Self { inner }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut schedule = lock(&self.inner.schedule);
        schedule.in_flight = schedule.in_flight.saturating_sub(1);
    }
}

struct KeyedWaiter<'a> {
    inner: &'a GovernorInner,
    key: &'a str,
    slot_id: u64,
    completed: bool,
}

impl Drop for KeyedWaiter<'_> {
    fn drop(&mut self) {
        let removed = {
            let mut keyed = lock(&self.inner.keyed);
            let Some(slot) = keyed.get_mut(self.key) else {
                return;
            };
            if slot.id != self.slot_id {
                return;
            }
            slot.waiters = slot.waiters.saturating_sub(1);
            if self.completed || slot.waiters == 0 {
                keyed.remove(self.key)
            } else {
                None
            }
        };
        // Dropping the slot may drop the shared future, which takes other
        // locks on its way out.
        drop(removed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn governor() -> RequestGovernor {
        RequestGovernor::new(GovernorConfig {
            max_concurrent: 3,
            min_spacing: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_more_than_the_concurrency_bound() {
        let governor = governor();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let governor = governor.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .enqueue(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(750)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(governor.snapshot().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_starts_are_spaced() {
        let governor = governor();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let governor = governor.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                governor
                    .enqueue(|| async {
                        lock(&starts).push(Instant::now());
                    })
                    .await;
            }));
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }

        let mut starts = lock(&starts).clone();
        starts.sort();
        assert_eq!(starts.len(), 6);
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_pass_through_untouched() {
        let governor = governor();
        let failed: Result<u8, &str> = governor.enqueue(|| async { Err("boom") }).await;
        assert_eq!(failed, Err("boom"));
        let ok: Result<u8, &str> = governor.enqueue(|| async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_shares_one_execution() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |governor: RequestGovernor, calls: Arc<AtomicUsize>| async move {
            governor
                .enqueue_keyed("agent:a1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, String>("snapshot".to_string())
                })
                .await
        };

        let (first, second) = tokio::join!(
            run(governor.clone(), calls.clone()),
            run(governor.clone(), calls.clone())
        );
        assert_eq!(first, Ok("snapshot".to_string()));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(governor.snapshot().deduplicated_keys, 0);

        let third = run(governor.clone(), calls.clone()).await;
        assert_eq!(third, Ok("snapshot".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_operation_releases_its_slot() {
        let governor = RequestGovernor::new(GovernorConfig {
            max_concurrent: 1,
            min_spacing: Duration::ZERO,
        });
        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            governor.enqueue(|| tokio::time::sleep(Duration::from_secs(3600))),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(governor.snapshot().in_flight, 0);

        let value = governor.enqueue(|| async { 42 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_keyed_call_releases_its_slot_and_key() {
        let governor = RequestGovernor::new(GovernorConfig {
            max_concurrent: 1,
            min_spacing: Duration::ZERO,
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            governor.enqueue_keyed("GET /agents/a1", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                1
            }),
        )
        .await;
        assert!(cancelled.is_err());
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.deduplicated_keys, 0);

        let other = tokio::time::timeout(
            Duration::from_secs(60),
            governor.enqueue_keyed("GET /agents/a2", || async { 2 }),
        )
        .await;
        assert_eq!(other, Ok(2));
        assert_eq!(governor.snapshot().deduplicated_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_waiter_keeps_a_shared_call_alive() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |governor: RequestGovernor, calls: Arc<AtomicUsize>| async move {
            governor
                .enqueue_keyed("GET /agents/a1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "finished"
                })
                .await
        };

        let (cancelled, kept) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(50),
                run(governor.clone(), calls.clone())
            ),
            run(governor.clone(), calls.clone())
        );
        assert!(cancelled.is_err());
        assert_eq!(kept, "finished");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.deduplicated_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_keys_start_a_fresh_execution() {
        let governor = governor();
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |governor: RequestGovernor, calls: Arc<AtomicUsize>| async move {
            governor
                .enqueue_keyed("GET /me", move || async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    call
                })
                .await
        };

        let detach = {
            let governor = governor.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                governor.forget_keyed();
            }
        };
        let late = {
            let governor = governor.clone();
            let calls = calls.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                run(governor, calls).await
            }
        };

        let (first, (), second) = tokio::join!(run(governor.clone(), calls.clone()), detach, late);
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(governor.snapshot().deduplicated_keys, 0);
    }
}
