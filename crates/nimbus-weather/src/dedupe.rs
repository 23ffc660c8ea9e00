//! Collapses concurrent identical requests into one.
//!
//! The first caller for a key spawns the operation and registers a shared view of
//! its result. Callers arriving while it is pending await that same result instead
//! of starting their own. The registration is removed as soon as the operation
//! settles, success or failure, so the next call starts fresh.
//!
//! Every caller is counted as a waiter. If all waiters give up before the operation
//! settles (their futures are dropped, e.g. superseded by a newer fetch), the task is
//! aborted, which drops the underlying HTTP request, and the registration is removed.

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::FetchError;

type ResultChannel<T> = Shared<oneshot::Receiver<Result<T, FetchError>>>;

struct Flight<T> {
    /// Distinguishes successive flights for the same key
    id: u64,
    result: ResultChannel<T>,
    waiters: usize,
    task: AbortHandle,
}

type FlightMap<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

/// Keyed in-flight request coordinator. Cloning shares the registrations.
pub struct Dedupe<T> {
    flights: FlightMap<T>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Dedupe<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Dedupe<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> std::fmt::Debug for Dedupe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dedupe")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}

impl<T> Dedupe<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `key`, or join the one already pending for it.
    ///
    /// `operation` is only invoked when no flight is registered for `key`.
    /// It runs under the registry lock, so it must not call back into this `Dedupe`.
    pub async fn run<F, Fut>(&self, key: &str, operation: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (id, result) = self.join_or_start(key, operation);
        let _waiter = Waiter {
            flights: &self.flights,
            key,
            id,
        };

        match result.await {
            Ok(outcome) => outcome,
            // The task was aborted or panicked without reporting back
            Err(_) => Err(FetchError::Cancelled),
        }
    }

    fn join_or_start<F, Fut>(&self, key: &str, operation: F) -> (u64, ResultChannel<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut flights = self.flights.lock();

        if let Some(flight) = flights.get_mut(key) {
            flight.waiters += 1;
            tracing::debug!(key, waiters = flight.waiters, "Joined in-flight request");
            return (flight.id, flight.result.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.flights);
        let owned_key = key.to_string();
        let pending = operation();

        // The map lock is still held here, so the task cannot deregister before
        // the flight below is inserted.
        let task = tokio::spawn(async move {
            let outcome = pending.await;
            remove_flight(&registry, &owned_key, id);
            let _ = tx.send(outcome);
        });

        let result = rx.shared();
        flights.insert(
            key.to_string(),
            Flight {
                id,
                result: result.clone(),
                waiters: 1,
                task: task.abort_handle(),
            },
        );

        (id, result)
    }

    /// Number of keys with a pending operation.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.flights.lock().contains_key(key)
    }
}

fn remove_flight<T>(flights: &Mutex<HashMap<String, Flight<T>>>, key: &str, id: u64) {
    let mut flights = flights.lock();
    if flights.get(key).is_some_and(|f| f.id == id) {
        flights.remove(key);
    }
}

/// Counts one caller awaiting a flight; the last one to leave early aborts it.
struct Waiter<'a, T> {
    flights: &'a Mutex<HashMap<String, Flight<T>>>,
    key: &'a str,
    id: u64,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();

        let abandoned = match flights.get_mut(self.key) {
            Some(flight) if flight.id == self.id => {
                flight.waiters = flight.waiters.saturating_sub(1);
                flight.waiters == 0
            }
            // Already settled, or a newer flight took the key
            _ => false,
        };

        if abandoned {
            if let Some(flight) = flights.remove(self.key) {
                flight.task.abort();
                tracing::debug!(key = self.key, "Aborted abandoned request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    fn slow_ok(
        calls: &Arc<AtomicU32>,
        value: &'static str,
    ) -> impl Future<Output = Result<&'static str, FetchError>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_call() {
        let dedupe = Dedupe::new();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            dedupe.run("current:q=Hanoi", || slow_ok(&calls, "first")),
            dedupe.run("current:q=Hanoi", || slow_ok(&calls, "second")),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Ok("first"));
        assert_eq!(b, Ok("first"));
        assert_eq!(dedupe.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_separately() {
        let dedupe = Dedupe::new();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            dedupe.run("current:q=Hanoi", || slow_ok(&calls, "hanoi")),
            dedupe.run("current:q=Hue", || slow_ok(&calls, "hue")),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a, Ok("hanoi"));
        assert_eq!(b, Ok("hue"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_not_leaked() {
        let dedupe: Dedupe<&'static str> = Dedupe::new();
        let calls = Arc::new(AtomicU32::new(0));

        let failing = || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(FetchError::http(503, "HTTP 503"))
            }
        };

        let (a, b) = tokio::join!(dedupe.run("k", failing), dedupe.run("k", failing));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Err(FetchError::http(503, "HTTP 503")));
        assert_eq!(a, b);
        assert!(!dedupe.is_pending("k"));

        // Settled: the next call starts fresh
        let _ = dedupe.run("k", failing).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_start_fresh() {
        let dedupe = Dedupe::new();
        let calls = Arc::new(AtomicU32::new(0));

        assert_eq!(dedupe.run("k", || slow_ok(&calls, "one")).await, Ok("one"));
        assert_eq!(dedupe.run("k", || slow_ok(&calls, "two")).await, Ok("two"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_flight_is_aborted_and_removed() {
        let dedupe: Dedupe<&'static str> = Dedupe::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            dedupe.run("k", move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok("late")
            }),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(dedupe.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_waiter_keeps_flight_alive() {
        let dedupe = Dedupe::new();
        let calls = Arc::new(AtomicU32::new(0));

        let quitter = tokio::time::timeout(
            Duration::from_millis(10),
            dedupe.run("k", || slow_ok(&calls, "shared")),
        );
        let stayer = dedupe.run("k", || slow_ok(&calls, "unused"));

        let (gave_up, stayed) = tokio::join!(quitter, stayer);
        assert!(gave_up.is_err());
        assert_eq!(stayed, Ok("shared"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
