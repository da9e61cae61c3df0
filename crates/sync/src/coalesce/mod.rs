// Single-flight fetch coalescing.
//
// At most one fetch per key is in flight. Callers that arrive while a fetch
// is running attach to it and receive the same outcome. The record is
// removed in the same critical section that publishes the result, so a
// caller arriving after settlement always starts a fresh fetch and never
// sees a cached value or a cached error.
//
// The fetch runs on its own task: a caller that gives up waiting does not
// cancel the work other callers are attached to.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SyncError;

type Outcome<V> = Option<Result<V, SyncError>>;

struct InFlight<V> {
    id: u64,
    result: watch::Receiver<Outcome<V>>,
    waiters: usize,
}

struct Inner<K, V> {
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    next_id: AtomicU64,
    fetches_started: AtomicUsize,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, InFlight<V>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed single-flight executor. Cheap to clone; clones share state.
pub struct FetchCoalescer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for FetchCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, V> Default for FetchCoalescer<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FetchCoalescer<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                fetches_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Run `fetch` for `key`, or attach to the fetch already running for it.
    ///
    /// `fetch` is only invoked when this call starts a new flight.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<V, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>> + Send + 'static,
    {
        let (mut rx, started) = {
            let mut in_flight = self.inner.lock();
            match in_flight.get_mut(&key) {
                Some(record) => {
                    record.waiters += 1;
                    debug!(%key, waiters = record.waiters, "attached to in-flight fetch");
                    (record.result.clone(), None)
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.clone(), InFlight { id, result: rx.clone(), waiters: 1 });
                    (rx, Some((id, tx)))
                }
            }
        };

        if let Some((id, tx)) = started {
            self.inner.fetches_started.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "starting fetch");
            let future = fetch();
            let guard =
                SettleGuard { inner: Arc::clone(&self.inner), key: key.clone(), id, tx: Some(tx) };
            tokio::spawn(async move {
                let result = future.await;
                guard.settle(result);
            });
        }

        let settled = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| Err(SyncError::FetchAborted(key.to_string())))
    }

    /// Number of keys with a fetch currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Callers attached to the in-flight fetch for `key`, if any.
    pub fn waiters(&self, key: &K) -> Option<usize> {
        self.inner.lock().get(key).map(|record| record.waiters)
    }

    /// Total fetches started since construction.
    pub fn fetches_started(&self) -> usize {
        self.inner.fetches_started.load(Ordering::Relaxed)
    }
}

/// Owns the publishing side of one flight. Dropping it unsettled (panic or
/// runtime shutdown) clears the record so the key is not wedged.
struct SettleGuard<K: Eq + Hash, V> {
    inner: Arc<Inner<K, V>>,
    key: K,
    id: u64,
    tx: Option<watch::Sender<Outcome<V>>>,
}

impl<K: Eq + Hash, V> SettleGuard<K, V> {
    fn settle(mut self, result: Result<V, SyncError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let mut in_flight = self.inner.lock();
        remove_if_current(&mut in_flight, &self.key, self.id);
        tx.send_replace(Some(result));
    }
}

impl<K: Eq + Hash, V> Drop for SettleGuard<K, V> {
    fn drop(&mut self) {
        if self.tx.take().is_some() {
            warn!("fetch ended without settling; releasing waiters");
            let mut in_flight = self.inner.lock();
            remove_if_current(&mut in_flight, &self.key, self.id);
        }
    }
}

fn remove_if_current<K: Eq + Hash, V>(in_flight: &mut HashMap<K, InFlight<V>>, key: &K, id: u64) {
    if in_flight.get(key).is_some_and(|record| record.id == id) {
        in_flight.remove(key);
    }
}
