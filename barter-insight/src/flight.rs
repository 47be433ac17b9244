//! Request coalescing ("singleflight") registry.
//!
//! Maps a key to one shared, awaitable fetch. Concurrent callers for the same key await the same
//! handle, so N callers produce exactly one upstream call. The fetch runs on its own task and
//! unregisters itself when it finishes, fails, panics or is torn down, so a caller dropping its
//! future never leaves a phantom entry behind.

use crate::error::CacheError;
use fnv::FnvHashMap;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{fmt::Display, future::Future, hash::Hash, sync::Arc};
use tracing::trace;

/// Clonable handle to a fetch in flight.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

/// Outcome of [`InFlight::join_or_spawn`].
pub enum Flight<V> {
    /// The value was fresh when re-checked under the registry lock.
    Cached(V),
    /// A fetch is in flight, either joined or newly started.
    Pending(SharedFetch<V>),
}

impl<V> Flight<V>
where
    V: Clone,
{
    pub async fn resolve(self) -> Result<V, CacheError> {
        match self {
            Flight::Cached(value) => Ok(value),
            Flight::Pending(fetch) => fetch.await,
        }
    }
}

type Registry<K, V> = Arc<Mutex<FnvHashMap<K, SharedFetch<V>>>>;

/// Registry of fetches in flight, at most one per key.
pub struct InFlight<K, V> {
    pending: Registry<K, V>,
}

impl<K, V> InFlight<K, V>
where
    K: Clone + Eq + Hash + Display + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(FnvHashMap::default())),
        }
    }

    /// Join the fetch in flight for `key`, else return the value produced by `fresh`, else start
    /// the fetch produced by `start`.
    ///
    /// All three checks happen under the registry lock, so a fetch that completes concurrently is
    /// observed either as still in flight or as a fresh value, never as neither. The fetch must
    /// write its result to the cache before resolving.
    pub fn join_or_spawn<Fresh, Start, Fut>(&self, key: K, fresh: Fresh, start: Start) -> Flight<V>
    where
        Fresh: FnOnce() -> Option<V>,
        Start: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    {
        let mut pending = self.pending.lock();

        if let Some(fetch) = pending.get(&key) {
            trace!(%key, "joining fetch in flight");
            return Flight::Pending(fetch.clone());
        }

        if let Some(value) = fresh() {
            return Flight::Cached(value);
        }

        let unregister = Unregister {
            registry: Arc::clone(&self.pending),
            key: Some(key.clone()),
        };
        let fetch = start();
        let handle = tokio::spawn(async move {
            let _unregister = unregister;
            fetch.await
        });

        let label = key.to_string();
        let shared = async move {
            handle.await.unwrap_or_else(|error| {
                Err(CacheError::Aborted {
                    key: label,
                    reason: error.to_string(),
                })
            })
        }
        .boxed()
        .shared();

        trace!(%key, "starting fetch");
        pending.insert(key, shared.clone());
        Flight::Pending(shared)
    }

    /// Number of fetches currently in flight.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Clone + Eq + Hash + Display + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Unregister<K, V>
where
    K: Eq + Hash,
{
    registry: Registry<K, V>,
    key: Option<K>,
}

impl<K, V> Drop for Unregister<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.lock().remove(&key);
        }
    }
}
