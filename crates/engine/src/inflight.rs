//! At most one running operation per key.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

/// Result of an operation, awaitable by any number of callers.
pub type SharedResult<T> = Shared<BoxFuture<'static, EngineResult<T>>>;

/// Map of running operations keyed by what they work on.
///
/// The first caller for a key starts the operation on its own task; later
/// callers get the same pending result. The key is released as soon as the
/// operation settles, so a failed attempt never blocks the next one.
pub struct Inflight<K, T> {
    ops: Arc<DashMap<K, SharedResult<T>>>,
}

impl<K, T> Clone for Inflight<K, T> {
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
        }
    }
}

impl<K, T> Default for Inflight<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            ops: Arc::new(DashMap::new()),
        }
    }
}

/// Removes its key when dropped, including when the operation panics.
struct Release<K: Eq + Hash, T> {
    ops: Arc<DashMap<K, SharedResult<T>>>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for Release<K, T> {
    fn drop(&mut self) {
        self.ops.remove(&self.key);
    }
}

impl<K, T> Inflight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the operation running for `key`, or start `op` if there is none.
    pub fn run<F>(&self, key: K, op: F) -> SharedResult<T>
    where
        F: Future<Output = EngineResult<T>> + Send + 'static,
    {
        match self.ops.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let ops = self.ops.clone();
                // The entry guard is held until the insert below, so the
                // removal cannot run before the future is registered.
                let handle = tokio::spawn(async move {
                    let _release = Release { ops, key };
                    op.await
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(EngineError::Internal(format!("operation task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.ops.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
