//! The [`FutureRegistry`] and its entry state machine.
//!
//! The registry keeps one guarded table of entries. Every entry owns a shared
//! future handed out to callers, its settlement status, an optional external
//! settlement handle, and an optional eviction timer. Entries come into
//! existence in one of two ways:
//! - [`FutureRegistry::get`] on an unknown key creates an *awaiting*
//!   placeholder: the entry holds a settlement handle that a later
//!   [`resolve`](FutureRegistry::resolve) or
//!   [`reject`](FutureRegistry::reject) fires.
//! - [`resolve`](FutureRegistry::resolve) /
//!   [`reject`](FutureRegistry::reject) on an unknown key create an
//!   *adopting* entry: its outcome is driven by a spawned task (or was fixed
//!   at creation), and no external handle ever exists. Such entries cannot be
//!   settled again, even while the adoption is still in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use tokio::task::AbortHandle;

use crate::config::Config;
use crate::settlement::{AlreadySettledError, Outcome, Rejection, SettlementFuture};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

/// How an entry gets settled.
enum Settlement<V, E> {
    /// Placeholder created by `get`. The sender is the externally invokable
    /// settlement handle; completing with `Ok` fulfills, `Err` rejects.
    Awaiting(oneshot::Sender<Outcome<V, E>>),
    /// The outcome is owned by a spawned adoption task or was fixed at
    /// creation. Also the terminal state of a consumed `Awaiting` handle.
    Adopting,
}

struct Entry<V, E> {
    future: SettlementFuture<V, E>,
    status: Status,
    settlement: Settlement<V, E>,
    eviction: Option<AbortHandle>,
    /// Distinguishes this entry from a later one under the same key, so that
    /// stale adoption tasks and eviction timers never touch a successor.
    generation: u64,
}

struct RegistryInner<K, V, E> {
    config: Config,
    runtime: tokio::runtime::Handle,
    next_generation: AtomicU64,
    entries: Mutex<BTreeMap<K, Entry<V, E>>>,
}

/// A keyed registry of asynchronous results.
///
/// Cheap to clone; all clones share the same table.
pub struct FutureRegistry<K, V, E> {
    inner: Arc<RegistryInner<K, V, E>>,
}

impl<K, V, E> Clone for FutureRegistry<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for FutureRegistry<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureRegistry")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> FutureRegistry<K, V, E>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a registry that spawns its adoption tasks and eviction timers
    /// on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) in that case.
    pub fn new(config: Config) -> Self {
        Self::with_runtime(config, tokio::runtime::Handle::current())
    }

    /// Creates a registry that spawns on the given runtime handle.
    pub fn with_runtime(config: Config, runtime: tokio::runtime::Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                runtime,
                next_generation: AtomicU64::new(0),
                entries: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Gives access to the [`Config`].
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns `true` if an entry for `key` exists, regardless of its status.
    pub fn has(&self, key: &K) -> bool {
        self.inner.entries.lock().unwrap().contains_key(key)
    }

    /// Returns `true` if `key` exists and has not settled yet.
    pub fn is_pending(&self, key: &K) -> bool {
        self.status_is(key, Status::Pending)
    }

    /// Returns `true` if `key` exists and settled successfully.
    pub fn is_fulfilled(&self, key: &K) -> bool {
        self.status_is(key, Status::Fulfilled)
    }

    /// Returns `true` if `key` exists and settled with a failure.
    pub fn is_rejected(&self, key: &K) -> bool {
        self.status_is(key, Status::Rejected)
    }

    /// The number of entries currently in the registry, settled or not.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Returns `true` if the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn status_is(&self, key: &K, status: Status) -> bool {
        let entries = self.inner.entries.lock().unwrap();
        entries.get(key).is_some_and(|entry| entry.status == status)
    }

    /// Returns the future for `key`, creating an awaiting placeholder if the
    /// key is unknown.
    ///
    /// For an existing key this hands out a clone of the current future and
    /// changes nothing else, neither status nor timers. A created placeholder
    /// stays pending until a later [`resolve`](Self::resolve) /
    /// [`reject`](Self::reject) / [`delete`](Self::delete) targets the key.
    pub fn get(&self, key: K) -> SettlementFuture<V, E> {
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get(&key) {
            return entry.future.clone();
        }

        let (sender, receiver) = oneshot::channel();
        let entry = Entry {
            future: SettlementFuture::new(receiver),
            status: Status::Pending,
            settlement: Settlement::Awaiting(sender),
            eviction: None,
            generation: self.next_generation(),
        };
        let future = entry.future.clone();
        entries.insert(key, entry);
        future
    }

    /// Settles `key` by adopting the outcome of `source`.
    ///
    /// If the key is unknown, a new entry is created. It reports as pending
    /// from the moment this returns (`Ok(true)`), even when `source` is
    /// already resolvable, and settles once the spawned adoption of `source`
    /// finishes.
    ///
    /// If the key holds a pending placeholder, its settlement handle is
    /// consumed (a second settlement attempt fails fast) and fired with the
    /// adoption result once available; until then the entry stays pending.
    /// Returns `Ok(false)`.
    ///
    /// Any other existing entry fails with [`AlreadySettledError`]. Both
    /// successful branches (re)start the eviction timer.
    pub fn resolve_with<F>(&self, key: K, source: F) -> Result<bool, AlreadySettledError>
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut entries = self.inner.entries.lock().unwrap();
        let (created, generation, sender) = match entries.get_mut(&key) {
            None => {
                let (sender, receiver) = oneshot::channel();
                let mut entry = Entry {
                    future: SettlementFuture::new(receiver),
                    status: Status::Pending,
                    settlement: Settlement::Adopting,
                    eviction: None,
                    generation: self.next_generation(),
                };
                self.schedule_eviction(&mut entry, key.clone());
                let generation = entry.generation;
                entries.insert(key.clone(), entry);
                (true, generation, sender)
            }
            Some(entry) => {
                let sender = entry.take_settlement_handle()?;
                self.schedule_eviction(entry, key.clone());
                (false, entry.generation, sender)
            }
        };
        drop(entries);

        self.spawn_adoption(key, generation, source, sender);
        Ok(created)
    }

    /// Settles `key` with a plain value.
    ///
    /// Equivalent to [`resolve_with`](Self::resolve_with) on an immediately
    /// ready source: the entry still reports as pending when this returns and
    /// fulfills on the next scheduling turn.
    pub fn resolve(&self, key: K, value: V) -> Result<bool, AlreadySettledError> {
        self.resolve_with(key, std::future::ready(Ok(value)))
    }

    /// Settles `key` with a failure, immediately.
    ///
    /// Unlike [`resolve_with`](Self::resolve_with) there is nothing to adopt:
    /// an unknown key gets an entry that is born rejected (`Ok(true)`), and a
    /// pending placeholder has its handle fired with the failure right away
    /// (`Ok(false)`). Any other existing entry fails with
    /// [`AlreadySettledError`]. Both successful branches (re)start the
    /// eviction timer.
    pub fn reject(&self, key: K, reason: E) -> Result<bool, AlreadySettledError> {
        let mut entries = self.inner.entries.lock().unwrap();
        match entries.get_mut(&key) {
            None => {
                let (sender, receiver) = oneshot::channel();
                let _ = sender.send(Err(Rejection::Reason(reason)));
                let mut entry = Entry {
                    future: SettlementFuture::new(receiver),
                    status: Status::Rejected,
                    settlement: Settlement::Adopting,
                    eviction: None,
                    generation: self.next_generation(),
                };
                self.schedule_eviction(&mut entry, key.clone());
                entries.insert(key, entry);
                Ok(true)
            }
            Some(entry) => {
                let sender = entry.take_settlement_handle()?;
                entry.status = Status::Rejected;
                let _ = sender.send(Err(Rejection::Reason(reason)));
                self.schedule_eviction(entry, key);
                Ok(false)
            }
        }
    }

    /// Rejects every entry that still holds a settlement handle, returning
    /// how many were rejected.
    ///
    /// Entries that are pending because they are mid-adoption (created via
    /// [`resolve`](Self::resolve) / [`resolve_with`](Self::resolve_with))
    /// have no handle to fire and are deliberately left alone.
    pub fn reject_all(&self, reason: E) -> usize {
        // One lock scope for the whole sweep: settling inline never creates
        // entries, and no other operation can interleave mid-sweep.
        let mut entries = self.inner.entries.lock().unwrap();

        // Snapshot the candidates first; settling mutates the table.
        let candidates: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.status == Status::Pending
                    && matches!(entry.settlement, Settlement::Awaiting(_))
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut rejected = 0;
        for key in candidates {
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            let Ok(sender) = entry.take_settlement_handle() else {
                continue;
            };
            entry.status = Status::Rejected;
            let _ = sender.send(Err(Rejection::Reason(reason.clone())));
            self.schedule_eviction(entry, key);
            rejected += 1;
        }
        rejected
    }

    /// Removes the entry for `key`, returning whether one existed.
    ///
    /// A still-awaiting placeholder is force-failed with
    /// [`Rejection::Deleted`] so that nobody awaiting its future hangs
    /// forever. An adopting entry is simply removed; its in-flight source
    /// keeps running and settles the already-handed-out futures unobserved.
    /// Any outstanding eviction timer is cancelled.
    pub fn delete(&self, key: &K) -> bool {
        let entry = self.inner.entries.lock().unwrap().remove(key);
        match entry {
            Some(entry) => {
                entry.discard();
                tracing::debug!("deleted entry");
                true
            }
            None => false,
        }
    }

    /// Deletes every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut *self.inner.entries.lock().unwrap());
        let count = entries.len();
        for (_, entry) in entries {
            entry.discard();
        }
        tracing::debug!(count, "cleared registry");
        count
    }

    fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Drives `source` to completion on the runtime, then records the status
    /// transition and delivers the outcome to everyone holding the future.
    fn spawn_adoption<F>(
        &self,
        key: K,
        generation: u64,
        source: F,
        sender: oneshot::Sender<Outcome<V, E>>,
    ) where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = source.await.map_err(Rejection::Reason);

            {
                let mut entries = inner.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&key)
                    && entry.generation == generation
                    && entry.status == Status::Pending
                {
                    entry.status = match outcome {
                        Ok(_) => Status::Fulfilled,
                        Err(_) => Status::Rejected,
                    };
                }
            }

            // Deliver even when the entry is gone: a deleted entry's future
            // settles on its own, unobserved by the registry.
            let _ = sender.send(outcome);
        });
    }

    /// (Re)starts the eviction timer for an entry, cancelling the previous
    /// one. No-op unless an eviction timeout is configured.
    fn schedule_eviction(&self, entry: &mut Entry<V, E>, key: K) {
        let Some(timeout) = self.inner.config.eviction_timeout else {
            return;
        };
        if let Some(previous) = entry.eviction.take() {
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        let generation = entry.generation;
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut entries = inner.entries.lock().unwrap();
            let current = entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            let removed = if current { entries.remove(&key) } else { None };
            drop(entries);

            if let Some(entry) = removed {
                tracing::debug!(?timeout, "evicted entry");
                entry.discard();
            }
        });
        entry.eviction = Some(task.abort_handle());
    }
}

impl<V, E> Entry<V, E> {
    /// Takes the external settlement handle out of a pending placeholder.
    ///
    /// Fails for entries that already settled or never had a handle; the
    /// handle cannot be reused once taken.
    fn take_settlement_handle(
        &mut self,
    ) -> Result<oneshot::Sender<Outcome<V, E>>, AlreadySettledError> {
        if self.status != Status::Pending {
            return Err(AlreadySettledError);
        }
        match std::mem::replace(&mut self.settlement, Settlement::Adopting) {
            Settlement::Awaiting(sender) => Ok(sender),
            Settlement::Adopting => Err(AlreadySettledError),
        }
    }

    /// Tears the entry down after removal from the table: cancels its timer
    /// and force-fails a still-awaiting placeholder.
    fn discard(self) {
        if let Some(timer) = self.eviction {
            timer.abort();
        }
        if let Settlement::Awaiting(sender) = self.settlement {
            let _ = sender.send(Err(Rejection::Deleted));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry() -> FutureRegistry<&'static str, i32, String> {
        FutureRegistry::new(Config::default())
    }

    fn registry_with_timeout(millis: u64) -> FutureRegistry<&'static str, i32, String> {
        FutureRegistry::new(Config::with_eviction_timeout(Duration::from_millis(millis)))
    }

    #[tokio::test]
    async fn test_absent_key_reports_nothing() {
        let registry = registry();

        assert!(!registry.has(&"missing"));
        assert!(!registry.is_pending(&"missing"));
        assert!(!registry.is_fulfilled(&"missing"));
        assert!(!registry.is_rejected(&"missing"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_get_then_resolve_fulfills_placeholder() {
        let registry = registry();

        let future = registry.get("req-1");
        assert!(registry.is_pending(&"req-1"));

        let created = registry.resolve("req-1", 42).unwrap();
        assert!(!created);
        // The placeholder stays pending until the adoption task has run.
        assert!(registry.is_pending(&"req-1"));

        assert_eq!(future.await, Ok(42));
        assert!(registry.is_fulfilled(&"req-1"));
    }

    #[tokio::test]
    async fn test_resolve_creates_entry_pending_until_next_turn() {
        let registry = registry();

        assert!(registry.resolve("req-1", 5).unwrap());
        assert!(registry.is_pending(&"req-1"));

        assert_eq!(registry.get("req-1").await, Ok(5));
        assert!(registry.is_fulfilled(&"req-1"));
    }

    #[tokio::test]
    async fn test_direct_entries_cannot_be_settled_again() {
        let registry = registry();

        registry
            .resolve_with("req-1", std::future::pending())
            .unwrap();

        // The adoption is still in flight, but there is no handle to fire.
        assert!(registry.resolve("req-1", 5).is_err());
        assert!(registry.reject("req-1", "nope".to_owned()).is_err());
        assert!(registry.is_pending(&"req-1"));
    }

    #[tokio::test]
    async fn test_settlement_handle_is_consumed_by_resolve() {
        let registry = registry();

        let _future = registry.get("req-1");
        let created = registry
            .resolve_with("req-1", std::future::pending())
            .unwrap();
        assert!(!created);

        // Still pending, but the handle is gone; further settlement fails fast.
        assert!(registry.is_pending(&"req-1"));
        assert!(registry.resolve("req-1", 7).is_err());
    }

    #[tokio::test]
    async fn test_reject_settles_placeholder_immediately() {
        let registry = registry();

        let future = registry.get("req-1");
        let created = registry.reject("req-1", "bad".to_owned()).unwrap();
        assert!(!created);

        // No adoption involved; the rejection is visible synchronously.
        assert!(registry.is_rejected(&"req-1"));
        assert_eq!(future.await, Err(Rejection::Reason("bad".to_owned())));
    }

    #[tokio::test]
    async fn test_reject_creates_rejected_entry() {
        let registry = registry();

        assert!(registry.reject("req-1", "bad".to_owned()).unwrap());
        assert!(registry.is_rejected(&"req-1"));
        assert_eq!(
            registry.get("req-1").await,
            Err(Rejection::Reason("bad".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_settled_entries_reject_further_settlement() {
        let registry = registry();

        let _future = registry.get("req-1");
        registry.reject("req-1", "bad".to_owned()).unwrap();

        assert!(registry.resolve("req-1", 1).is_err());
        assert!(registry.reject("req-1", "again".to_owned()).is_err());
    }

    #[tokio::test]
    async fn test_failed_adoption_rejects_entry() {
        let registry = registry();

        registry
            .resolve_with("req-1", async { Err("upstream failed".to_owned()) })
            .unwrap();

        assert_eq!(
            registry.get("req-1").await,
            Err(Rejection::Reason("upstream failed".to_owned()))
        );
        assert!(registry.is_rejected(&"req-1"));
    }

    #[tokio::test]
    async fn test_get_returns_same_future_for_existing_key() {
        let registry = registry();

        let first = registry.get("req-1");
        let second = registry.get("req-1");
        registry.resolve("req-1", 3).unwrap();

        assert_eq!(first.await, Ok(3));
        assert_eq!(second.await, Ok(3));
    }

    #[tokio::test]
    async fn test_reject_all_skips_adopting_entries() {
        let registry = registry();

        let first = registry.get("a");
        let second = registry.get("b");
        registry.resolve_with("c", std::future::pending()).unwrap();

        assert_eq!(registry.reject_all("shutdown".to_owned()), 2);

        assert_eq!(first.await, Err(Rejection::Reason("shutdown".to_owned())));
        assert_eq!(second.await, Err(Rejection::Reason("shutdown".to_owned())));
        assert!(registry.is_rejected(&"a"));
        assert!(registry.is_rejected(&"b"));
        assert!(registry.is_pending(&"c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_all_does_not_resurrect_concurrently_deleted_keys() {
        let registry = FutureRegistry::<String, i32, String>::new(Config::default());

        // Whichever way the two operations interleave, the entry exists until
        // `delete` removes it, and a bulk rejection must never re-create it.
        for round in 0..100 {
            let key = format!("req-{round}");
            let _future = registry.get(key.clone());

            let rejector = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.reject_all("shutdown".to_owned()) })
            };
            let deleter = {
                let registry = registry.clone();
                let key = key.clone();
                tokio::spawn(async move { registry.delete(&key) })
            };

            rejector.await.unwrap();
            assert!(deleter.await.unwrap());
            assert!(
                !registry.has(&key),
                "a deleted key must stay deleted across reject_all"
            );
        }
    }

    #[tokio::test]
    async fn test_delete_fails_pending_placeholder() {
        let registry = registry();

        let future = registry.get("req-1");
        assert!(registry.delete(&"req-1"));
        assert!(!registry.has(&"req-1"));

        assert_eq!(future.await, Err(Rejection::Deleted));
        assert!(!registry.delete(&"req-1"));
    }

    #[tokio::test]
    async fn test_delete_leaves_adoption_unobserved() {
        let registry = registry();

        let (sender, receiver) = oneshot::channel();
        registry
            .resolve_with("req-1", async move { receiver.await.expect("sender kept") })
            .unwrap();
        let future = registry.get("req-1");

        assert!(registry.delete(&"req-1"));
        assert!(!registry.has(&"req-1"));

        // The adoption keeps running and still settles the handed-out future.
        sender.send(Ok(9)).unwrap();
        assert_eq!(future.await, Ok(9));
        assert!(!registry.has(&"req-1"));
    }

    #[tokio::test]
    async fn test_clear_deletes_everything() {
        let registry = registry();

        let placeholder = registry.get("a");
        registry.resolve("b", 1).unwrap();
        registry.reject("c", "bad".to_owned()).unwrap();
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.clear(), 3);
        for key in ["a", "b", "c"] {
            assert!(!registry.has(&key));
        }
        assert_eq!(placeholder.await, Err(Rejection::Deleted));
        assert_eq!(registry.clear(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entries_are_evicted_after_timeout() {
        let registry = registry_with_timeout(50);

        registry.resolve("req-1", 1).unwrap();
        assert!(registry.has(&"req-1"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.has(&"req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholders_join_the_eviction_clock_when_settled() {
        let registry = registry_with_timeout(50);

        let future = registry.get("req-1");
        tokio::time::sleep(Duration::from_millis(70)).await;
        // Unsettled placeholders are not on the eviction clock.
        assert!(registry.has(&"req-1"));

        registry.resolve("req-1", 2).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.has(&"req-1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.has(&"req-1"));

        // Eviction does not unsettle futures that were already handed out.
        assert_eq!(future.await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_the_eviction_timer() {
        let registry = registry_with_timeout(50);

        registry.resolve("req-1", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(registry.delete(&"req-1"));
        assert!(registry.resolve("req-1", 2).unwrap());

        // The original timer would have fired by now; the entry must survive
        // until its own timeout elapses.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.has(&"req-1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!registry.has(&"req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eviction_without_timeout() {
        let registry = registry();

        registry.resolve("req-1", 1).unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(registry.has(&"req-1"));
    }
}
