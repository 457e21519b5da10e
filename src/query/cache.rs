//! Query Cache
//!
//! The keyed registry of query entries: get-or-create with option merging,
//! lookup by key or filter, removal, and a subscribable lifecycle event
//! stream consumed by the client, by tests and by external inspectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::filters::QueryFilters;
use crate::key::{KeyHash, QueryKey};
use crate::notify::NotifyScheduler;
use crate::options::ResolvedQueryOptions;
use crate::query::entry::Query;
use crate::signals::StatusSignal;

// == Lifecycle Events ==
/// Cache lifecycle event stream, delivered synchronously to subscribers.
#[derive(Clone, Debug)]
pub enum QueryCacheEvent {
    /// A new entry was created
    Added(Arc<Query>),
    /// An entry was removed (explicitly or by gc)
    Removed(Arc<Query>),
    /// An entry's state changed
    Updated(Arc<Query>),
    /// An observer attached to an entry
    ObserverAdded(Arc<Query>),
    /// An observer detached from an entry
    ObserverRemoved(Arc<Query>),
}

type EventListener = Arc<dyn Fn(&QueryCacheEvent) + Send + Sync>;

// == Shared Cache State ==
/// Shared interior of the cache; entries hold a weak reference back to it
/// for event emission and gc-driven self-removal.
pub(crate) struct CacheShared {
    queries: Mutex<HashMap<KeyHash, Arc<Query>>>,
    listeners: Mutex<Vec<(u64, EventListener)>>,
    next_listener_id: AtomicU64,
    pub(crate) notify: Arc<NotifyScheduler>,
    pub(crate) online: StatusSignal,
}

impl CacheShared {
    /// Delivers an event to every subscriber. Listeners are invoked outside
    /// the listener lock so they may subscribe/unsubscribe reentrantly.
    pub(crate) fn emit(&self, event: &QueryCacheEvent) {
        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Removes an entry if it is still the resident instance for its hash.
    pub(crate) fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut queries = self.queries.lock();
            match queries.get(query.hash()) {
                Some(current) if Arc::ptr_eq(current, query) => queries.remove(query.hash()),
                _ => None,
            }
        };
        if let Some(query) = removed {
            query.destroy();
            debug!(hash = %query.hash(), "query removed from cache");
            self.emit(&QueryCacheEvent::Removed(query));
        }
    }
}

// == Query Cache ==
/// Keyed registry of [`Query`] entries.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl QueryCache {
    /// Creates an empty cache wired to the given scheduler and online
    /// signal (both shared with the owning client).
    pub(crate) fn new(notify: Arc<NotifyScheduler>, online: StatusSignal) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                queries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                notify,
                online,
            }),
        }
    }

    // == Lookup ==
    /// Finds the entry for an exact key, if resident.
    pub fn find(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.shared.queries.lock().get(&key.hash()).cloned()
    }

    /// Finds the entry for a precomputed hash.
    pub fn find_by_hash(&self, hash: &KeyHash) -> Option<Arc<Query>> {
        self.shared.queries.lock().get(hash).cloned()
    }

    /// All entries matching the filters.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.all().into_iter().filter(|q| filters.matches(q)).collect()
    }

    /// Snapshot of every resident entry.
    pub fn all(&self) -> Vec<Arc<Query>> {
        self.shared.queries.lock().values().cloned().collect()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.shared.queries.lock().len()
    }

    /// Returns true if no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.shared.queries.lock().is_empty()
    }

    // == Build ==
    /// Get-or-create: returns the resident entry for the options' key,
    /// merging the options into its effective policy, or creates (and
    /// announces) a new one.
    pub(crate) fn build(&self, options: ResolvedQueryOptions) -> Arc<Query> {
        let existing = {
            let queries = self.shared.queries.lock();
            queries.get(&options.hash).cloned()
        };
        if let Some(query) = existing {
            query.merge_options(options);
            return query;
        }

        let query = Query::new(
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.notify),
            self.shared.online.clone(),
            options,
        );
        let inserted = {
            let mut queries = self.shared.queries.lock();
            match queries.get(query.hash()) {
                // Lost a build race; merge into the winner instead
                Some(winner) => {
                    let winner = Arc::clone(winner);
                    winner.merge_options(query.options());
                    query.destroy();
                    return winner;
                }
                None => {
                    queries.insert(query.hash().clone(), Arc::clone(&query));
                    Arc::clone(&query)
                }
            }
        };
        debug!(hash = %inserted.hash(), "query added to cache");
        self.shared.emit(&QueryCacheEvent::Added(Arc::clone(&inserted)));
        inserted
    }

    // == Removal ==
    /// Removes an entry, cancelling any in-flight fetch.
    pub fn remove(&self, query: &Arc<Query>) {
        self.shared.remove(query);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let drained: Vec<Arc<Query>> = {
            let mut queries = self.shared.queries.lock();
            queries.drain().map(|(_, q)| q).collect()
        };
        for query in drained {
            query.destroy();
            self.shared.emit(&QueryCacheEvent::Removed(query));
        }
    }

    // == Subscription ==
    /// Subscribes to the lifecycle event stream; dropping the returned
    /// guard unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static,
    ) -> CacheSubscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        CacheSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }
}

// == Cache Subscription ==
/// RAII guard for a cache event subscription.
pub struct CacheSubscription {
    shared: Weak<CacheShared>,
    id: u64,
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
