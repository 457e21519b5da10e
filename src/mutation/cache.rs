//! Mutation Cache
//!
//! Registry of in-flight and recently settled mutations. Unlike the query
//! cache it never reuses entries: `build` always creates a fresh mutation,
//! and retention exists only for introspection (live counts, devtools)
//! until gc reclaims settled, unobserved instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::filters::MutationFilters;
use crate::mutation::entry::{Mutation, MutationStatus};
use crate::notify::NotifyScheduler;
use crate::options::ResolvedMutationOptions;
use crate::signals::StatusSignal;

// == Lifecycle Events ==
/// Mutation cache lifecycle event stream.
#[derive(Clone, Debug)]
pub enum MutationCacheEvent {
    Added(Arc<Mutation>),
    Removed(Arc<Mutation>),
    Updated(Arc<Mutation>),
    ObserverAdded(Arc<Mutation>),
    ObserverRemoved(Arc<Mutation>),
}

type EventListener = Arc<dyn Fn(&MutationCacheEvent) + Send + Sync>;

// == Shared Cache State ==
pub(crate) struct MutationCacheShared {
    mutations: Mutex<HashMap<u64, Arc<Mutation>>>,
    listeners: Mutex<Vec<(u64, EventListener)>>,
    next_mutation_id: AtomicU64,
    next_listener_id: AtomicU64,
    pub(crate) notify: Arc<NotifyScheduler>,
    pub(crate) online: StatusSignal,
}

impl MutationCacheShared {
    pub(crate) fn emit(&self, event: &MutationCacheEvent) {
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

    pub(crate) fn remove(&self, mutation: &Arc<Mutation>) {
        let removed = self.mutations.lock().remove(&mutation.id());
        if let Some(mutation) = removed {
            mutation.destroy();
            debug!(mutation = mutation.id(), "mutation removed from cache");
            self.emit(&MutationCacheEvent::Removed(mutation));
        }
    }
}

// == Mutation Cache ==
/// Registry of [`Mutation`] instances.
#[derive(Clone)]
pub struct MutationCache {
    shared: Arc<MutationCacheShared>,
}

impl MutationCache {
    pub(crate) fn new(notify: Arc<NotifyScheduler>, online: StatusSignal) -> Self {
        Self {
            shared: Arc::new(MutationCacheShared {
                mutations: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_mutation_id: AtomicU64::new(1),
                next_listener_id: AtomicU64::new(1),
                notify,
                online,
            }),
        }
    }

    // == Build ==
    /// Always creates a fresh mutation; there is no keyed reuse on the
    /// write path.
    pub(crate) fn build(&self, options: ResolvedMutationOptions) -> Arc<Mutation> {
        let id = self.shared.next_mutation_id.fetch_add(1, Ordering::Relaxed);
        let mutation = Mutation::new(
            id,
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.notify),
            self.shared.online.clone(),
            options,
        );
        self.shared
            .mutations
            .lock()
            .insert(id, Arc::clone(&mutation));
        debug!(mutation = id, "mutation added to cache");
        self.shared.emit(&MutationCacheEvent::Added(Arc::clone(&mutation)));
        mutation
    }

    // == Lookup ==
    /// All retained mutations matching the filters.
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.all().into_iter().filter(|m| filters.matches(m)).collect()
    }

    /// Snapshot of every retained mutation.
    pub fn all(&self) -> Vec<Arc<Mutation>> {
        self.shared.mutations.lock().values().cloned().collect()
    }

    /// Number of retained mutations.
    pub fn len(&self) -> usize {
        self.shared.mutations.lock().len()
    }

    /// Returns true if no mutations are retained.
    pub fn is_empty(&self) -> bool {
        self.shared.mutations.lock().is_empty()
    }

    /// Live count of currently executing mutations.
    pub fn is_mutating(&self) -> usize {
        self.all()
            .iter()
            .filter(|m| m.state().status == MutationStatus::Pending)
            .count()
    }

    // == Removal ==
    /// Removes one mutation, cancelling it if still running.
    pub fn remove(&self, mutation: &Arc<Mutation>) {
        self.shared.remove(mutation);
    }

    /// Removes every retained mutation.
    pub fn clear(&self) {
        let drained: Vec<Arc<Mutation>> = {
            let mut mutations = self.shared.mutations.lock();
            mutations.drain().map(|(_, m)| m).collect()
        };
        for mutation in drained {
            mutation.destroy();
            self.shared.emit(&MutationCacheEvent::Removed(mutation));
        }
    }

    // == Subscription ==
    /// Subscribes to the lifecycle event stream; dropping the guard
    /// unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> MutationCacheSubscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        MutationCacheSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }
}

// == Cache Subscription ==
/// RAII guard for a mutation cache event subscription.
pub struct MutationCacheSubscription {
    shared: Weak<MutationCacheShared>,
    id: u64,
}

impl Drop for MutationCacheSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
