//! Query Client
//!
//! The facade wiring the caches, the retry machinery, the notify scheduler
//! and the focus/online signals together. Observers go through it to build
//! and fetch entries; application code uses its imperative operations
//! (fetch, invalidate, set/get data, prefetch, bulk filters).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{QueryError, Result};
use crate::filters::QueryFilters;
use crate::key::QueryKey;
use crate::mutation::cache::MutationCache;
use crate::notify::NotifyScheduler;
use crate::options::{MutationOptions, QueryOptions};
use crate::persist::{self, DehydrateOptions, DehydratedState};
use crate::query::cache::QueryCache;
use crate::query::state::{FetchStatus, QueryState, QueryStatus};
use crate::signals::StatusSignal;

// == Query Client ==
/// Cheaply cloneable handle to one cache universe. Requires a tokio runtime
/// for its fetch, gc, interval and signal tasks.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    notify: Arc<NotifyScheduler>,
    focus: StatusSignal,
    online: StatusSignal,
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    signal_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryClient {
    // == Constructors ==
    /// Creates a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a client with explicit configuration and injected signal
    /// sources left at their defaults (focused, online).
    pub fn with_config(config: ClientConfig) -> Self {
        let notify = Arc::new(NotifyScheduler::new());
        let focus = StatusSignal::new(true);
        let online = StatusSignal::new(true);
        let query_cache = QueryCache::new(Arc::clone(&notify), online.clone());
        let mutation_cache = MutationCache::new(Arc::clone(&notify), online.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                notify,
                focus,
                online,
                query_cache,
                mutation_cache,
                signal_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // == Accessors ==
    /// The client's configuration (defaults and hydration buster).
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The read-path cache, for direct introspection.
    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    /// The write-path cache, for direct introspection.
    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// The "window has focus" signal source.
    pub fn focus_signal(&self) -> &StatusSignal {
        &self.inner.focus
    }

    /// The "network reachable" signal source.
    pub fn online_signal(&self) -> &StatusSignal {
        &self.inner.online
    }

    pub(crate) fn notify(&self) -> &Arc<NotifyScheduler> {
        &self.inner.notify
    }

    // == Signal Wiring ==
    /// Starts listening to the focus/online signals; stale, observed
    /// entries refetch when either flips to true. Idempotent.
    pub fn mount(&self) {
        let mut tasks = self.inner.signal_tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!("mounting query client signal listeners");
        tasks.push(spawn_signal_task(
            Arc::downgrade(&self.inner),
            self.inner.focus.clone(),
            RefetchTrigger::Focus,
        ));
        tasks.push(spawn_signal_task(
            Arc::downgrade(&self.inner),
            self.inner.online.clone(),
            RefetchTrigger::Reconnect,
        ));
    }

    /// Stops the signal listeners started by `mount`.
    pub fn unmount(&self) {
        for task in self.inner.signal_tasks.lock().drain(..) {
            task.abort();
        }
    }

    // == Fetch ==
    /// Builds (or joins) the entry's fetch and returns the settled outcome.
    /// Fresh data short-circuits without touching the network.
    pub async fn fetch_query(&self, options: QueryOptions) -> Result<Value> {
        let resolved = self.config().resolve_query_options(options);
        if !resolved.enabled {
            return Err(QueryError::Disabled(resolved.hash.to_string()));
        }
        let stale_time = resolved.stale_time;
        let query = self.query_cache().build(resolved);

        let state = query.state();
        if state.status == QueryStatus::Success && !query.is_stale_with(stale_time) {
            if let Some(data) = state.data {
                return Ok(data);
            }
        }

        let mut outcome_rx = query.fetch()?;
        match outcome_rx.recv().await {
            Ok(outcome) => outcome.into_result(),
            // Sender dropped without settling: the entry was torn down
            Err(_) => Err(QueryError::Cancelled),
        }
    }

    /// Like `fetch_query` but the outcome is deliberately ignored; used to
    /// warm the cache ahead of a mount.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        if let Err(error) = self.fetch_query(options).await {
            debug!(%error, "prefetch settled with error");
        }
    }

    // == Batching ==
    /// Groups a synchronous unit of cache writes so every subscriber
    /// receives at most one coalesced delivery, carrying the final state,
    /// when the outermost scope closes. Imperative writes and bulk
    /// operations inside the closure all share the scope; scopes nest.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.notify.batch(f)
    }

    // == Imperative Reads/Writes ==
    /// Reads the entry's data without fetching.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.query_cache().find(key).and_then(|q| q.state().data)
    }

    /// Reads the entry's full state without fetching.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.query_cache().find(key).map(|q| q.state())
    }

    /// Writes data directly, creating the entry if absent. The updater
    /// receives `None` when no entry (or no data) exists yet. Multiple
    /// writes wrapped in [`batch`](Self::batch) deliver once.
    pub fn set_query_data(
        &self,
        key: QueryKey,
        updater: impl FnOnce(Option<Value>) -> Value,
    ) -> Value {
        let query = match self.query_cache().find(&key) {
            Some(query) => query,
            None => {
                let resolved = self.config().resolve_query_options(QueryOptions::new(key));
                self.query_cache().build(resolved)
            }
        };
        let next = updater(query.state().data);
        query.set_data(next.clone(), None);
        next
    }

    // == Bulk Operations ==
    /// Marks matching entries stale; observed entries refetch in the
    /// background, unobserved ones only flip stale for their next access.
    pub fn invalidate_queries(&self, filters: &QueryFilters) {
        let queries = self.query_cache().find_all(filters);
        debug!(count = queries.len(), "invalidating queries");
        self.inner.notify.batch(|| {
            for query in &queries {
                query.invalidate();
                if query.observer_count() > 0 {
                    query.refetch();
                }
            }
        });
    }

    /// Imperatively refetches matching entries regardless of staleness.
    pub fn refetch_queries(&self, filters: &QueryFilters) {
        let queries = self.query_cache().find_all(filters);
        self.inner.notify.batch(|| {
            for query in &queries {
                query.refetch();
            }
        });
    }

    /// Cancels in-flight fetches on matching entries.
    pub fn cancel_queries(&self, filters: &QueryFilters) {
        let queries = self.query_cache().find_all(filters);
        self.inner.notify.batch(|| {
            for query in &queries {
                query.cancel();
            }
        });
    }

    /// Removes matching entries outright.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        for query in self.query_cache().find_all(filters) {
            self.query_cache().remove(&query);
        }
    }

    /// Resets matching entries to their initial state (including configured
    /// initial data); observed entries refetch afterwards.
    pub fn reset_queries(&self, filters: &QueryFilters) {
        let queries = self.query_cache().find_all(filters);
        self.inner.notify.batch(|| {
            for query in &queries {
                query.reset();
                if query.observer_count() > 0 {
                    query.refetch();
                }
            }
        });
    }

    /// Removes every entry from both caches.
    pub fn clear(&self) {
        self.query_cache().clear();
        self.mutation_cache().clear();
    }

    // == Live Counts ==
    /// Number of matching entries with a fetch currently running.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        self.query_cache()
            .find_all(filters)
            .iter()
            .filter(|q| q.state().fetch_status == FetchStatus::Fetching)
            .count()
    }

    /// Number of mutations currently executing.
    pub fn is_mutating(&self) -> usize {
        self.mutation_cache().is_mutating()
    }

    // == Mutations ==
    /// One-shot write: builds a fresh mutation from `options`, executes it,
    /// and returns the settled outcome.
    pub async fn execute_mutation(&self, options: MutationOptions, variables: Value) -> Result<Value> {
        let resolved = self.config().resolve_mutation_options(options);
        let mutation = self.mutation_cache().build(resolved);
        mutation.execute(variables).await
    }

    // == Persistence Boundary ==
    /// Serializes matching entries (default: successful ones) for storage
    /// or cross-process transfer.
    pub fn dehydrate(&self, options: &DehydrateOptions) -> DehydratedState {
        persist::dehydrate(self, options)
    }

    /// Merges a dehydrated snapshot into the cache; newer resident data
    /// wins over the snapshot per entry.
    pub fn hydrate(&self, state: DehydratedState) -> Result<()> {
        persist::hydrate(self, state)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.signal_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

// == Signal-Driven Refetch ==
#[derive(Clone, Copy, Debug)]
enum RefetchTrigger {
    Focus,
    Reconnect,
}

fn spawn_signal_task(
    inner: Weak<ClientInner>,
    signal: StatusSignal,
    trigger: RefetchTrigger,
) -> JoinHandle<()> {
    let mut rx = signal.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if !*rx.borrow_and_update() {
                continue;
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            refetch_for_trigger(&inner, trigger);
        }
    })
}

/// Refetches every entry that is stale under at least one attached
/// observer that opted into this trigger.
fn refetch_for_trigger(inner: &ClientInner, trigger: RefetchTrigger) {
    let queries = inner.query_cache.all();
    debug!(?trigger, "signal-driven refetch sweep");
    inner.notify.batch(|| {
        for query in queries {
            let wants = query.observers().iter().any(|observer| {
                let opted_in = match trigger {
                    RefetchTrigger::Focus => observer.wants_refetch_on_focus(),
                    RefetchTrigger::Reconnect => observer.wants_refetch_on_reconnect(),
                };
                opted_in && observer.is_stale()
            });
            if wants {
                query.refetch();
            }
        }
    });
}
