//! Query Entry
//!
//! The addressable unit of cached state: a finite-state machine over
//! `status × fetch_status`, the current data/error, at most one in-flight
//! retryer (concurrent fetch requests join it), a non-owning observer list,
//! and a gc timer armed only while unobserved.
//!
//! Every fetch start and every cancellation advances a generation counter;
//! a settling retryer whose generation is no longer current applies nothing,
//! which gives last-request-wins ordering for a single entry.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{FetchError, QueryError, Result};
use crate::key::{KeyHash, QueryKey};
use crate::notify::NotifyScheduler;
use crate::options::{FetchContext, GcTime, ResolvedQueryOptions, StaleTime};
use crate::query::cache::{CacheShared, QueryCacheEvent};
use crate::query::observer::QueryObserver;
use crate::query::state::{FetchStatus, QueryState, QueryStatus};
use crate::retry::{self, FetchOutcome};
use crate::signals::StatusSignal;
use crate::util::current_timestamp_ms;

// == Query ==
/// One cache entry, shared behind `Arc` between the cache, observers and
/// in-flight fetch tasks. All mutation happens through short-lived lock
/// sections on the inner state; notification is published after the lock is
/// released.
pub struct Query {
    key: QueryKey,
    hash: KeyHash,
    cache: Weak<CacheShared>,
    notify: Arc<NotifyScheduler>,
    online: StatusSignal,
    inner: Mutex<QueryInner>,
}

struct QueryInner {
    state: QueryState,
    options: ResolvedQueryOptions,
    /// Non-owning references; the cache owns the entry, consumers own the
    /// observers
    observers: Vec<Weak<QueryObserver>>,
    active: Option<ActiveFetch>,
    /// Incremented on every fetch start and every cancel
    generation: u64,
    gc_task: Option<JoinHandle<()>>,
}

struct ActiveFetch {
    generation: u64,
    cancel: CancellationToken,
    done: broadcast::Sender<FetchOutcome>,
}

impl Query {
    // == Constructor ==
    /// Builds a new entry. The gc timer is armed immediately so unobserved
    /// prefetches expire on schedule.
    pub(crate) fn new(
        cache: Weak<CacheShared>,
        notify: Arc<NotifyScheduler>,
        online: StatusSignal,
        options: ResolvedQueryOptions,
    ) -> Arc<Self> {
        let state = match &options.initial_data {
            Some(data) => QueryState::with_initial_data(data.clone()),
            None => QueryState::initial(),
        };
        let query = Arc::new(Self {
            key: options.key.clone(),
            hash: options.hash.clone(),
            cache,
            notify,
            online,
            inner: Mutex::new(QueryInner {
                state,
                options,
                observers: Vec::new(),
                active: None,
                generation: 0,
                gc_task: None,
            }),
        });
        query.schedule_gc();
        query
    }

    // == Accessors ==
    /// The structured key identifying this entry.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The canonical hash the cache indexes this entry by.
    pub fn hash(&self) -> &KeyHash {
        &self.hash
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.lock().state.clone()
    }

    /// Number of currently attached observers.
    pub fn observer_count(&self) -> usize {
        self.inner
            .lock()
            .observers
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Effective options snapshot (last merged writer wins).
    pub(crate) fn options(&self) -> ResolvedQueryOptions {
        self.inner.lock().options.clone()
    }

    // == Staleness ==
    /// Stale iff invalidated, never successfully settled, or past the
    /// entry's effective freshness horizon.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.inner.lock().options.stale_time;
        self.is_stale_with(stale_time)
    }

    /// Staleness under an observer-supplied horizon.
    pub(crate) fn is_stale_with(&self, stale_time: StaleTime) -> bool {
        let inner = self.inner.lock();
        if inner.state.status != QueryStatus::Success {
            return true;
        }
        if inner.state.is_invalidated {
            return true;
        }
        stale_time.is_stale(inner.state.data_updated_at, current_timestamp_ms())
    }

    // == Option Merging ==
    /// Re-merges options into the entry's effective policy; fields that are
    /// per-observer keep their latest value too (last writer wins).
    pub(crate) fn merge_options(&self, options: ResolvedQueryOptions) {
        let mut inner = self.inner.lock();
        if options.fetcher.is_some() {
            inner.options.fetcher = options.fetcher;
        }
        inner.options.enabled = options.enabled;
        inner.options.stale_time = options.stale_time;
        inner.options.gc_time = options.gc_time;
        inner.options.retry = options.retry;
        inner.options.refetch_on_focus = options.refetch_on_focus;
        inner.options.refetch_on_reconnect = options.refetch_on_reconnect;
        inner.options.page_param = options.page_param;
    }

    // == Fetch ==
    /// Requests a fetch. If a retryer is already attached the caller joins
    /// its outcome; otherwise a new retryer-wrapped operation is started.
    ///
    /// Fails fast on disabled or fetcherless entries; those are programmer
    /// misuse, not retryable conditions.
    pub(crate) fn fetch(self: &Arc<Self>) -> Result<broadcast::Receiver<FetchOutcome>> {
        let (generation, cancel, fetcher, retry, page_param, done_tx, done_rx) = {
            let mut inner = self.inner.lock();
            if let Some(active) = &inner.active {
                trace!(hash = %self.hash, "joining in-flight fetch");
                return Ok(active.done.subscribe());
            }
            if !inner.options.enabled {
                return Err(QueryError::Disabled(self.hash.to_string()));
            }
            let Some(fetcher) = inner.options.fetcher.clone() else {
                return Err(QueryError::MissingFetcher(self.hash.to_string()));
            };

            inner.generation += 1;
            let generation = inner.generation;
            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = broadcast::channel(1);
            inner.active = Some(ActiveFetch {
                generation,
                cancel: cancel.clone(),
                done: done_tx.clone(),
            });
            inner.state.fetch_status = FetchStatus::Fetching;
            inner.state.failure_count = 0;
            inner.state.failure_reason = None;

            (
                generation,
                cancel,
                fetcher,
                inner.options.retry.clone(),
                inner.options.page_param.clone(),
                done_tx,
                done_rx,
            )
        };

        debug!(hash = %self.hash, generation, "starting fetch");
        self.publish_update();

        let query = Arc::clone(self);
        let key = self.key.clone();
        let online_rx = self.online.subscribe();
        tokio::spawn(async move {
            let op_cancel = cancel.clone();
            let operation: retry::Attempt = Box::new(move || {
                fetcher(FetchContext {
                    key: key.clone(),
                    cancel: op_cancel.clone(),
                    page_param: page_param.clone(),
                })
            });

            let on_failure_query = Arc::clone(&query);
            let on_pause_query = Arc::clone(&query);
            let outcome = retry::execute(
                operation,
                retry,
                cancel,
                online_rx,
                move |count, error| on_failure_query.on_attempt_failure(generation, count, error),
                move |paused| on_pause_query.on_pause(generation, paused),
            )
            .await;

            query.settle(generation, outcome.clone());
            let _ = done_tx.send(outcome);
        });

        Ok(done_rx)
    }

    /// Background refetch: cancels any in-flight fetch (superseding it) and
    /// starts a new one. A missing fetcher makes this a no-op, since
    /// background triggers have nowhere to report an error.
    pub(crate) fn refetch(self: &Arc<Self>) {
        {
            let inner = self.inner.lock();
            if inner.options.fetcher.is_none() || !inner.options.enabled {
                return;
            }
        }
        self.cancel_silent();
        let _ = self.fetch();
    }

    // == Settlement ==
    fn settle(self: &Arc<Self>, generation: u64, outcome: FetchOutcome) {
        {
            let mut inner = self.inner.lock();
            if inner.active.as_ref().map(|a| a.generation) != Some(generation) {
                trace!(hash = %self.hash, generation, "discarding stale settlement");
                return;
            }
            inner.active = None;
            inner.state.fetch_status = FetchStatus::Idle;
            match outcome {
                FetchOutcome::Success(data) => {
                    inner.state.status = QueryStatus::Success;
                    inner.state.data = Some(data);
                    inner.state.error = None;
                    inner.state.data_updated_at = current_timestamp_ms();
                    inner.state.failure_count = 0;
                    inner.state.failure_reason = None;
                    inner.state.is_invalidated = false;
                }
                FetchOutcome::Failure(error) => {
                    // Error after success keeps previous data visible
                    inner.state.status = QueryStatus::Error;
                    inner.state.error = Some(error);
                    inner.state.error_updated_at = current_timestamp_ms();
                }
                FetchOutcome::Cancelled => {
                    // Neutral: status, data and error are untouched
                }
            }
        }
        debug!(hash = %self.hash, generation, "fetch settled");
        self.publish_update();
    }

    fn on_attempt_failure(self: &Arc<Self>, generation: u64, count: u32, error: &FetchError) {
        {
            let mut inner = self.inner.lock();
            if inner.active.as_ref().map(|a| a.generation) != Some(generation) {
                return;
            }
            inner.state.failure_count = count;
            inner.state.failure_reason = Some(error.clone());
        }
        self.publish_update();
    }

    fn on_pause(self: &Arc<Self>, generation: u64, paused: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.active.as_ref().map(|a| a.generation) != Some(generation) {
                return;
            }
            inner.state.fetch_status = if paused {
                FetchStatus::Paused
            } else {
                FetchStatus::Fetching
            };
        }
        self.publish_update();
    }

    // == Cancellation ==
    /// Cancels any in-flight fetch and reverts `fetch_status` to idle
    /// without touching status, data or error.
    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.cancel_silent() {
            self.publish_update();
        }
    }

    /// Cancels without publishing; returns whether a fetch was active.
    fn cancel_silent(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(active) = inner.active.take() else {
            return false;
        };
        inner.generation += 1;
        inner.state.fetch_status = FetchStatus::Idle;
        active.cancel.cancel();
        true
    }

    // == Imperative Writes ==
    /// Writes data directly, bypassing the fetch path.
    pub(crate) fn set_data(self: &Arc<Self>, data: Value, updated_at: Option<u64>) {
        {
            let mut inner = self.inner.lock();
            inner.state.status = QueryStatus::Success;
            inner.state.data = Some(data);
            inner.state.error = None;
            inner.state.data_updated_at = updated_at.unwrap_or_else(current_timestamp_ms);
            inner.state.is_invalidated = false;
        }
        self.publish_update();
    }

    /// Writes an error directly, bypassing the fetch path.
    pub(crate) fn set_error(self: &Arc<Self>, error: FetchError) {
        {
            let mut inner = self.inner.lock();
            inner.state.status = QueryStatus::Error;
            inner.state.error = Some(error);
            inner.state.error_updated_at = current_timestamp_ms();
        }
        self.publish_update();
    }

    /// Applies a restored snapshot with its original timestamps, bypassing
    /// the fetch path.
    pub(crate) fn restore(
        self: &Arc<Self>,
        status: QueryStatus,
        data: Option<Value>,
        error: Option<FetchError>,
        data_updated_at: u64,
        error_updated_at: u64,
    ) {
        {
            let mut inner = self.inner.lock();
            inner.state.status = status;
            inner.state.data = data;
            inner.state.error = error;
            inner.state.data_updated_at = data_updated_at;
            inner.state.error_updated_at = error_updated_at;
            inner.state.is_invalidated = false;
        }
        self.publish_update();
    }

    /// Marks the entry stale until the next successful settlement.
    pub(crate) fn invalidate(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_invalidated {
                return;
            }
            inner.state.is_invalidated = true;
        }
        self.publish_update();
    }

    /// Restores the initial state (including configured initial data),
    /// cancelling any in-flight fetch.
    pub(crate) fn reset(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if let Some(active) = inner.active.take() {
                inner.generation += 1;
                active.cancel.cancel();
            }
            inner.state = match &inner.options.initial_data {
                Some(data) => QueryState::with_initial_data(data.clone()),
                None => QueryState::initial(),
            };
        }
        self.publish_update();
    }

    // == Observer Attachment ==
    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<QueryObserver>) {
        {
            let mut inner = self.inner.lock();
            inner.observers.retain(|w| w.strong_count() > 0);
            inner.observers.push(Arc::downgrade(observer));
            // First observer disarms any pending eviction
            if let Some(task) = inner.gc_task.take() {
                task.abort();
            }
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(&QueryCacheEvent::ObserverAdded(Arc::clone(self)));
        }
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, observer_id: u64) {
        let now_empty = {
            let mut inner = self.inner.lock();
            inner
                .observers
                .retain(|w| w.upgrade().is_some_and(|o| o.id() != observer_id));
            inner.observers.is_empty()
        };
        if now_empty {
            self.schedule_gc();
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(&QueryCacheEvent::ObserverRemoved(Arc::clone(self)));
        }
    }

    /// Currently attached observers, strongest-reference snapshot.
    pub(crate) fn observers(&self) -> Vec<Arc<QueryObserver>> {
        self.inner
            .lock()
            .observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    // == Garbage Collection ==
    /// Arms the eviction timer. Disarmed whenever an observer attaches;
    /// `GcTime::Never` leaves the entry resident indefinitely.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.gc_task.take() {
            task.abort();
        }
        let GcTime::After(delay) = inner.options.gc_time else {
            return;
        };
        // No runtime means no timers; gc resumes when rebuilt inside one
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        inner.gc_task = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(query) = weak.upgrade() {
                query.gc_if_unobserved();
            }
        }));
    }

    fn gc_if_unobserved(self: &Arc<Self>) {
        if self.observer_count() > 0 {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            debug!(hash = %self.hash, "garbage collecting unobserved query");
            cache.remove(self);
        }
    }

    /// Tears the entry down on removal: cancels any in-flight fetch and the
    /// gc timer.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active.take() {
            inner.generation += 1;
            inner.state.fetch_status = FetchStatus::Idle;
            active.cancel.cancel();
        }
        if let Some(task) = inner.gc_task.take() {
            task.abort();
        }
    }

    // == Notification ==
    /// Emits an `Updated` cache event and schedules a delivery pass for
    /// every attached observer through the batching scheduler.
    fn publish_update(self: &Arc<Self>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(&QueryCacheEvent::Updated(Arc::clone(self)));
        }
        let observers = self.observers();
        self.notify.batch(|| {
            for observer in observers {
                let id = observer.id();
                self.notify
                    .schedule(id, Box::new(move || observer.on_query_update()));
            }
        });
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Query")
            .field("hash", &self.hash)
            .field("status", &inner.state.status)
            .field("fetch_status", &inner.state.fetch_status)
            .field("observers", &inner.observers.len())
            .finish_non_exhaustive()
    }
}
