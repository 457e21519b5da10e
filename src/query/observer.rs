//! Query Observer
//!
//! The per-consumer view over one cache entry. An observer derives an
//! immediately-readable result from the entry's current state, decides when
//! a fetch must be (re)triggered (mount, options change, interval), and
//! exposes a subscribe contract delivering the derived result whenever it
//! changes under structural equality. Framework adapters are glue around
//! `current_result` + `subscribe` + `set_options`.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::client::QueryClient;
use crate::error::{FetchError, QueryError};
use crate::notify::next_subscriber_id;
use crate::options::{QueryOptions, ResolvedQueryOptions};
use crate::query::entry::Query;
use crate::query::state::{FetchStatus, QueryStatus};

type Listener = Arc<dyn Fn(QueryObserverResult) + Send + Sync>;

// == Observer Result ==
/// Render-ready view over one entry's state, after selection and
/// placeholder substitution.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryObserverResult {
    /// Data lifecycle axis
    pub status: QueryStatus,
    /// Activity lifecycle axis
    pub fetch_status: FetchStatus,
    /// Selected data (or placeholder data while a new key loads)
    pub data: Option<Value>,
    /// Error of the last failed settlement
    pub error: Option<FetchError>,
    /// Epoch ms of the last successful settlement
    pub data_updated_at: u64,
    /// Epoch ms of the last failed settlement
    pub error_updated_at: u64,
    /// Failed attempts in the current streak
    pub failure_count: u32,
    /// Most recent failure in the current streak
    pub failure_reason: Option<FetchError>,
    /// Stale under the observer's freshness horizon
    pub is_stale: bool,
    /// True while previous-key data is being shown in place of pending data
    pub is_placeholder_data: bool,
}

impl QueryObserverResult {
    /// No settled data yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Last settlement succeeded (or placeholder data is shown).
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Last settlement failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A retryer is attached and running.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// A retryer is attached but waiting for connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First load: pending with a fetch in flight.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Background refresh: fetching with settled data already present.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    /// Result-typed view for callers integrating with error propagation
    /// upstream: errors are returned rather than carried in-band.
    pub fn try_data(&self) -> crate::error::Result<Option<Value>> {
        match (&self.error, self.status) {
            (Some(error), QueryStatus::Error) => Err(QueryError::Fetch(error.clone())),
            _ => Ok(self.data.clone()),
        }
    }
}

// == Query Observer ==
/// A live subscriber deriving results from one entry.
///
/// Created when a consumer mounts; dropped (through its handle) when the
/// consumer unmounts, detaching from the entry and possibly arming its gc.
pub struct QueryObserver {
    id: u64,
    client: QueryClient,
    inner: Mutex<ObserverInner>,
}

struct ObserverInner {
    options: ResolvedQueryOptions,
    query: Arc<Query>,
    last_result: Option<QueryObserverResult>,
    /// Last real (non-placeholder) data seen, carried across key switches
    previous_data: Option<Value>,
    listener: Option<Listener>,
    subscribed: bool,
    interval_task: Option<JoinHandle<()>>,
}

impl QueryObserver {
    // == Constructor ==
    /// Creates an observer targeting the entry for `options.key`, building
    /// the entry if absent. No fetch is started until `subscribe`.
    pub fn new(client: &QueryClient, options: QueryOptions) -> Arc<Self> {
        let resolved = client.config().resolve_query_options(options);
        let query = client.query_cache().build(resolved.clone());
        Arc::new(Self {
            id: next_subscriber_id(),
            client: client.clone(),
            inner: Mutex::new(ObserverInner {
                options: resolved,
                query,
                last_result: None,
                previous_data: None,
                listener: None,
                subscribed: false,
                interval_task: None,
            }),
        })
    }

    /// Unique observer id, used for notification dedup.
    pub fn id(&self) -> u64 {
        self.id
    }

    // == Optimistic Read ==
    /// Synchronously derives a result from the entry's current state,
    /// without waiting for a notification pass. The first read at mount
    /// time reflects reality immediately.
    pub fn current_result(&self) -> QueryObserverResult {
        let mut inner = self.inner.lock();
        let result = derive_result(&inner.query, &inner.options, inner.previous_data.as_ref());
        inner.last_result = Some(result.clone());
        result
    }

    // == Subscription ==
    /// Attaches to the entry (disarming its gc) and delivers the derived
    /// result to `listener` whenever it changes. Dropping the returned
    /// handle detaches.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(QueryObserverResult) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let (query, should_fetch) = {
            let mut inner = self.inner.lock();
            inner.listener = Some(Arc::new(listener));
            inner.subscribed = true;
            let should_fetch = should_fetch_on_mount(&inner.query, &inner.options);
            (Arc::clone(&inner.query), should_fetch)
        };

        query.add_observer(self);
        if should_fetch {
            trace!(observer = self.id, "fetch on mount");
            let _ = query.fetch();
        }
        self.restart_interval_task();

        ObserverHandle {
            observer: Arc::clone(self),
        }
    }

    fn unsubscribe(self: &Arc<Self>) {
        let (query, interval_task) = {
            let mut inner = self.inner.lock();
            inner.listener = None;
            inner.subscribed = false;
            (Arc::clone(&inner.query), inner.interval_task.take())
        };
        if let Some(task) = interval_task {
            task.abort();
        }
        query.remove_observer(self.id);
    }

    // == Options Change ==
    /// Re-merges options, retargeting to a new entry when the key changed
    /// (detaching from the old one), and re-evaluates whether a fetch must
    /// start now.
    pub fn set_options(self: &Arc<Self>, options: QueryOptions) {
        let resolved = self.client.config().resolve_query_options(options);

        let (old_query, key_changed, subscribed) = {
            let mut inner = self.inner.lock();
            let key_changed = resolved.hash != inner.options.hash;
            let old_query = Arc::clone(&inner.query);
            inner.options = resolved.clone();
            (old_query, key_changed, inner.subscribed)
        };

        let query = if key_changed {
            let new_query = self.client.query_cache().build(resolved);
            {
                let mut inner = self.inner.lock();
                if let Some(data) = old_query.state().data {
                    inner.previous_data = Some(data);
                }
                inner.query = Arc::clone(&new_query);
            }
            if subscribed {
                old_query.remove_observer(self.id);
                new_query.add_observer(self);
            }
            new_query
        } else {
            old_query.merge_options(resolved);
            old_query
        };

        if subscribed {
            let should_fetch = {
                let inner = self.inner.lock();
                should_fetch_on_mount(&query, &inner.options)
            };
            if should_fetch {
                trace!(observer = self.id, "fetch on options change");
                let _ = query.fetch();
            }
            self.restart_interval_task();
        }

        self.on_query_update();
    }

    // == Delivery ==
    /// Recomputes the derived result and, if it changed under structural
    /// equality, delivers it to the subscriber. Invoked through the notify
    /// scheduler.
    pub(crate) fn on_query_update(&self) {
        let (listener, result) = {
            let mut inner = self.inner.lock();
            let state_data = inner.query.state().data;
            if state_data.is_some() {
                inner.previous_data = state_data;
            }
            let result = derive_result(&inner.query, &inner.options, inner.previous_data.as_ref());
            if inner.last_result.as_ref() == Some(&result) {
                return;
            }
            inner.last_result = Some(result.clone());
            (inner.listener.clone(), result)
        };
        if let Some(listener) = listener {
            listener(result);
        }
    }

    // == Trigger Flags ==
    pub(crate) fn wants_refetch_on_focus(&self) -> bool {
        let inner = self.inner.lock();
        inner.options.refetch_on_focus && inner.options.enabled
    }

    pub(crate) fn wants_refetch_on_reconnect(&self) -> bool {
        let inner = self.inner.lock();
        inner.options.refetch_on_reconnect && inner.options.enabled
    }

    /// Stale under this observer's own freshness horizon.
    pub(crate) fn is_stale(&self) -> bool {
        let inner = self.inner.lock();
        inner.query.is_stale_with(inner.options.stale_time)
    }

    // == Interval Refetch ==
    /// (Re)arms the fixed-interval refetch task. The interval skips ticks
    /// while a fetch is already in flight and dies with the observer.
    fn restart_interval_task(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.interval_task.take() {
            task.abort();
        }
        let Some(interval) = inner.options.refetch_interval else {
            return;
        };
        if !inner.options.enabled {
            return;
        }
        let weak: Weak<QueryObserver> = Arc::downgrade(self);
        inner.interval_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(observer) = weak.upgrade() else {
                    break;
                };
                let query = {
                    let inner = observer.inner.lock();
                    if !inner.subscribed || !inner.options.enabled {
                        break;
                    }
                    if inner.query.state().is_active() {
                        continue;
                    }
                    Arc::clone(&inner.query)
                };
                trace!(observer = observer.id, "interval refetch");
                query.refetch();
            }
        }));
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().interval_task.take() {
            task.abort();
        }
    }
}

// == Observer Handle ==
/// RAII subscription guard; dropping it detaches the observer from its
/// entry (arming gc when it was the last one).
pub struct ObserverHandle {
    observer: Arc<QueryObserver>,
}

impl ObserverHandle {
    /// The observer this handle keeps subscribed.
    pub fn observer(&self) -> &Arc<QueryObserver> {
        &self.observer
    }

    /// Explicit unsubscribe; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.observer.unsubscribe();
    }
}

// == Derivation ==
fn should_fetch_on_mount(query: &Arc<Query>, options: &ResolvedQueryOptions) -> bool {
    if !options.enabled || options.fetcher.is_none() {
        return false;
    }
    let state = query.state();
    state.data.is_none() || query.is_stale_with(options.stale_time)
}

fn derive_result(
    query: &Arc<Query>,
    options: &ResolvedQueryOptions,
    previous_data: Option<&Value>,
) -> QueryObserverResult {
    let state = query.state();
    let mut status = state.status;
    let mut data = state.data.clone();
    let mut is_placeholder_data = false;

    if data.is_none() && status == QueryStatus::Pending && options.keep_previous_data {
        if let Some(previous) = previous_data {
            data = Some(previous.clone());
            status = QueryStatus::Success;
            is_placeholder_data = true;
        }
    }

    if let (Some(value), Some(select)) = (&data, &options.select) {
        data = Some(select(value));
    }

    QueryObserverResult {
        status,
        fetch_status: state.fetch_status,
        data,
        error: state.error,
        data_updated_at: state.data_updated_at,
        error_updated_at: state.error_updated_at,
        failure_count: state.failure_count,
        failure_reason: state.failure_reason,
        is_stale: query.is_stale_with(options.stale_time),
        is_placeholder_data,
    }
}
