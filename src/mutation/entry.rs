//! Mutation Entry
//!
//! The write-path counterpart of a query entry. A mutation is not keyed for
//! reuse: every invocation builds a fresh instance (optionally tagged with a
//! key for observation/filtering only), executes exactly once through the
//! same retryer machinery, and is retained by the mutation cache purely for
//! introspection until garbage collection.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{FetchError, QueryError, Result};
use crate::key::QueryKey;
use crate::mutation::cache::{MutationCacheEvent, MutationCacheShared};
use crate::mutation::observer::MutationObserver;
use crate::notify::NotifyScheduler;
use crate::options::{FetchContext, GcTime, ResolvedMutationOptions};
use crate::retry::{self, FetchOutcome};
use crate::signals::StatusSignal;
use crate::util::current_timestamp_ms;

// == Mutation Status ==
/// Lifecycle of one write invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Built but not yet executed
    Idle,
    /// Executing (possibly paused waiting for connectivity)
    Pending,
    /// Settled successfully
    Success,
    /// Settled with an error
    Error,
}

// == Mutation State ==
/// Complete observable state of one mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationState {
    pub status: MutationStatus,
    /// True while the retryer is waiting for connectivity
    pub is_paused: bool,
    /// Present iff settled successfully
    pub data: Option<Value>,
    /// Present iff settled with an error
    pub error: Option<FetchError>,
    /// Variables the mutation was invoked with
    pub variables: Option<Value>,
    pub failure_count: u32,
    pub failure_reason: Option<FetchError>,
    /// Epoch ms of execution start (0 = never started)
    pub submitted_at: u64,
}

impl MutationState {
    fn initial() -> Self {
        Self {
            status: MutationStatus::Idle,
            is_paused: false,
            data: None,
            error: None,
            variables: None,
            failure_count: 0,
            failure_reason: None,
            submitted_at: 0,
        }
    }
}

// == Mutation ==
/// One write invocation, retained for introspection until gc.
pub struct Mutation {
    id: u64,
    key: Option<QueryKey>,
    cache: Weak<MutationCacheShared>,
    notify: Arc<NotifyScheduler>,
    online: StatusSignal,
    inner: Mutex<MutationInner>,
}

struct MutationInner {
    state: MutationState,
    options: ResolvedMutationOptions,
    observers: Vec<Weak<MutationObserver>>,
    cancel: Option<CancellationToken>,
    gc_task: Option<JoinHandle<()>>,
}

impl Mutation {
    /// Builds a new mutation. The gc timer is armed immediately so entries
    /// that never execute (or never gain an observer) still expire.
    pub(crate) fn new(
        id: u64,
        cache: Weak<MutationCacheShared>,
        notify: Arc<NotifyScheduler>,
        online: StatusSignal,
        options: ResolvedMutationOptions,
    ) -> Arc<Self> {
        let mutation = Arc::new(Self {
            id,
            key: options.key.clone(),
            cache,
            notify,
            online,
            inner: Mutex::new(MutationInner {
                state: MutationState::initial(),
                options,
                observers: Vec::new(),
                cancel: None,
                gc_task: None,
            }),
        });
        mutation.schedule_gc();
        mutation
    }

    // == Accessors ==
    /// Cache-assigned identity (mutations are not keyed for lookup).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Optional tag used for filtering.
    pub fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState {
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

    // == Execution ==
    /// Runs the write exactly once (no dedup): concurrent invocations are a
    /// caller decision, expressed by building separate mutations.
    pub(crate) async fn execute(self: &Arc<Self>, variables: Value) -> Result<Value> {
        let (mutation_fn, retry, cancel) = {
            let mut inner = self.inner.lock();
            let Some(mutation_fn) = inner.options.mutation_fn.clone() else {
                return Err(QueryError::MissingFetcher(format!("mutation {}", self.id)));
            };
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            inner.state.status = MutationStatus::Pending;
            inner.state.variables = Some(variables.clone());
            inner.state.submitted_at = current_timestamp_ms();
            inner.state.failure_count = 0;
            inner.state.failure_reason = None;
            (mutation_fn, inner.options.retry.clone(), cancel)
        };

        debug!(mutation = self.id, "executing mutation");
        self.publish_update();

        let op_cancel = cancel.clone();
        let vars = variables.clone();
        let key = self.key.clone().unwrap_or_default();
        let operation: retry::Attempt = Box::new(move || {
            mutation_fn(
                vars.clone(),
                FetchContext {
                    key: key.clone(),
                    cancel: op_cancel.clone(),
                    page_param: None,
                },
            )
        });

        let on_failure = Arc::clone(self);
        let on_pause = Arc::clone(self);
        let outcome = retry::execute(
            operation,
            retry,
            cancel,
            self.online.subscribe(),
            move |count, error| on_failure.on_attempt_failure(count, error),
            move |paused| on_pause.on_pause(paused),
        )
        .await;

        self.settle(outcome.clone());
        outcome.into_result()
    }

    fn settle(self: &Arc<Self>, outcome: FetchOutcome) {
        {
            let mut inner = self.inner.lock();
            inner.cancel = None;
            inner.state.is_paused = false;
            match outcome {
                FetchOutcome::Success(data) => {
                    inner.state.status = MutationStatus::Success;
                    inner.state.data = Some(data);
                    inner.state.error = None;
                    inner.state.failure_count = 0;
                    inner.state.failure_reason = None;
                }
                FetchOutcome::Failure(error) => {
                    inner.state.status = MutationStatus::Error;
                    inner.state.error = Some(error);
                }
                FetchOutcome::Cancelled => {
                    inner.state.status = MutationStatus::Idle;
                }
            }
        }
        debug!(mutation = self.id, "mutation settled");
        self.publish_update();
        if self.observer_count() == 0 {
            self.schedule_gc();
        }
    }

    fn on_attempt_failure(self: &Arc<Self>, count: u32, error: &FetchError) {
        {
            let mut inner = self.inner.lock();
            inner.state.failure_count = count;
            inner.state.failure_reason = Some(error.clone());
        }
        self.publish_update();
    }

    fn on_pause(self: &Arc<Self>, paused: bool) {
        {
            let mut inner = self.inner.lock();
            inner.state.is_paused = paused;
        }
        trace!(mutation = self.id, paused, "mutation pause state changed");
        self.publish_update();
    }

    // == Observer Attachment ==
    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<MutationObserver>) {
        {
            let mut inner = self.inner.lock();
            inner.observers.retain(|w| w.strong_count() > 0);
            inner.observers.push(Arc::downgrade(observer));
            if let Some(task) = inner.gc_task.take() {
                task.abort();
            }
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(&MutationCacheEvent::ObserverAdded(Arc::clone(self)));
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
            cache.emit(&MutationCacheEvent::ObserverRemoved(Arc::clone(self)));
        }
    }

    // == Garbage Collection ==
    /// Arms eviction; a still-pending mutation re-arms instead of evicting
    /// when the timer fires.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.gc_task.take() {
            task.abort();
        }
        let GcTime::After(delay) = inner.options.gc_time else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        inner.gc_task = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mutation) = weak.upgrade() {
                mutation.gc_if_done();
            }
        }));
    }

    fn gc_if_done(self: &Arc<Self>) {
        if self.observer_count() > 0 {
            return;
        }
        if self.state().status == MutationStatus::Pending {
            self.schedule_gc();
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            debug!(mutation = self.id, "garbage collecting settled mutation");
            cache.remove(self);
        }
    }

    /// Teardown on removal: cancels a running execution and the gc timer.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = inner.gc_task.take() {
            task.abort();
        }
    }

    // == Notification ==
    fn publish_update(self: &Arc<Self>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(&MutationCacheEvent::Updated(Arc::clone(self)));
        }
        let observers: Vec<Arc<MutationObserver>> = self
            .inner
            .lock()
            .observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        self.notify.batch(|| {
            for observer in observers {
                let id = observer.id();
                self.notify
                    .schedule(id, Box::new(move || observer.on_mutation_update()));
            }
        });
    }
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &inner.state.status)
            .finish_non_exhaustive()
    }
}
