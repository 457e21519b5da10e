//! Mutation Observer
//!
//! The per-consumer view over the write path. Each `mutate` call builds a
//! fresh mutation in the cache, attaches this observer to it, and resolves
//! to the settled outcome; subscribers receive derived results as the
//! mutation progresses (pending, paused, retrying, settled).

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::client::QueryClient;
use crate::error::{FetchError, Result};
use crate::mutation::entry::{Mutation, MutationStatus};
use crate::notify::next_subscriber_id;
use crate::options::MutationOptions;

type Listener = Arc<dyn Fn(MutationObserverResult) + Send + Sync>;

// == Observer Result ==
/// Render-ready view over one mutation's state.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationObserverResult {
    pub status: MutationStatus,
    pub is_paused: bool,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub variables: Option<Value>,
    pub failure_count: u32,
    pub failure_reason: Option<FetchError>,
    pub submitted_at: u64,
}

impl MutationObserverResult {
    /// Never executed.
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    /// Currently executing.
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Settled successfully.
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// Settled with an error.
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }

    fn idle() -> Self {
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

// == Mutation Observer ==
/// A live subscriber to the write path.
pub struct MutationObserver {
    id: u64,
    client: QueryClient,
    inner: Mutex<ObserverInner>,
}

struct ObserverInner {
    options: MutationOptions,
    current: Option<Arc<Mutation>>,
    last_result: Option<MutationObserverResult>,
    listener: Option<Listener>,
}

impl MutationObserver {
    /// Creates an observer carrying the options every `mutate` call will
    /// resolve against.
    pub fn new(client: &QueryClient, options: MutationOptions) -> Arc<Self> {
        Arc::new(Self {
            id: next_subscriber_id(),
            client: client.clone(),
            inner: Mutex::new(ObserverInner {
                options,
                current: None,
                last_result: None,
                listener: None,
            }),
        })
    }

    /// Unique observer id, used for notification dedup.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replaces the options used by subsequent `mutate` calls.
    pub fn set_options(&self, options: MutationOptions) {
        self.inner.lock().options = options;
    }

    // == Mutate ==
    /// Builds a fresh mutation, attaches to it, executes it exactly once,
    /// and returns the settled outcome. A previous mutation (if any) is
    /// detached and left to the cache's gc.
    pub async fn mutate(self: &Arc<Self>, variables: Value) -> Result<Value> {
        let (options, previous) = {
            let inner = self.inner.lock();
            (inner.options.clone(), inner.current.clone())
        };
        let resolved = self.client.config().resolve_mutation_options(options);
        let mutation = self.client.mutation_cache().build(resolved);

        if let Some(previous) = previous {
            previous.remove_observer(self.id);
        }
        self.inner.lock().current = Some(Arc::clone(&mutation));
        mutation.add_observer(self);

        mutation.execute(variables).await
    }

    // == Reads ==
    /// Synchronously derives the current result; idle when nothing has been
    /// mutated yet.
    pub fn current_result(&self) -> MutationObserverResult {
        let mut inner = self.inner.lock();
        let result = derive_result(inner.current.as_deref());
        inner.last_result = Some(result.clone());
        result
    }

    // == Subscription ==
    /// Delivers the derived result to `listener` whenever it changes.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(MutationObserverResult) + Send + Sync + 'static,
    ) -> MutationObserverHandle {
        self.inner.lock().listener = Some(Arc::new(listener));
        MutationObserverHandle {
            observer: Arc::clone(self),
        }
    }

    fn unsubscribe(&self) {
        let current = {
            let mut inner = self.inner.lock();
            inner.listener = None;
            inner.current.take()
        };
        if let Some(mutation) = current {
            mutation.remove_observer(self.id);
        }
    }

    // == Delivery ==
    pub(crate) fn on_mutation_update(&self) {
        let (listener, result) = {
            let mut inner = self.inner.lock();
            let result = derive_result(inner.current.as_deref());
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
}

// == Observer Handle ==
/// RAII subscription guard; dropping it detaches from the current mutation.
pub struct MutationObserverHandle {
    observer: Arc<MutationObserver>,
}

impl MutationObserverHandle {
    /// The observer this handle keeps subscribed.
    pub fn observer(&self) -> &Arc<MutationObserver> {
        &self.observer
    }
}

impl Drop for MutationObserverHandle {
    fn drop(&mut self) {
        self.observer.unsubscribe();
    }
}

// == Derivation ==
fn derive_result(mutation: Option<&Mutation>) -> MutationObserverResult {
    let Some(mutation) = mutation else {
        return MutationObserverResult::idle();
    };
    let state = mutation.state();
    MutationObserverResult {
        status: state.status,
        is_paused: state.is_paused,
        data: state.data,
        error: state.error,
        variables: state.variables,
        failure_count: state.failure_count,
        failure_reason: state.failure_reason,
        submitted_at: state.submitted_at,
    }
}
