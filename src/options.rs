//! Query and Mutation Options
//!
//! Per-entry and per-observer configuration, plus the resolved forms
//! produced by merging with the client defaults (see `config`). Unset
//! fields (`None`) inherit the client default; resolved options carry
//! concrete values only.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::key::{KeyHash, QueryKey};
use crate::retry::RetryPolicy;

// == Fetch Context ==
/// Context handed to a caller-supplied fetch function.
#[derive(Clone, Debug)]
pub struct FetchContext {
    /// The resolved key of the entry being fetched
    pub key: QueryKey,
    /// Cancellation signal; the operation should abort promptly when set
    pub cancel: CancellationToken,
    /// Optional page/cursor parameter for paginated entries
    pub page_param: Option<Value>,
}

/// Caller-supplied fetch function. Must settle exactly once and should honor
/// `ctx.cancel` for true interruption of in-flight work.
pub type Fetcher =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// Caller-supplied mutation function, receiving the mutation variables.
pub type MutationFn = Arc<
    dyn Fn(Value, FetchContext) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync,
>;

/// Pure transform applied to entry data before observer delivery.
pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

// == Stale Time ==
/// How long after a successful settlement data counts as fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleTime {
    /// Fresh for this long; zero means always stale
    After(Duration),
    /// Never stale without explicit invalidation
    Static,
}

impl StaleTime {
    /// Staleness rule: `now - data_updated_at >= stale_time`.
    pub fn is_stale(&self, data_updated_at: u64, now: u64) -> bool {
        match self {
            StaleTime::After(duration) => {
                now.saturating_sub(data_updated_at) >= duration.as_millis() as u64
            }
            StaleTime::Static => false,
        }
    }
}

impl Default for StaleTime {
    fn default() -> Self {
        StaleTime::After(Duration::ZERO)
    }
}

// == Gc Time ==
/// How long an unobserved entry is retained before eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcTime {
    /// Evict this long after the last observer detaches
    After(Duration),
    /// Disable eviction
    Never,
}

impl Default for GcTime {
    fn default() -> Self {
        GcTime::After(Duration::from_secs(5 * 60))
    }
}

// == Query Options ==
/// Options for one query, as supplied by a caller or observer. Policy
/// fields left `None` fall back to the client defaults at resolve time.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Structured key identifying the entry
    pub key: QueryKey,
    /// Fetch function; optional so imperative writes can build fetcherless
    /// entries, but any fetch request on such an entry fails fast
    pub fetcher: Option<Fetcher>,
    /// When false, no automatic or imperative fetch is started
    pub enabled: bool,
    /// Freshness horizon
    pub stale_time: Option<StaleTime>,
    /// Eviction grace period
    pub gc_time: Option<GcTime>,
    /// Retry/backoff policy
    pub retry: Option<RetryPolicy>,
    /// Refetch stale entries when window focus is regained
    pub refetch_on_focus: Option<bool>,
    /// Refetch stale entries when connectivity is regained
    pub refetch_on_reconnect: Option<bool>,
    /// Fixed-interval background refetch
    pub refetch_interval: Option<Duration>,
    /// Per-observer derived-data transform
    pub select: Option<Selector>,
    /// Keep the previous key's data visible (flagged as placeholder) while
    /// the new key loads
    pub keep_previous_data: bool,
    /// Seeds a success state at build time
    pub initial_data: Option<Value>,
    /// Page/cursor parameter passed through the fetch context
    pub page_param: Option<Value>,
}

impl QueryOptions {
    /// Creates options for `key` with every policy field inheriting the
    /// client defaults.
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            enabled: true,
            ..Self::default()
        }
    }

    /// Sets the fetch function from an async closure.
    pub fn with_fetcher<F, Fut>(mut self, fetcher: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.fetcher = Some(Arc::new(move |ctx| fetcher(ctx).boxed()));
        self
    }

    /// Enables or disables automatic and imperative fetching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the freshness horizon.
    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets the eviction grace period.
    pub fn with_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the focus-refetch flag.
    pub fn with_refetch_on_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_focus = Some(refetch);
        self
    }

    /// Sets the reconnect-refetch flag.
    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = Some(refetch);
        self
    }

    /// Enables fixed-interval background refetching.
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Installs a derived-data transform.
    pub fn with_select(mut self, select: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.select = Some(Arc::new(select));
        self
    }

    /// Keeps previous data visible while a new key loads.
    pub fn with_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    /// Seeds the entry with initial success data.
    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Sets the page/cursor parameter for paginated fetchers.
    pub fn with_page_param(mut self, param: Value) -> Self {
        self.page_param = Some(param);
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

// == Resolved Query Options ==
/// Options after merging client defaults; every policy field is concrete.
#[derive(Clone)]
pub struct ResolvedQueryOptions {
    pub key: QueryKey,
    pub hash: KeyHash,
    pub fetcher: Option<Fetcher>,
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub retry: RetryPolicy,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval: Option<Duration>,
    pub select: Option<Selector>,
    pub keep_previous_data: bool,
    pub initial_data: Option<Value>,
    pub page_param: Option<Value>,
}

impl fmt::Debug for ResolvedQueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedQueryOptions")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("refetch_interval", &self.refetch_interval)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

// == Mutation Options ==
/// Options for one mutation invocation.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// Optional tag used for observation and filtering only; mutations are
    /// never reused by key
    pub key: Option<QueryKey>,
    /// The write operation
    pub mutation_fn: Option<MutationFn>,
    /// Retry policy (default: never retry)
    pub retry: Option<RetryPolicy>,
    /// Retention after settling with no observers
    pub gc_time: Option<GcTime>,
}

impl MutationOptions {
    /// Creates empty mutation options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags the mutation for filtering.
    pub fn with_key(mut self, key: QueryKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the mutation function from an async closure receiving the
    /// variables and context.
    pub fn with_mutation_fn<F, Fut>(mut self, mutation_fn: F) -> Self
    where
        F: Fn(Value, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.mutation_fn = Some(Arc::new(move |vars, ctx| mutation_fn(vars, ctx).boxed()));
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the retention period.
    pub fn with_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = Some(gc_time);
        self
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("key", &self.key)
            .field("has_mutation_fn", &self.mutation_fn.is_some())
            .finish_non_exhaustive()
    }
}

// == Resolved Mutation Options ==
/// Mutation options after merging client defaults.
#[derive(Clone)]
pub struct ResolvedMutationOptions {
    pub key: Option<QueryKey>,
    pub mutation_fn: Option<MutationFn>,
    pub retry: RetryPolicy,
    pub gc_time: GcTime,
}
