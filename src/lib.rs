//! requery - An async stale-while-revalidate data cache
//!
//! Keyed cache entries with a two-axis lifecycle (data status × fetch
//! activity), deduplicated fetches with retry and offline pausing,
//! observers deriving render-ready results, batched notifications,
//! reference-counted garbage collection, a parallel mutation path, and a
//! dehydrate/hydrate persistence boundary.

pub mod client;
pub mod config;
pub mod error;
pub mod filters;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod options;
pub mod persist;
pub mod query;
pub mod retry;
pub mod signals;
mod util;

pub use client::QueryClient;
pub use config::{ClientConfig, MutationDefaults, QueryDefaults};
pub use error::{FetchError, QueryError, Result};
pub use filters::{MutationFilters, QueryFilters};
pub use key::{KeyHash, QueryKey};
pub use mutation::{
    MutationCache, MutationObserver, MutationObserverHandle, MutationObserverResult,
    MutationState, MutationStatus,
};
pub use options::{
    FetchContext, GcTime, MutationOptions, QueryOptions, StaleTime,
};
pub use persist::{dehydrate, hydrate, DehydrateOptions, DehydratedQuery, DehydratedState};
pub use query::{
    FetchStatus, ObserverHandle, QueryCache, QueryCacheEvent, QueryObserver,
    QueryObserverResult, QueryState, QueryStatus,
};
pub use retry::{RetryDelay, RetryLimit, RetryPolicy};
pub use signals::StatusSignal;

// Macro support; not part of the public API.
#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
