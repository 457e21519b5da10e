//! Query Module (read path)
//!
//! The keyed read-path subsystem: entries with their two-axis lifecycle,
//! the cache registry with lifecycle events, and the observer layer that
//! derives render-ready results and drives automatic refetching.

pub mod cache;
pub mod entry;
pub mod observer;
pub mod state;

pub use cache::{CacheSubscription, QueryCache, QueryCacheEvent};
pub use entry::Query;
pub use observer::{ObserverHandle, QueryObserver, QueryObserverResult};
pub use state::{FetchStatus, QueryState, QueryStatus};
