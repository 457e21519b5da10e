//! Mutation Module (write path)
//!
//! Structurally parallel to the query module, minus keyed reuse and fetch
//! dedup: every invocation is its own entry, executed exactly once and
//! retained only for introspection.

pub mod cache;
pub mod entry;
pub mod observer;

pub use cache::{MutationCache, MutationCacheEvent, MutationCacheSubscription};
pub use entry::{Mutation, MutationState, MutationStatus};
pub use observer::{MutationObserver, MutationObserverHandle, MutationObserverResult};
