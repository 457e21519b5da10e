//! Client Configuration
//!
//! Default options for the read and write paths and the deterministic merge
//! applied at entry-build and observer-set-options time. There is no global
//! mutable state: a configuration travels inside the client it was given to.

use crate::options::{
    GcTime, MutationOptions, QueryOptions, ResolvedMutationOptions, ResolvedQueryOptions,
    StaleTime,
};
use crate::retry::RetryPolicy;

// == Query Defaults ==
/// Fallback policy values for query options left unset.
#[derive(Clone, Debug)]
pub struct QueryDefaults {
    /// Freshness horizon (default: always stale)
    pub stale_time: StaleTime,
    /// Eviction grace period (default: five minutes)
    pub gc_time: GcTime,
    /// Retry policy (default: three retries, exponential backoff)
    pub retry: RetryPolicy,
    /// Refetch stale entries on focus regained
    pub refetch_on_focus: bool,
    /// Refetch stale entries on reconnect
    pub refetch_on_reconnect: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: StaleTime::default(),
            gc_time: GcTime::default(),
            retry: RetryPolicy::default(),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }
}

// == Mutation Defaults ==
/// Fallback policy values for mutation options left unset.
#[derive(Clone, Debug)]
pub struct MutationDefaults {
    /// Retry policy (default: never retry a write)
    pub retry: RetryPolicy,
    /// Retention after settling unobserved
    pub gc_time: GcTime,
}

impl Default for MutationDefaults {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::never(),
            gc_time: GcTime::default(),
        }
    }
}

// == Client Config ==
/// Configuration for a [`QueryClient`](crate::client::QueryClient).
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Defaults merged into every query's options
    pub query_defaults: QueryDefaults,
    /// Defaults merged into every mutation's options
    pub mutation_defaults: MutationDefaults,
    /// Version tag stamped on dehydrated snapshots; a mismatch on hydrate
    /// rejects the snapshot
    pub hydration_buster: String,
}

impl ClientConfig {
    // == Merge ==
    /// Resolves query options against the defaults: set fields win, unset
    /// fields inherit.
    pub fn resolve_query_options(&self, options: QueryOptions) -> ResolvedQueryOptions {
        let defaults = &self.query_defaults;
        let hash = options.key.hash();
        ResolvedQueryOptions {
            hash,
            key: options.key,
            fetcher: options.fetcher,
            enabled: options.enabled,
            stale_time: options.stale_time.unwrap_or(defaults.stale_time),
            gc_time: options.gc_time.unwrap_or(defaults.gc_time),
            retry: options.retry.unwrap_or_else(|| defaults.retry.clone()),
            refetch_on_focus: options.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            refetch_on_reconnect: options
                .refetch_on_reconnect
                .unwrap_or(defaults.refetch_on_reconnect),
            refetch_interval: options.refetch_interval,
            select: options.select,
            keep_previous_data: options.keep_previous_data,
            initial_data: options.initial_data,
            page_param: options.page_param,
        }
    }

    /// Resolves mutation options against the defaults.
    pub fn resolve_mutation_options(&self, options: MutationOptions) -> ResolvedMutationOptions {
        let defaults = &self.mutation_defaults;
        ResolvedMutationOptions {
            key: options.key,
            mutation_fn: options.mutation_fn,
            retry: options.retry.unwrap_or_else(|| defaults.retry.clone()),
            gc_time: options.gc_time.unwrap_or(defaults.gc_time),
        }
    }
}
