//! Bulk Operation Filters
//!
//! Predicates for the client's bulk operations (invalidate, cancel, remove,
//! refetch, counts). Key matching is hierarchical by default: a filter key
//! matches every descendant key unless `exact` is set.

use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::mutation::entry::{Mutation, MutationStatus};
use crate::query::entry::Query;
use crate::query::state::{FetchStatus, QueryStatus};

// == Query Filters ==
/// Filter over resident query entries. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match entries whose key this key prefix-matches
    pub key: Option<QueryKey>,
    /// Require full key equality instead of prefix matching
    pub exact: bool,
    /// Restrict to a data-lifecycle status
    pub status: Option<QueryStatus>,
    /// Restrict to an activity-lifecycle status
    pub fetch_status: Option<FetchStatus>,
    /// Restrict to stale (true) or fresh (false) entries
    pub stale: Option<bool>,
    /// Arbitrary caller predicate, applied last
    pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl QueryFilters {
    /// Filter matching every descendant of `key`.
    pub fn key(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Filter matching exactly `key`.
    pub fn exact(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: true,
            ..Self::default()
        }
    }

    /// Restricts to a data-lifecycle status.
    pub fn with_status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to an activity-lifecycle status.
    pub fn with_fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Restricts to stale or fresh entries.
    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Installs a caller predicate.
    pub fn with_predicate(mut self, predicate: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `query` passes every configured criterion.
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(filter_key) = &self.key {
            let matched = if self.exact {
                filter_key.hash() == *query.hash()
            } else {
                filter_key.is_prefix_of(query.key())
            };
            if !matched {
                return false;
            }
        }
        let state = query.state();
        if let Some(status) = self.status {
            if state.status != status {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if state.fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("stale", &self.stale)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

// == Mutation Filters ==
/// Filter over retained mutations, by tag key and status.
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match mutations whose tag key this key prefix-matches
    pub key: Option<QueryKey>,
    /// Require full tag equality
    pub exact: bool,
    /// Restrict to a lifecycle status
    pub status: Option<MutationStatus>,
    /// Arbitrary caller predicate
    pub predicate: Option<Arc<dyn Fn(&Mutation) -> bool + Send + Sync>>,
}

impl MutationFilters {
    /// Filter matching every mutation tagged under `key`.
    pub fn key(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Restricts to a lifecycle status.
    pub fn with_status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `mutation` passes every configured criterion. Untagged
    /// mutations never match a key filter.
    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(filter_key) = &self.key {
            let Some(tag) = mutation.key() else {
                return false;
            };
            let matched = if self.exact {
                filter_key.hash() == tag.hash()
            } else {
                filter_key.is_prefix_of(tag)
            };
            if !matched {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}
