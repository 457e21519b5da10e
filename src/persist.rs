//! Persistence Boundary
//!
//! Serializable snapshots of cache entries for storage or cross-process
//! transfer. `dehydrate` extracts matching entries (by default only
//! successful ones); `hydrate` merges a snapshot back in, letting newer
//! resident data win per entry. A buster string versions the snapshot
//! format against the consuming client.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::QueryClient;
use crate::error::{FetchError, QueryError, Result};
use crate::key::{KeyHash, QueryKey};
use crate::options::{GcTime, QueryOptions, StaleTime};
use crate::query::entry::Query;
use crate::query::state::QueryStatus;
use crate::util::current_timestamp_ms;

type DehydratePredicate = Arc<dyn Fn(&Query) -> bool + Send + Sync>;

// == Dehydrate Options ==
/// Controls which entries a snapshot includes. Without an explicit
/// predicate, only successfully settled entries are captured.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    predicate: Option<DehydratePredicate>,
}

impl DehydrateOptions {
    /// Default selection: entries whose status is success.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the selection predicate.
    pub fn with_predicate(mut self, predicate: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

// == Snapshot Types ==
/// One entry's portable state, policy fields included so a hydrated entry
/// keeps its freshness and retention behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    pub key: QueryKey,
    /// Canonical hash of `key`, precomputed so consumers can index the
    /// snapshot without re-canonicalizing
    pub hash: KeyHash,
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub data_updated_at: u64,
    pub error_updated_at: u64,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
}

/// A complete portable snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Format/version tag checked against the hydrating client's config
    pub buster: String,
    /// Epoch ms when the snapshot was taken
    pub dehydrated_at: u64,
    pub queries: Vec<DehydratedQuery>,
}

// == Dehydrate ==
/// Extracts matching entries into a serializable snapshot. The cache is
/// left untouched.
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let queries: Vec<DehydratedQuery> = client
        .query_cache()
        .all()
        .into_iter()
        .filter(|query| match &options.predicate {
            Some(predicate) => predicate(query),
            None => query.state().status == QueryStatus::Success,
        })
        .map(|query| {
            let state = query.state();
            let entry_options = query.options();
            DehydratedQuery {
                key: query.key().clone(),
                hash: query.hash().clone(),
                status: state.status,
                data: state.data,
                error: state.error,
                data_updated_at: state.data_updated_at,
                error_updated_at: state.error_updated_at,
                stale_time: entry_options.stale_time,
                gc_time: entry_options.gc_time,
            }
        })
        .collect();

    debug!(count = queries.len(), "dehydrated cache snapshot");
    DehydratedState {
        buster: client.config().hydration_buster.clone(),
        dehydrated_at: current_timestamp_ms(),
        queries,
    }
}

// == Hydrate ==
/// Merges a snapshot into the cache. Entries absent from the cache are
/// created without a fetcher (one attaches when an observer mounts);
/// resident entries keep their data when it is at least as new as the
/// snapshot's. A buster mismatch rejects the whole snapshot.
pub fn hydrate(client: &QueryClient, state: DehydratedState) -> Result<()> {
    if state.buster != client.config().hydration_buster {
        warn!(
            snapshot = %state.buster,
            expected = %client.config().hydration_buster,
            "rejecting snapshot with mismatched buster"
        );
        return Err(QueryError::Hydration(format!(
            "buster mismatch: snapshot has '{}', client expects '{}'",
            state.buster,
            client.config().hydration_buster
        )));
    }

    client.notify().batch(|| {
        for dehydrated in state.queries {
            if let Some(existing) = client.query_cache().find_by_hash(&dehydrated.hash) {
                if existing.state().data_updated_at >= dehydrated.data_updated_at {
                    continue;
                }
            }
            let options = QueryOptions::new(dehydrated.key.clone())
                .with_stale_time(dehydrated.stale_time)
                .with_gc_time(dehydrated.gc_time);
            let resolved = client.config().resolve_query_options(options);
            let query = client.query_cache().build(resolved);
            query.restore(
                dehydrated.status,
                dehydrated.data,
                dehydrated.error,
                dehydrated.data_updated_at,
                dehydrated.error_updated_at,
            );
        }
    });
    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_snapshot_serde_round_trip() {
        let key = query_key!["todos", { "page": 1 }];
        let state = DehydratedState {
            buster: "v1".into(),
            dehydrated_at: 1_700_000_000_000,
            queries: vec![DehydratedQuery {
                hash: key.hash(),
                key,
                status: QueryStatus::Success,
                data: Some(json!([{ "id": 1 }])),
                error: None,
                data_updated_at: 1_700_000_000_000,
                error_updated_at: 0,
                stale_time: StaleTime::After(Duration::from_secs(30)),
                gc_time: GcTime::Never,
            }],
        };

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: DehydratedState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_buster_mismatch_is_rejected() {
        let client = QueryClient::new();
        let snapshot = DehydratedState {
            buster: "other".into(),
            dehydrated_at: 0,
            queries: Vec::new(),
        };

        let result = hydrate(&client, snapshot);
        assert!(matches!(result, Err(QueryError::Hydration(_))));
    }
}
