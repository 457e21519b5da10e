//! Query State
//!
//! The two independent lifecycle axes of a cache entry and the full state
//! record they live in. `status` tracks the data lifecycle (has this entry
//! ever settled, and how), `fetch_status` tracks current activity; a
//! successful entry can sit idle while later re-entering `fetching` for a
//! background refresh.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::util::current_timestamp_ms;

// == Query Status ==
/// Data lifecycle: what the entry knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No settled data yet
    Pending,
    /// Last settlement succeeded
    Success,
    /// Last settlement failed
    Error,
}

// == Fetch Status ==
/// Activity lifecycle: what the entry is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// No retryer attached
    Idle,
    /// A retryer-wrapped operation is in flight
    Fetching,
    /// A retryer is attached but waiting for connectivity
    Paused,
}

// == Query State ==
/// Complete observable state of one cache entry.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState {
    /// Data lifecycle axis
    pub status: QueryStatus,
    /// Activity lifecycle axis
    pub fetch_status: FetchStatus,
    /// Present iff the last settlement was a success
    pub data: Option<Value>,
    /// Present iff the last settlement was a failure
    pub error: Option<FetchError>,
    /// Epoch ms of the last successful settlement (0 = never)
    pub data_updated_at: u64,
    /// Epoch ms of the last failed settlement (0 = never)
    pub error_updated_at: u64,
    /// Failed attempts in the current streak
    pub failure_count: u32,
    /// Error of the most recent failed attempt in the current streak
    pub failure_reason: Option<FetchError>,
    /// Set by explicit invalidation; cleared on the next successful
    /// settlement or data write
    pub is_invalidated: bool,
}

impl QueryState {
    /// Initial state: pending and idle.
    pub fn initial() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: 0,
            error_updated_at: 0,
            failure_count: 0,
            failure_reason: None,
            is_invalidated: false,
        }
    }

    /// Initial state seeded with success data, stamped now.
    pub fn with_initial_data(data: Value) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            data_updated_at: current_timestamp_ms(),
            ..Self::initial()
        }
    }

    /// True while no settlement has ever produced data.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// True if a retryer is attached (fetching or paused).
    pub fn is_active(&self) -> bool {
        self.fetch_status != FetchStatus::Idle
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::initial()
    }
}
