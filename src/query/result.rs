// Query result projection.
// Turns a raw cache entry into the status pair and flags consumers read.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;

use super::key::QueryKey;
use super::state::{FetchError, QueryState};
use super::status::{FetchStatus, QueryStatus};

/// Read-only view of a query, recomputed from its state on every read.
///
/// `data` is only set when `status` is `Success`, `error` only when it is
/// `Error`. A failed refetch over cached data stays `Success` and is
/// reported through `failure_reason` and [`QueryResult::is_refetch_error`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub data_updated_at: i64,
    pub error_updated_at: i64,
    pub failure_count: u32,
    pub failure_reason: Option<FetchError>,
    pub is_invalidated: bool,
    pub is_stale: bool,
    refetch_failed: bool,
}

impl QueryResult {
    /// Project `state` as seen at `now` (ms since epoch).
    pub fn resolve(key: QueryKey, state: &QueryState, stale_time: Duration, now: i64) -> Self {
        let status = QueryStatus::resolve(state);
        let (data, error) = match status {
            QueryStatus::Success => (state.data.clone(), None),
            QueryStatus::Error => (None, state.error.clone()),
            QueryStatus::Loading => (None, None),
        };

        Self {
            key,
            status,
            fetch_status: state.fetch_status,
            data,
            error,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_invalidated: state.is_invalidated,
            is_stale: is_stale(state, stale_time, now),
            // Storing data clears the error, so any error left beside data is newer.
            refetch_failed: status == QueryStatus::Success && state.error.is_some(),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First load in progress: no data yet and the fetch is running.
    pub fn is_initial_loading(&self) -> bool {
        self.is_loading() && self.is_fetching()
    }

    /// Background refetch over data that is already shown.
    pub fn is_refetching(&self) -> bool {
        self.is_success() && self.is_fetching()
    }

    /// Data is cached but the latest attempt failed after it was stored.
    pub fn is_refetch_error(&self) -> bool {
        self.refetch_failed
    }

    /// Decode the data into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

fn is_stale(state: &QueryState, stale_time: Duration, now: i64) -> bool {
    if state.is_invalidated || state.data.is_none() {
        return true;
    }

    let age = now.saturating_sub(state.data_updated_at).max(0) as u128;
    age >= stale_time.as_millis()
}
