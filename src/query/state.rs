// Query cache entry state and its reducer.
// Holds the raw facts about a query; statuses are derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::status::{FetchStatus, QueryStatus};

/// Failure reported by a user-supplied fetch function.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Capture any displayable error.
    pub fn from_display(error: &impl fmt::Display) -> Self {
        Self::new(error.to_string())
    }
}

/// Raw state of a single query in the cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryState {
    /// Last successfully fetched or manually set data.
    pub data: Option<Value>,
    /// When `data` was stored (ms since epoch, 0 if never).
    pub data_updated_at: i64,
    pub data_update_count: u32,
    /// Error of the last failed attempt, cleared by a success.
    pub error: Option<FetchError>,
    /// When `error` was stored (ms since epoch, 0 if never).
    pub error_updated_at: i64,
    pub error_update_count: u32,
    /// Failed attempts in the current fetch.
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<FetchError>,
    pub fetch_status: FetchStatus,
    pub is_invalidated: bool,
}

/// Transition applied to a query state.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAction {
    /// A fetch was triggered. It runs immediately only when online.
    Fetch { online: bool },
    /// The running fetch lost connectivity.
    Pause,
    /// Connectivity came back for a paused fetch.
    Continue,
    /// The fetch was dropped before it settled.
    Cancel,
    /// One attempt failed and will be retried.
    Failed {
        failure_count: u32,
        reason: FetchError,
    },
    Success { data: Value, updated_at: i64 },
    Error { error: FetchError, updated_at: i64 },
    Invalidate,
    /// Data written by hand, outside of any fetch.
    SetData { data: Value, updated_at: i64 },
}

impl QueryState {
    /// State seeded with initial data, as if it had been fetched at `updated_at`.
    pub fn with_data(data: Value, updated_at: i64) -> Self {
        Self {
            data: Some(data),
            data_updated_at: updated_at,
            ..Self::default()
        }
    }

    /// Derived data status.
    pub fn status(&self) -> QueryStatus {
        QueryStatus::resolve(self)
    }

    /// Apply a transition in place.
    pub fn apply(&mut self, action: QueryAction) {
        match action {
            QueryAction::Fetch { online } => {
                self.fetch_failure_count = 0;
                self.fetch_failure_reason = None;
                self.fetch_status = if online {
                    FetchStatus::Fetching
                } else {
                    FetchStatus::Paused
                };
            }
            QueryAction::Pause => self.fetch_status = FetchStatus::Paused,
            QueryAction::Continue => self.fetch_status = FetchStatus::Fetching,
            QueryAction::Cancel => self.fetch_status = FetchStatus::Idle,
            QueryAction::Failed {
                failure_count,
                reason,
            } => {
                self.fetch_failure_count = failure_count;
                self.fetch_failure_reason = Some(reason);
            }
            QueryAction::Success { data, updated_at } => {
                self.store_data(data, updated_at);
                self.fetch_status = FetchStatus::Idle;
                self.fetch_failure_count = 0;
                self.fetch_failure_reason = None;
            }
            QueryAction::Error { error, updated_at } => {
                self.error = Some(error.clone());
                self.error_updated_at = updated_at;
                self.error_update_count += 1;
                self.fetch_failure_count += 1;
                self.fetch_failure_reason = Some(error);
                self.fetch_status = FetchStatus::Idle;
            }
            QueryAction::Invalidate => self.is_invalidated = true,
            QueryAction::SetData { data, updated_at } => self.store_data(data, updated_at),
        }
    }

    fn store_data(&mut self, data: Value, updated_at: i64) {
        self.data = Some(data);
        self.data_updated_at = updated_at;
        self.data_update_count += 1;
        self.error = None;
        self.is_invalidated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failed(message: &str) -> QueryAction {
        QueryAction::Error {
            error: FetchError::new(message),
            updated_at: 20,
        }
    }

    #[test]
    fn test_fresh_state_is_loading_idle() {
        let state = QueryState::default();
        assert_eq!(state.status(), QueryStatus::Loading);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn test_fetch_respects_connectivity() {
        let mut state = QueryState::default();
        state.apply(QueryAction::Fetch { online: false });
        assert_eq!(state.fetch_status, FetchStatus::Paused);

        state.apply(QueryAction::Continue);
        assert_eq!(state.fetch_status, FetchStatus::Fetching);
        assert_eq!(state.status(), QueryStatus::Loading);
    }

    #[test]
    fn test_cancel_returns_to_idle_and_keeps_data() {
        let mut state = QueryState::with_data(json!("cached"), 5);
        state.apply(QueryAction::Fetch { online: true });
        state.apply(failed("timeout"));
        state.apply(QueryAction::Cancel);

        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.data, Some(json!("cached")));
        assert_eq!(state.data_updated_at, 5);
        assert!(state.error.is_none());
        assert_eq!(state.fetch_failure_count, 1);
    }

    #[test]
    fn test_success_clears_error_and_invalidation() {
        let mut state = QueryState::default();
        state.apply(failed("boom"));
        state.apply(QueryAction::Invalidate);
        state.apply(QueryAction::Fetch { online: true });
        state.apply(QueryAction::Success {
            data: json!([1, 2]),
            updated_at: 30,
        });

        assert_eq!(state.status(), QueryStatus::Success);
        assert_eq!(state.data, Some(json!([1, 2])));
        assert_eq!(state.data_updated_at, 30);
        assert!(state.error.is_none());
        assert!(!state.is_invalidated);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.fetch_failure_count, 0);
    }

    #[test]
    fn test_error_keeps_existing_data() {
        let mut state = QueryState::with_data(json!("cached"), 10);
        state.apply(QueryAction::Fetch { online: true });
        state.apply(failed("timeout"));

        assert_eq!(state.status(), QueryStatus::Success);
        assert_eq!(state.data, Some(json!("cached")));
        assert_eq!(state.error_updated_at, 20);
        assert_eq!(state.fetch_failure_count, 1);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn test_error_without_data_is_error_status() {
        let mut state = QueryState::default();
        state.apply(QueryAction::Fetch { online: true });
        state.apply(QueryAction::Failed {
            failure_count: 1,
            reason: FetchError::new("first"),
        });
        assert_eq!(state.status(), QueryStatus::Loading);

        state.apply(failed("second"));
        assert_eq!(state.status(), QueryStatus::Error);
        assert_eq!(state.error, Some(FetchError::new("second")));
        assert_eq!(state.fetch_failure_count, 2);
    }

    #[test]
    fn test_set_data_leaves_fetch_untouched() {
        let mut state = QueryState::default();
        state.apply(QueryAction::Fetch { online: true });
        state.apply(QueryAction::SetData {
            data: json!({"id": 1}),
            updated_at: 5,
        });

        assert_eq!(state.status(), QueryStatus::Success);
        assert_eq!(state.fetch_status, FetchStatus::Fetching);
        assert_eq!(state.data_update_count, 1);
    }
}
