// Query status axes.
// `QueryStatus` says whether data exists, `FetchStatus` whether a fetch is running.

use serde::{Deserialize, Serialize};

use super::state::QueryState;

/// Whether valid data is available for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Loading,
    Error,
    Success,
}

impl QueryStatus {
    /// Derive the status from a cache entry.
    ///
    /// Cached data wins over any fetch activity or later failure. Without
    /// data, a recorded error makes the query `Error`, otherwise `Loading`.
    pub fn resolve(state: &QueryState) -> Self {
        if state.data.is_some() {
            QueryStatus::Success
        } else if state.error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Loading
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            QueryStatus::Loading => "loading",
            QueryStatus::Error => "error",
            QueryStatus::Success => "success",
        }
    }
}

/// Whether the fetch function of a query is running or blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Fetching,
    /// An attempt wants to run but the client is offline.
    Paused,
    #[default]
    Idle,
}

impl FetchStatus {
    pub fn display(&self) -> &'static str {
        match self {
            FetchStatus::Fetching => "fetching",
            FetchStatus::Paused => "paused",
            FetchStatus::Idle => "idle",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&QueryStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&FetchStatus::Paused).unwrap(),
            "\"paused\""
        );
        let status: QueryStatus = serde_json::from_str("\"loading\"").unwrap();
        assert_eq!(status, QueryStatus::Loading);
    }

    #[test]
    fn test_defaults_describe_fresh_query() {
        assert_eq!(QueryStatus::default(), QueryStatus::Loading);
        assert_eq!(FetchStatus::default(), FetchStatus::Idle);
    }
}
