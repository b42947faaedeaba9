// Error types for refetch.
// Covers storage failures, snapshot (de)serialization, and failed fetches.

use thiserror::Error;

use crate::query::FetchError;

#[derive(Error, Debug)]
pub enum RefetchError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage quota exceeded: {needed} bytes needed, {quota} bytes allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RefetchError>;
