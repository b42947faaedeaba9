// Retry strategies for failed snapshot writes.
// A strategy may shrink the snapshot so the next write has a chance to fit.

use std::sync::Arc;

use crate::error::RefetchError;

use super::client::PersistedClient;

/// What a retry strategy sees after a failed write.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Snapshot that failed to persist.
    pub persisted_client: &'a PersistedClient,
    pub error: &'a RefetchError,
    /// Consecutive failures in this write cycle, starting at 1.
    pub error_count: u32,
}

/// Decides whether to retry a failed write, and with which snapshot.
///
/// Returning `None` abandons the write until the next snapshot update.
pub type RetryStrategy = Arc<dyn Fn(RetryContext<'_>) -> Option<PersistedClient> + Send + Sync>;

/// Drop the least recently updated query and retry with the rest.
///
/// Ties go to the query listed first. Gives up when no query is left.
pub fn remove_oldest_query(ctx: RetryContext<'_>) -> Option<PersistedClient> {
    let queries = &ctx.persisted_client.client_state.queries;
    let oldest = queries
        .iter()
        .enumerate()
        .min_by_key(|(index, query)| (query.state.data_updated_at, *index))
        .map(|(index, _)| index)?;

    let mut client = ctx.persisted_client.clone();
    let removed = client.client_state.queries.remove(oldest);
    tracing::debug!(
        query = %removed.query_hash,
        error_count = ctx.error_count,
        remaining = client.client_state.queries.len(),
        "dropping oldest query from snapshot"
    );
    Some(client)
}
