// Persisted client snapshot.
// Dehydrates a query client into a serializable snapshot and hydrates it back.

use serde::{Deserialize, Serialize};

use crate::query::{QueryClient, QueryKey, QueryState, QueryStatus};

use crate::query::cache::now_millis;

/// One query captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    pub query_key: QueryKey,
    pub query_hash: String,
    pub state: QueryState,
}

/// Cache contents captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DehydratedState {
    pub queries: Vec<DehydratedQuery>,
}

/// Snapshot of a whole query client at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedClient {
    /// When the snapshot was taken (ms since epoch).
    pub timestamp: i64,
    /// Version tag; snapshots with a different buster are discarded on restore.
    pub buster: String,
    pub client_state: DehydratedState,
}

impl PersistedClient {
    pub fn new(buster: impl Into<String>, client_state: DehydratedState) -> Self {
        Self {
            timestamp: now_millis(),
            buster: buster.into(),
            client_state,
        }
    }

    /// Capture every query of `client` that holds data.
    pub fn dehydrate(client: &QueryClient, buster: impl Into<String>) -> Self {
        Self::new(buster, dehydrate(client))
    }

    pub fn query_count(&self) -> usize {
        self.client_state.queries.len()
    }
}

/// Capture the queries of `client` that hold data.
pub fn dehydrate(client: &QueryClient) -> DehydratedState {
    let mut queries: Vec<DehydratedQuery> = client
        .cache()
        .snapshot()
        .into_iter()
        .filter(|(_, state)| state.status() == QueryStatus::Success)
        .map(|(query_key, state)| DehydratedQuery {
            query_hash: query_key.query_hash(),
            query_key,
            state,
        })
        .collect();
    // Map iteration order is arbitrary; keep snapshots deterministic.
    queries.sort_by(|a, b| a.query_hash.cmp(&b.query_hash));

    DehydratedState { queries }
}

/// Load `state` into `client`. Returns how many queries were written.
pub fn hydrate(client: &QueryClient, state: DehydratedState) -> usize {
    state
        .queries
        .into_iter()
        .filter(|query| client.hydrate_query(&query.query_key, query.state.clone()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FetchError, QueryAction};
    use serde_json::json;

    #[test]
    fn test_dehydrate_keeps_only_queries_with_data() {
        let client = QueryClient::default();
        client
            .set_query_data(&QueryKey::from("todos"), &json!([1]))
            .unwrap();
        client.cache().ensure(&QueryKey::from("pending"));
        client.cache().dispatch(
            &QueryKey::from("failed"),
            QueryAction::Error {
                error: FetchError::new("x"),
                updated_at: 1,
            },
        );

        let snapshot = PersistedClient::dehydrate(&client, "v1");
        assert_eq!(snapshot.buster, "v1");
        assert_eq!(snapshot.query_count(), 1);
        assert_eq!(
            snapshot.client_state.queries[0].query_key,
            QueryKey::from("todos")
        );
        assert_eq!(snapshot.client_state.queries[0].query_hash, r#"["todos"]"#);
    }

    #[test]
    fn test_hydrate_into_empty_client() {
        let source = QueryClient::default();
        source.set_query_data(&QueryKey::from("a"), &1).unwrap();
        source.set_query_data(&QueryKey::from("b"), &2).unwrap();
        let state = dehydrate(&source);

        let target = QueryClient::default();
        assert_eq!(hydrate(&target, state), 2);
        assert_eq!(target.get_query_data::<i32>(&QueryKey::from("b")), Some(2));
        assert!(target.get_query_result(&QueryKey::from("a")).is_success());
    }

    #[test]
    fn test_round_trip_through_json() {
        let client = QueryClient::default();
        client
            .set_query_data(
                &QueryKey::new([json!("user"), json!({"id": 7})]),
                &json!({"name": "Ada", "tags": ["x", null], "score": 1.5}),
            )
            .unwrap();
        let snapshot = PersistedClient::dehydrate(&client, "");

        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: PersistedClient = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
