// Query client.
// Runs user fetch functions against the cache with retry, pausing, and staleness.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::error::{RefetchError, Result};

use super::cache::{CacheEvent, QueryCache, now_millis};
use super::key::QueryKey;
use super::online::OnlineManager;
use super::result::QueryResult;
use super::state::{FetchError, QueryAction, QueryState};

/// Default time an unobserved query stays cached: 5 minutes.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default number of retries after a failed attempt.
pub const DEFAULT_RETRY: u32 = 3;

/// Client-wide query settings.
#[derive(Debug, Clone)]
pub struct QueryClientConfig {
    /// How long fetched data counts as fresh.
    pub stale_time: Duration,
    /// How long an unobserved query is kept before garbage collection.
    pub cache_time: Duration,
    /// Retries after the first failed attempt.
    pub retry: u32,
    /// Delay before the first retry, doubled for each further one.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: DEFAULT_CACHE_TIME,
            retry: DEFAULT_RETRY,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl QueryClientConfig {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration, max_retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.max_retry_delay = max_retry_delay;
        self
    }

    /// Delay before the retry that follows failure number `failure_count`.
    fn delay_for(&self, failure_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(failure_count.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

/// Entry point for fetching and reading queries.
///
/// Clones share the cache, connectivity flag, and configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryClient {
    cache: QueryCache,
    online: OnlineManager,
    config: Arc<QueryClientConfig>,
}

impl QueryClient {
    pub fn new(config: QueryClientConfig) -> Self {
        Self {
            cache: QueryCache::new(),
            online: OnlineManager::default(),
            config: Arc::new(config),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn online(&self) -> &OnlineManager {
        &self.online
    }

    pub fn config(&self) -> &QueryClientConfig {
        &self.config
    }

    /// Return fresh cached data for `key`, or fetch it.
    pub async fn fetch_query<T, E, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.get_query_result(key).is_stale {
            if let Some(data) = self.get_query_data(key) {
                return Ok(data);
            }
        }
        self.refetch_query(key, fetcher).await
    }

    /// Run `fetcher` for `key` regardless of freshness.
    ///
    /// Failed attempts are retried with exponential backoff. While offline,
    /// the fetch is paused and resumes when connectivity returns. The final
    /// error is stored on the query and returned.
    pub async fn refetch_query<T, E, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T>
    where
        T: Serialize,
        E: std::fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.cache.dispatch(
            key,
            QueryAction::Fetch {
                online: self.online.is_online(),
            },
        );
        let mut guard = FetchGuard::new(&self.cache, key);

        let mut failure_count = 0;
        loop {
            if !self.online.is_online() {
                tracing::debug!(query = %key, "fetch paused while offline");
                self.cache.dispatch(key, QueryAction::Pause);
                self.online.wait_online().await;
                self.cache.dispatch(key, QueryAction::Continue);
            }

            match fetcher().await {
                Ok(value) => {
                    let data = match serde_json::to_value(&value) {
                        Ok(data) => data,
                        Err(err) => {
                            guard.settle();
                            self.fail(key, FetchError::from_display(&err));
                            return Err(RefetchError::Json(err));
                        }
                    };
                    guard.settle();
                    self.cache.dispatch(
                        key,
                        QueryAction::Success {
                            data,
                            updated_at: now_millis(),
                        },
                    );
                    return Ok(value);
                }
                Err(err) => {
                    failure_count += 1;
                    let reason = FetchError::from_display(&err);
                    if failure_count > self.config.retry {
                        guard.settle();
                        self.fail(key, reason.clone());
                        return Err(RefetchError::Fetch(reason));
                    }

                    let delay = self.config.delay_for(failure_count);
                    tracing::debug!(
                        query = %key,
                        failure_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "fetch attempt failed, retrying"
                    );
                    self.cache.dispatch(
                        key,
                        QueryAction::Failed {
                            failure_count,
                            reason,
                        },
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn fail(&self, key: &QueryKey, error: FetchError) {
        tracing::warn!(query = %key, error = %error, "fetch failed");
        self.cache.dispatch(
            key,
            QueryAction::Error {
                error,
                updated_at: now_millis(),
            },
        );
    }

    /// Cached data for `key`, decoded. Undecodable data reads as absent.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let data = self.cache.get(key)?.data?;
        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(query = %key, error = %err, "cached data has unexpected shape");
                None
            }
        }
    }

    /// Write data for `key` by hand.
    pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, value: &T) -> Result<()> {
        let data = serde_json::to_value(value)?;
        self.cache.dispatch(
            key,
            QueryAction::SetData {
                data,
                updated_at: now_millis(),
            },
        );
        Ok(())
    }

    /// Current result for `key`. Unknown keys read as a fresh query.
    pub fn get_query_result(&self, key: &QueryKey) -> QueryResult {
        let state = self.cache.get(key).unwrap_or_default();
        QueryResult::resolve(key.clone(), &state, self.config.stale_time, now_millis())
    }

    /// Keep `key` alive in the cache while the observer exists.
    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        let events = self.cache.subscribe();
        self.cache.add_observer(key);
        QueryObserver {
            client: self.clone(),
            key: key.clone(),
            events,
        }
    }

    /// Mark every query under `prefix` as stale. Returns how many were marked.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let matches = self.cache.find_all(prefix);
        for (key, _) in &matches {
            self.cache.dispatch(key, QueryAction::Invalidate);
        }
        matches.len()
    }

    /// Drop every query under `prefix`. Returns how many were removed.
    pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
        self.cache
            .find_all(prefix)
            .iter()
            .filter(|(key, _)| self.cache.remove(key).is_some())
            .count()
    }

    /// Seed a query with a state produced elsewhere, such as a restored snapshot.
    ///
    /// Existing data that is at least as recent is kept, and a fetch that is
    /// already running keeps its fetch status.
    pub fn hydrate_query(&self, key: &QueryKey, state: QueryState) -> bool {
        self.cache.hydrate(key, state)
    }

    /// Drop unobserved queries whose cache time has elapsed.
    pub fn collect_garbage(&self) -> usize {
        self.cache
            .collect_garbage_at(now_millis(), self.config.cache_time)
    }
}

/// Returns a query to `Idle` if its fetch is dropped before settling.
struct FetchGuard<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
    settled: bool,
}

impl<'a> FetchGuard<'a> {
    fn new(cache: &'a QueryCache, key: &'a QueryKey) -> Self {
        Self {
            cache,
            key,
            settled: false,
        }
    }

    /// The fetch reached `Success` or `Error` and resets the status itself.
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(query = %self.key, "fetch dropped before settling");
            self.cache.dispatch(self.key, QueryAction::Cancel);
        }
    }
}

/// Handle that keeps a query cached and reports its changes.
#[derive(Debug)]
pub struct QueryObserver {
    client: QueryClient,
    key: QueryKey,
    events: broadcast::Receiver<CacheEvent>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn result(&self) -> QueryResult {
        self.client.get_query_result(&self.key)
    }

    /// Wait for the next change to the observed query and return its result.
    pub async fn changed(&mut self) -> QueryResult {
        let hash = self.key.query_hash();
        loop {
            match self.events.recv().await {
                Ok(event) if event.query_hash == hash => return self.result(),
                Ok(_) => {}
                // Missed events may include ours.
                Err(broadcast::error::RecvError::Lagged(_)) => return self.result(),
                // The observer holds the cache, so the channel stays open.
                Err(broadcast::error::RecvError::Closed) => return self.result(),
            }
        }
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.client.cache.remove_observer(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::status::{FetchStatus, QueryStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client(retry: u32) -> QueryClient {
        QueryClient::new(QueryClientConfig::default().with_retry(retry))
    }

    #[tokio::test]
    async fn test_refetch_success_stores_data() {
        let client = client(0);
        let key = QueryKey::from("todos");

        let todos: Vec<String> = client
            .refetch_query(&key, || async {
                Ok::<_, FetchError>(vec!["write code".to_string()])
            })
            .await
            .unwrap();

        assert_eq!(todos, vec!["write code"]);
        let result = client.get_query_result(&key);
        assert_eq!(result.status, QueryStatus::Success);
        assert_eq!(result.fetch_status, FetchStatus::Idle);
        assert_eq!(client.get_query_data::<Vec<String>>(&key), Some(todos));
    }

    #[tokio::test]
    async fn test_failure_reaches_caller_and_cache() {
        let client = client(0);
        let key = QueryKey::from("todos");

        let err = client
            .refetch_query(&key, || async { Err::<u32, _>("server down") })
            .await
            .unwrap_err();

        assert!(matches!(err, RefetchError::Fetch(ref e) if e.message == "server down"));
        let result = client.get_query_result(&key);
        assert_eq!(result.status, QueryStatus::Error);
        assert_eq!(result.error, Some(FetchError::new("server down")));
        assert!(result.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let client = client(3);
        let key = QueryKey::from("flaky");
        let attempts = Arc::new(AtomicU32::new(0));

        let value: u32 = {
            let attempts = attempts.clone();
            client
                .refetch_query(&key, move || {
                    let attempts = attempts.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 { Err("not yet") } else { Ok(n) }
                    }
                })
                .await
                .unwrap()
        };

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.get_query_result(&key).failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_counts_every_attempt() {
        let client = client(2);
        let key = QueryKey::from("broken");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = client
            .refetch_query(&key, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("nope")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.get_query_result(&key).failure_count, 3);
    }

    #[test]
    fn test_retry_delay_backs_off_with_cap() {
        let config = QueryClientConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fetch_pauses_until_online() {
        let client = client(0);
        client.online().set_online(false);
        let key = QueryKey::from("offline");

        let task = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move {
                client
                    .refetch_query(&key, || async { Ok::<_, FetchError>(42u32) })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = client.get_query_result(&key);
        assert_eq!(result.status, QueryStatus::Loading);
        assert_eq!(result.fetch_status, FetchStatus::Paused);

        client.online().set_online(true);
        assert_eq!(task.await.unwrap().unwrap(), 42);
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_fetch_query_uses_fresh_data() {
        let client = QueryClient::new(
            QueryClientConfig::default()
                .with_retry(0)
                .with_stale_time(Duration::from_secs(60)),
        );
        let key = QueryKey::from("config");
        client.set_query_data(&key, &"cached").unwrap();

        let value: String = client
            .fetch_query(&key, || async { Ok::<_, FetchError>("fetched".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "cached");

        client.invalidate_queries(&QueryKey::from("config"));
        let value: String = client
            .fetch_query(&key, || async { Ok::<_, FetchError>("fetched".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fetched");
    }

    #[test]
    fn test_hydrate_keeps_newer_data() {
        let client = client(0);
        let key = QueryKey::from("todos");
        client.set_query_data(&key, &"local").unwrap();

        let old = QueryState::with_data(serde_json::json!("persisted"), 1);
        assert!(!client.hydrate_query(&key, old));
        assert_eq!(client.get_query_data::<String>(&key).as_deref(), Some("local"));

        let other = QueryKey::from("users");
        let mut state = QueryState::with_data(serde_json::json!(["ann"]), 1);
        state.fetch_status = FetchStatus::Fetching;
        assert!(client.hydrate_query(&other, state));
        assert_eq!(
            client.get_query_result(&other).fetch_status,
            FetchStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_observer_sees_changes_and_releases() {
        let client = client(0);
        let key = QueryKey::from("todos");
        let mut observer = client.observe(&key);
        assert_eq!(client.cache().observer_count(&key), 1);
        assert!(observer.result().is_loading());

        client.set_query_data(&key, &vec![1, 2]).unwrap();
        let result = observer.changed().await;
        assert!(result.is_success());

        drop(observer);
        assert_eq!(client.cache().observer_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_fetch_returns_to_idle() {
        let client = client(0);
        let key = QueryKey::from("slow");

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            client.refetch_query(&key, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, FetchError>(1u32)
            }),
        )
        .await;
        assert!(result.is_err());

        let result = client.get_query_result(&key);
        assert_eq!(result.fetch_status, FetchStatus::Idle);
        assert_eq!(result.status, QueryStatus::Loading);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_paused_fetch_returns_to_idle() {
        let client = client(0);
        client.online().set_online(false);
        let key = QueryKey::from("offline");

        let task = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move {
                client
                    .refetch_query(&key, || async { Ok::<_, FetchError>(1u32) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Paused
        );

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_keeps_running_fetch_status() {
        let client = client(0);
        let key = QueryKey::from("todos");

        let task = {
            let client = client.clone();
            let key = key.clone();
            tokio::spawn(async move {
                client
                    .refetch_query(&key, || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, FetchError>(2u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Fetching
        );

        assert!(client.hydrate_query(&key, QueryState::with_data(serde_json::json!(0), 1)));
        let result = client.get_query_result(&key);
        assert_eq!(result.fetch_status, FetchStatus::Fetching);
        assert_eq!(client.get_query_data::<u32>(&key), Some(0));

        assert_eq!(task.await.unwrap().unwrap(), 2);
        assert_eq!(
            client.get_query_result(&key).fetch_status,
            FetchStatus::Idle
        );
    }

    #[test]
    fn test_remove_queries_by_prefix() {
        let client = client(0);
        client
            .set_query_data(&QueryKey::new(["todos", "1"]), &1)
            .unwrap();
        client
            .set_query_data(&QueryKey::new(["todos", "2"]), &2)
            .unwrap();
        client.set_query_data(&QueryKey::from("users"), &3).unwrap();

        assert_eq!(client.remove_queries(&QueryKey::from("todos")), 2);
        assert_eq!(client.cache().len(), 1);
    }
}
