// Snapshot persisters.
// Throttled single-writer persistence to a storage backend with pluggable retry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{RefetchError, Result};

use super::client::PersistedClient;
use super::retry::{RetryContext, RetryStrategy};
use super::storage::Storage;

/// Default storage key for the snapshot.
pub const DEFAULT_KEY: &str = "REACT_QUERY_OFFLINE_CACHE";

/// Default minimum time between two writes: 1 second.
pub const DEFAULT_THROTTLE_TIME: Duration = Duration::from_millis(1000);

/// Turns a snapshot into the stored string.
pub type Serializer = Arc<dyn Fn(&PersistedClient) -> Result<String> + Send + Sync>;

/// Turns a stored string back into a snapshot.
pub type Deserializer = Arc<dyn Fn(&str) -> Result<PersistedClient> + Send + Sync>;

/// Saves, loads, and deletes client snapshots.
pub trait Persister: Send + Sync {
    /// Hand a snapshot over for persistence. Never fails; writes are best effort.
    fn persist_client(&self, client: PersistedClient);

    /// Load the stored snapshot, `None` when nothing is stored.
    fn restore_client(&self) -> Result<Option<PersistedClient>>;

    fn remove_client(&self) -> Result<()>;
}

impl<P: Persister + ?Sized> Persister for Arc<P> {
    fn persist_client(&self, client: PersistedClient) {
        (**self).persist_client(client)
    }

    fn restore_client(&self) -> Result<Option<PersistedClient>> {
        (**self).restore_client()
    }

    fn remove_client(&self) -> Result<()> {
        (**self).remove_client()
    }
}

/// Persister used when no storage is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersister;

impl Persister for NoopPersister {
    fn persist_client(&self, _client: PersistedClient) {}

    fn restore_client(&self) -> Result<Option<PersistedClient>> {
        Ok(None)
    }

    fn remove_client(&self) -> Result<()> {
        Ok(())
    }
}

/// Settings for [`SyncStoragePersister`].
#[derive(Clone)]
pub struct PersisterOptions {
    pub storage: Option<Arc<dyn Storage>>,
    pub key: String,
    pub throttle_time: Duration,
    pub serialize: Serializer,
    pub deserialize: Deserializer,
    /// Called after a failed write. Without one, failed writes are dropped.
    pub retry: Option<RetryStrategy>,
}

impl Default for PersisterOptions {
    fn default() -> Self {
        Self {
            storage: None,
            key: DEFAULT_KEY.to_string(),
            throttle_time: DEFAULT_THROTTLE_TIME,
            serialize: Arc::new(|client: &PersistedClient| -> Result<String> {
                Ok(serde_json::to_string(client)?)
            }),
            deserialize: Arc::new(|value: &str| -> Result<PersistedClient> {
                Ok(serde_json::from_str(value)?)
            }),
            retry: None,
        }
    }
}

impl fmt::Debug for PersisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersisterOptions")
            .field("has_storage", &self.storage.is_some())
            .field("key", &self.key)
            .field("throttle_time", &self.throttle_time)
            .field("has_retry", &self.retry.is_some())
            .finish()
    }
}

impl PersisterOptions {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_throttle_time(mut self, throttle_time: Duration) -> Self {
        self.throttle_time = throttle_time;
        self
    }

    pub fn with_serialize(
        mut self,
        serialize: impl Fn(&PersistedClient) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.serialize = Arc::new(serialize);
        self
    }

    pub fn with_deserialize(
        mut self,
        deserialize: impl Fn(&str) -> Result<PersistedClient> + Send + Sync + 'static,
    ) -> Self {
        self.deserialize = Arc::new(deserialize);
        self
    }

    pub fn with_retry(
        mut self,
        retry: impl Fn(RetryContext<'_>) -> Option<PersistedClient> + Send + Sync + 'static,
    ) -> Self {
        self.retry = Some(Arc::new(retry));
        self
    }
}

/// Latest snapshot waiting for the writer, tagged with a submission counter.
#[derive(Debug, Default)]
struct Pending {
    generation: u64,
    client: Option<PersistedClient>,
}

/// Everything the writer task needs to store a snapshot.
struct Writer {
    storage: Arc<dyn Storage>,
    key: String,
    serialize: Serializer,
    retry: Option<RetryStrategy>,
}

impl Writer {
    fn try_save(&self, client: &PersistedClient) -> Result<()> {
        let value = (self.serialize)(client)?;
        self.storage.set(&self.key, &value)
    }

    /// Store `client`, shrinking it through the retry strategy on failure.
    ///
    /// Returns false when the write was abandoned.
    fn write(&self, mut client: PersistedClient) -> bool {
        let mut error_count = 0;
        loop {
            let error = match self.try_save(&client) {
                Ok(()) => {
                    tracing::debug!(
                        key = %self.key,
                        queries = client.query_count(),
                        retries = error_count,
                        "persisted client"
                    );
                    return true;
                }
                Err(error) => error,
            };
            error_count += 1;

            let next = self.retry.as_ref().and_then(|retry| {
                retry(RetryContext {
                    persisted_client: &client,
                    error: &error,
                    error_count,
                })
            });
            match next {
                Some(next) => client = next,
                None => {
                    tracing::warn!(
                        key = %self.key,
                        error = %error,
                        error_count,
                        "giving up on persisting client"
                    );
                    return false;
                }
            }
        }
    }

    /// Coalesce snapshots: wake on the first one, wait out the window, store the latest.
    ///
    /// Storage calls are blocking, so each write runs on the blocking pool.
    async fn run(
        self: Arc<Self>,
        throttle_time: Duration,
        mut pending: watch::Receiver<Pending>,
        done: watch::Sender<u64>,
    ) {
        while pending.changed().await.is_ok() {
            tokio::time::sleep(throttle_time).await;

            let (generation, client) = {
                let latest = pending.borrow_and_update();
                (latest.generation, latest.client.clone())
            };
            if let Some(client) = client {
                let writer = Arc::clone(&self);
                if let Err(err) = tokio::task::spawn_blocking(move || writer.write(client)).await {
                    tracing::warn!(key = %self.key, error = %err, "persist write panicked");
                }
            }
            done.send_replace(generation);
        }
    }
}

/// Persister that writes snapshots to a [`Storage`] from a background task.
///
/// At most one write runs at a time and at most one happens per throttle
/// window; snapshots handed over inside a window replace each other and only
/// the last is written.
pub struct SyncStoragePersister {
    storage: Arc<dyn Storage>,
    key: String,
    deserialize: Deserializer,
    pending: watch::Sender<Pending>,
    done: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl fmt::Debug for SyncStoragePersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStoragePersister")
            .field("key", &self.key)
            .field("submitted", &self.pending.borrow().generation)
            .field("completed", &*self.done.borrow())
            .finish()
    }
}

impl SyncStoragePersister {
    /// Start the writer task. Requires storage and a running Tokio runtime.
    pub fn new(options: PersisterOptions) -> Result<Self> {
        let storage = options
            .storage
            .ok_or_else(|| RefetchError::Other("persister needs a storage backend".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| RefetchError::Other(err.to_string()))?;

        let (pending, pending_rx) = watch::channel(Pending::default());
        let (done_tx, done) = watch::channel(0);
        let writer = Arc::new(Writer {
            storage: storage.clone(),
            key: options.key.clone(),
            serialize: options.serialize,
            retry: options.retry,
        });
        let task = runtime.spawn(writer.run(options.throttle_time, pending_rx, done_tx));

        Ok(Self {
            storage,
            key: options.key,
            deserialize: options.deserialize,
            pending,
            done,
            task,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait until every snapshot handed over so far was written or abandoned.
    pub async fn flush(&self) {
        let target = self.pending.borrow().generation;
        let mut done = self.done.clone();
        // Only fails if the writer task is gone, in which case nothing is left to wait for.
        let _ = done.wait_for(|completed| *completed >= target).await;
    }

    /// Write any pending snapshot and stop the writer task.
    pub async fn shutdown(self) {
        let Self { pending, task, .. } = self;
        drop(pending);
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "persister writer task failed");
        }
    }
}

impl Persister for SyncStoragePersister {
    fn persist_client(&self, client: PersistedClient) {
        self.pending.send_modify(|pending| {
            pending.generation += 1;
            pending.client = Some(client);
        });
    }

    fn restore_client(&self) -> Result<Option<PersistedClient>> {
        let Some(value) = self.storage.get(&self.key)? else {
            return Ok(None);
        };
        (self.deserialize)(&value).map(Some)
    }

    fn remove_client(&self) -> Result<()> {
        self.storage.remove(&self.key)
    }
}

/// Build a storage-backed persister, or a no-op one when that is not possible.
pub fn create_sync_storage_persister(options: PersisterOptions) -> Arc<dyn Persister> {
    if options.storage.is_none() {
        return Arc::new(NoopPersister);
    }

    match SyncStoragePersister::new(options) {
        Ok(persister) => Arc::new(persister),
        Err(err) => {
            tracing::warn!(error = %err, "falling back to no-op persister");
            Arc::new(NoopPersister)
        }
    }
}
