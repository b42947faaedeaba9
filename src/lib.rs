// Query status model and offline cache persistence.
// Tracks keyed async data dependencies and writes cache snapshots to storage.

pub mod error;
pub mod persist;
pub mod query;

pub use error::{RefetchError, Result};
pub use persist::{
    FileStorage, MemoryStorage, NoopPersister, PersistedClient, Persister, PersisterOptions,
    RestoreOptions, RetryContext, RetryStrategy, Storage, SyncStoragePersister,
    create_sync_storage_persister, remove_oldest_query,
};
pub use query::{
    FetchError, FetchStatus, OnlineManager, QueryCache, QueryClient, QueryClientConfig, QueryKey,
    QueryResult, QueryState, QueryStatus,
};
