// Persistence module.
// Writes query client snapshots to storage and restores them on startup.

pub mod client;
pub mod file;
pub mod persister;
pub mod restore;
pub mod retry;
pub mod storage;

pub use client::{DehydratedQuery, DehydratedState, PersistedClient, dehydrate, hydrate};
pub use file::FileStorage;
pub use persister::{
    DEFAULT_KEY, DEFAULT_THROTTLE_TIME, Deserializer, NoopPersister, Persister, PersisterOptions,
    Serializer, SyncStoragePersister, create_sync_storage_persister,
};
pub use restore::{
    DEFAULT_MAX_AGE, PersistSubscription, RestoreOptions, RestoreOutcome, persist_query_client,
    restore, save, subscribe,
};
pub use retry::{RetryContext, RetryStrategy, remove_oldest_query};
pub use storage::{MemoryStorage, Storage};
