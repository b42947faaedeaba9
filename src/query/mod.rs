// Query module.
// Keyed async data dependencies: identity, status model, cache, and client.

pub mod cache;
pub mod client;
pub mod key;
pub mod online;
pub mod result;
pub mod state;
pub mod status;

pub use cache::{CacheEvent, CacheEventKind, QueryCache};
pub use client::{DEFAULT_CACHE_TIME, DEFAULT_RETRY, QueryClient, QueryClientConfig, QueryObserver};
pub use key::QueryKey;
pub use online::OnlineManager;
pub use result::QueryResult;
pub use state::{FetchError, QueryAction, QueryState};
pub use status::{FetchStatus, QueryStatus};
