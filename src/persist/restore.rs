// Binding a query client to a persister.
// Restores a stored snapshot on startup and saves snapshots as the cache changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{RefetchError, Result};
use crate::query::QueryClient;
use crate::query::cache::now_millis;

use super::client::{PersistedClient, hydrate};
use super::persister::Persister;

/// Default maximum age of a snapshot that may still be restored: 24 hours.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings for restoring and saving snapshots.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Older snapshots are discarded.
    pub max_age: Duration,
    /// Snapshots tagged with a different buster are discarded.
    pub buster: String,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            buster: String::new(),
        }
    }
}

impl RestoreOptions {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_buster(mut self, buster: impl Into<String>) -> Self {
        self.buster = buster.into();
        self
    }
}

/// What happened when restoring a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Snapshot loaded; holds the number of queries written to the cache.
    Restored(usize),
    /// Nothing was stored.
    Empty,
    /// Snapshot older than `max_age`, removed.
    Expired,
    /// Snapshot built for another buster, removed.
    Busted,
    /// Stored value could not be read or decoded, removed.
    Invalid,
}

impl RestoreOutcome {
    pub fn restored(&self) -> usize {
        match self {
            RestoreOutcome::Restored(count) => *count,
            _ => 0,
        }
    }
}

/// Load the stored snapshot into `client`.
///
/// Never fails: anything that cannot be restored leaves the cache as it was.
pub fn restore<P: Persister + ?Sized>(
    client: &QueryClient,
    persister: &P,
    options: &RestoreOptions,
) -> RestoreOutcome {
    let persisted = match persister.restore_client() {
        Ok(Some(persisted)) => persisted,
        Ok(None) => return RestoreOutcome::Empty,
        Err(err) => {
            tracing::warn!(error = %err, "discarding unreadable persisted client");
            discard(persister);
            return RestoreOutcome::Invalid;
        }
    };

    let max_age = i64::try_from(options.max_age.as_millis()).unwrap_or(i64::MAX);
    if now_millis().saturating_sub(persisted.timestamp) > max_age {
        tracing::debug!(timestamp = persisted.timestamp, "persisted client expired");
        discard(persister);
        return RestoreOutcome::Expired;
    }
    if persisted.buster != options.buster {
        tracing::debug!(
            stored = %persisted.buster,
            expected = %options.buster,
            "persisted client busted"
        );
        discard(persister);
        return RestoreOutcome::Busted;
    }

    let count = hydrate(client, persisted.client_state);
    tracing::debug!(queries = count, "restored persisted client");
    RestoreOutcome::Restored(count)
}

fn discard<P: Persister + ?Sized>(persister: &P) {
    if let Err(err) = persister.remove_client() {
        tracing::warn!(error = %err, "failed to remove persisted client");
    }
}

/// Snapshot `client` and hand it to `persister`.
pub fn save<P: Persister + ?Sized>(client: &QueryClient, persister: &P, buster: &str) {
    persister.persist_client(PersistedClient::dehydrate(client, buster));
}

/// Background task that saves the client on every cache change.
///
/// Stops when dropped.
#[derive(Debug)]
pub struct PersistSubscription {
    task: JoinHandle<()>,
}

impl PersistSubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PersistSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Save `client` through `persister` whenever its cache changes.
pub fn subscribe(
    client: &QueryClient,
    persister: Arc<dyn Persister>,
    buster: impl Into<String>,
) -> Result<PersistSubscription> {
    let runtime =
        tokio::runtime::Handle::try_current().map_err(|err| RefetchError::Other(err.to_string()))?;
    let mut events = client.cache().subscribe();
    let client = client.clone();
    let buster = buster.into();

    let task = runtime.spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    save(&client, &*persister, &buster);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Ok(PersistSubscription { task })
}

/// Restore the stored snapshot into `client`, then keep it persisted.
pub fn persist_query_client(
    client: &QueryClient,
    persister: Arc<dyn Persister>,
    options: &RestoreOptions,
) -> Result<(RestoreOutcome, PersistSubscription)> {
    let outcome = restore(client, &*persister, options);
    let subscription = subscribe(client, persister, options.buster.clone())?;
    Ok((outcome, subscription))
}
