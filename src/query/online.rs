// Connectivity gate for fetches.
// Fetches started while offline are paused until connectivity returns.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag.
///
/// Clones observe the same flag. The client starts online.
#[derive(Debug, Clone)]
pub struct OnlineManager {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl OnlineManager {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Flip connectivity. Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.tx.send_replace(online);
        if previous != online {
            tracing::debug!(online, "connectivity changed");
        }
        previous
    }

    /// Resolve once the client is online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|online| *online).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_online_returns_previous() {
        let manager = OnlineManager::default();
        assert!(manager.is_online());
        assert!(manager.set_online(false));
        assert!(!manager.is_online());
        assert!(!manager.set_online(true));
    }

    #[tokio::test]
    async fn test_wait_online_resolves_on_reconnect() {
        let manager = OnlineManager::new(false);
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_online().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        manager.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
