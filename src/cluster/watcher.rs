//! Config change notification.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use super::ClusterInner;

/// Receives the new revision whenever the cluster or one of its buckets changes.
///
/// Called synchronously while the watcher list is locked, so it must not block.
pub trait ConfigWatcher: Send + Sync {
    fn on_new_config(&self, rev: u64);
}

/// Handle returned by [`Cluster::add_config_watcher`](super::Cluster::add_config_watcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) u64);

struct ChannelWatcher {
    tx: mpsc::UnboundedSender<u64>,
}

impl ConfigWatcher for ChannelWatcher {
    fn on_new_config(&self, rev: u64) {
        let _ = self.tx.send(rev);
    }
}

/// A channel-backed watcher that unregisters itself when dropped.
pub struct ConfigSubscription {
    cluster: Weak<ClusterInner>,
    id: WatcherId,
    rx: mpsc::UnboundedReceiver<u64>,
}

impl std::fmt::Debug for ConfigSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSubscription").field("id", &self.id).finish()
    }
}

impl ConfigSubscription {
    pub(crate) fn register(inner: &Arc<ClusterInner>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.add_watcher(Arc::new(ChannelWatcher { tx }));
        Self {
            cluster: Arc::downgrade(inner),
            id,
            rx,
        }
    }

    /// Wait for the next change. Returns `None` once the cluster is gone.
    pub async fn changed(&mut self) -> Option<u64> {
        let rev = self.rx.recv().await?;
        // Collapse bursts into one notification
        let mut latest = rev;
        while let Ok(next) = self.rx.try_recv() {
            latest = next;
        }
        Some(latest)
    }
}

impl Drop for ConfigSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cluster.upgrade() {
            inner.remove_watcher(self.id);
        }
    }
}
