mod resource;
mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::error::CacheError;

pub use resource::ResourceKind;
pub use snapshot::{NamedResource, Snapshot};

/// Latest snapshot of a node, `None` until the first install
pub type SnapshotWatch = watch::Receiver<Option<Arc<Snapshot>>>;

/// Per-node snapshot storage shared by the route manager (writer) and the
/// discovery server (readers).
#[tonic::async_trait]
pub trait SnapshotCache: Send + Sync + 'static {
    /// Replaces the node's snapshot. Versions must strictly increase.
    async fn set_snapshot(&self, node: &str, snapshot: Snapshot) -> Result<(), CacheError>;

    async fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>>;

    /// Notifies on every install for `node`, including nodes that have no
    /// snapshot yet. Such nodes are forgotten once all their watches are
    /// dropped.
    async fn watch(&self, node: &str) -> SnapshotWatch;
}

#[derive(Default)]
pub struct MemoryCache {
    nodes: RwLock<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>,
}

#[tonic::async_trait]
impl SnapshotCache for MemoryCache {
    async fn set_snapshot(&self, node: &str, snapshot: Snapshot) -> Result<(), CacheError> {
        let mut nodes = self.nodes.write().await;
        let sender = nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0);

        let current = sender.borrow().as_ref().map(|current| current.version());

        if let Some(current) = current {
            if snapshot.version() <= current {
                return Err(CacheError::StaleVersion {
                    node: node.to_string(),
                    current,
                    proposed: snapshot.version(),
                });
            }
        }

        debug!(node, version = snapshot.version(), "snapshot stored");

        // Works without receivers, unlike send
        sender.send_replace(Some(Arc::new(snapshot)));

        Ok(())
    }

    async fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        let nodes = self.nodes.read().await;

        nodes.get(node).and_then(|sender| sender.borrow().clone())
    }

    async fn watch(&self, node: &str) -> SnapshotWatch {
        let mut nodes = self.nodes.write().await;

        // Nodes nobody installs for only live as long as their streams
        let before = nodes.len();
        nodes.retain(|_, sender| sender.receiver_count() > 0 || sender.borrow().is_some());

        if nodes.len() < before {
            debug!(pruned = before - nodes.len(), "dropped idle nodes without snapshots");
        }

        nodes
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_per_node() {
        let cache = MemoryCache::default();

        cache.set_snapshot("a", Snapshot::new(1)).await.unwrap();

        assert_eq!(cache.snapshot("a").await.map(|s| s.version()), Some(1));
        assert!(cache.snapshot("b").await.is_none());
    }

    #[tokio::test]
    async fn rejects_stale_versions() {
        let cache = MemoryCache::default();

        cache.set_snapshot("a", Snapshot::new(2)).await.unwrap();

        let err = cache.set_snapshot("a", Snapshot::new(2)).await.unwrap_err();

        assert_eq!(
            err,
            CacheError::StaleVersion {
                node: "a".to_string(),
                current: 2,
                proposed: 2
            }
        );
        assert_eq!(cache.snapshot("a").await.map(|s| s.version()), Some(2));
    }

    #[tokio::test]
    async fn watchers_see_later_installs() {
        let cache = MemoryCache::default();
        let mut watch = cache.watch("a").await;

        assert!(watch.borrow().is_none());

        cache.set_snapshot("a", Snapshot::new(1)).await.unwrap();
        watch.changed().await.unwrap();

        assert_eq!(watch.borrow_and_update().as_ref().map(|s| s.version()), Some(1));
    }

    #[tokio::test]
    async fn unknown_nodes_are_forgotten_after_their_watches() {
        let cache = MemoryCache::default();

        cache.set_snapshot("envoy", Snapshot::new(1)).await.unwrap();

        for node in ["ghost-1", "ghost-2", "ghost-3"] {
            drop(cache.watch(node).await);
        }

        let live = cache.watch("live").await;

        let mut nodes: Vec<String> = cache.nodes.read().await.keys().cloned().collect();
        nodes.sort();

        assert_eq!(nodes, vec!["envoy", "live"]);
        assert!(live.borrow().is_none());
    }
}
