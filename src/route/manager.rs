use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::cache::SnapshotCache;
use crate::error::ManagerError;
use crate::synth::{ListenerOptions, Synthesizer};

use super::{Route, RouteTable};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Node identity snapshots are installed for
    pub node_id: String,
    pub listeners: ListenerOptions,
    pub snapshot_timeout: Duration,
}

struct State {
    table: RouteTable,
    /// Last version handed to the cache, successful or not
    version: u64,
}

/// Owns the route table and republishes the snapshot after every change.
///
/// Mutations are serialized by one write lock that is held until the
/// snapshot install finishes, so snapshots reach the cache in version order.
pub struct RouteManager {
    state: RwLock<State>,
    cache: Arc<dyn SnapshotCache>,
    synthesizer: Synthesizer,
    node_id: String,
    snapshot_timeout: Duration,
}

enum Outcome {
    Installed,
    /// The table change stands but the served snapshot is the previous one
    NotRendered(ManagerError),
}

impl RouteManager {
    pub fn new(cache: Arc<dyn SnapshotCache>, options: ManagerOptions) -> Self {
        Self {
            state: RwLock::new(State {
                table: RouteTable::default(),
                version: 0,
            }),
            cache,
            synthesizer: Synthesizer::new(options.listeners),
            node_id: options.node_id,
            snapshot_timeout: options.snapshot_timeout,
        }
    }

    pub async fn create(&self, name: &str, mut route: Route) -> Result<(), ManagerError> {
        if name.is_empty() {
            return Err(ManagerError::InvalidArgument(
                "route name cannot be empty".to_string(),
            ));
        }

        let state = self.state.write().await;

        if state.table.routes.contains_key(name) {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }

        route.name = name.to_string();

        let mut table = state.table.clone();
        table.routes.insert(name.to_string(), route);

        self.commit(state, table).await?;
        info!(route = name, "route created");

        Ok(())
    }

    pub async fn update(&self, name: &str, mut route: Route) -> Result<(), ManagerError> {
        let state = self.state.write().await;

        if !state.table.routes.contains_key(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }

        route.name = name.to_string();

        let mut table = state.table.clone();
        table.routes.insert(name.to_string(), route);

        self.commit(state, table).await?;
        info!(route = name, "route updated");

        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), ManagerError> {
        let state = self.state.write().await;

        let mut table = state.table.clone();

        if table.routes.remove(name).is_none() {
            return Err(ManagerError::NotFound(name.to_string()));
        }

        self.commit(state, table).await?;
        info!(route = name, "route deleted");

        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Route> {
        self.state.read().await.table.routes.get(name).cloned()
    }

    pub async fn list(&self) -> BTreeMap<String, Route> {
        self.state.read().await.table.routes.clone()
    }

    /// Version of the last attempted snapshot
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Replaces the whole table with the contents of a YAML file.
    ///
    /// An unreadable or unparsable file leaves the current table alone.
    pub async fn load_from_file(&self, path: &Path) -> Result<(), ManagerError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ManagerError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;

        let table = RouteTable::from_yaml(&contents)?;
        let names = table.routes.keys().join(", ");

        let state = self.state.write().await;
        self.commit(state, table).await?;

        info!(path = %path.display(), routes = %names, "routes loaded");

        Ok(())
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<(), ManagerError> {
        let contents = self.state.read().await.table.to_yaml()?;

        tokio::fs::write(path, contents)
            .await
            .map_err(|source| ManagerError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        info!(path = %path.display(), "routes saved");

        Ok(())
    }

    /// Publishes the current table again without changing it
    pub async fn refresh(&self) -> Result<(), ManagerError> {
        let state = self.state.write().await;
        let table = state.table.clone();

        self.commit(state, table).await
    }

    /// Validates `table`, then renders and installs a snapshot for it.
    ///
    /// Validation failures change nothing. Rendering failures keep `table`
    /// but leave the previous snapshot in place. Install failures put the
    /// previous table back.
    async fn commit(
        &self,
        mut state: RwLockWriteGuard<'_, State>,
        table: RouteTable,
    ) -> Result<(), ManagerError> {
        table.validate()?;

        state.version += 1;
        let version = state.version;

        match self.install(&table, version).await {
            Ok(Outcome::Installed) => {
                state.table = table;
                Ok(())
            }
            Ok(Outcome::NotRendered(err)) => {
                warn!(version, error = %err, "table changed but snapshot was not rebuilt");
                state.table = table;
                Err(err)
            }
            Err(err) => {
                warn!(version, error = %err, "snapshot install failed, keeping previous routes");
                Err(err)
            }
        }
    }

    async fn install(&self, table: &RouteTable, version: u64) -> Result<Outcome, ManagerError> {
        let snapshot = match self.synthesizer.synthesize(table, version) {
            Ok(snapshot) => snapshot,
            Err(err) => return Ok(Outcome::NotRendered(err.into())),
        };

        debug!(node = %self.node_id, version, "installing snapshot");

        tokio::time::timeout(
            self.snapshot_timeout,
            self.cache.set_snapshot(&self.node_id, snapshot),
        )
        .await
        .map_err(|_| ManagerError::CacheTimeout(self.snapshot_timeout))??;

        info!(node = %self.node_id, version, routes = table.routes.len(), "snapshot installed");

        Ok(Outcome::Installed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::watch;

    use super::*;
    use crate::cache::{MemoryCache, Snapshot, SnapshotWatch};
    use crate::error::CacheError;
    use crate::route::{BackendRef, Rule};
    use crate::synth::TlsListenerOptions;

    const NODE: &str = "envoy-node";

    fn options(https: Option<TlsListenerOptions>) -> ManagerOptions {
        ManagerOptions {
            node_id: NODE.to_string(),
            listeners: ListenerOptions {
                http_port: 10080,
                https,
                xds_cluster: "xds_cluster".to_string(),
            },
            snapshot_timeout: Duration::from_secs(5),
        }
    }

    fn manager() -> (RouteManager, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::default());

        (RouteManager::new(cache.clone(), options(None)), cache)
    }

    fn route(host: &str, backend: &str) -> Route {
        Route::new([host]).with_rule(Rule::to_backend(BackendRef::new(backend, 8080)))
    }

    async fn served_version(cache: &MemoryCache) -> Option<u64> {
        cache.snapshot(NODE).await.map(|snapshot| snapshot.version())
    }

    /// Never finishes an install
    struct StuckCache;

    #[tonic::async_trait]
    impl SnapshotCache for StuckCache {
        async fn set_snapshot(&self, _node: &str, _snapshot: Snapshot) -> Result<(), CacheError> {
            std::future::pending().await
        }

        async fn snapshot(&self, _node: &str) -> Option<Arc<Snapshot>> {
            None
        }

        async fn watch(&self, _node: &str) -> SnapshotWatch {
            watch::channel(None).1
        }
    }

    #[tokio::test]
    async fn create_publishes_snapshot() {
        let (manager, cache) = manager();

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        assert_eq!(manager.get("a").await.map(|r| r.name), Some("a".to_string()));
        assert_eq!(served_version(&cache).await, Some(1));
    }

    #[tokio::test]
    async fn create_rejects_empty_and_duplicate_names() {
        let (manager, cache) = manager();

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        let empty = manager.create("", route("b.example.com", "svc2")).await.unwrap_err();
        let duplicate = manager.create("a", route("c.example.com", "svc3")).await.unwrap_err();

        assert!(empty.is_validation());
        assert!(matches!(duplicate, ManagerError::AlreadyExists(_)));
        assert_eq!(manager.list().await.len(), 1);
        assert_eq!(manager.get("a").await.unwrap().hostnames, vec!["a.example.com"]);
        assert_eq!(served_version(&cache).await, Some(1));
    }

    #[tokio::test]
    async fn invalid_route_is_rejected_before_mutation() {
        let (manager, cache) = manager();

        let err = manager.create("a", route("a.*.example.com", "svc1")).await.unwrap_err();

        assert!(err.is_validation());
        assert!(manager.list().await.is_empty());
        assert_eq!(manager.version().await, 0);
        assert_eq!(served_version(&cache).await, None);
    }

    #[tokio::test]
    async fn update_and_delete_need_existing_route() {
        let (manager, cache) = manager();

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        assert!(matches!(
            manager.update("b", route("b.example.com", "svc2")).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(manager.delete("b").await, Err(ManagerError::NotFound(_))));
        assert_eq!(manager.version().await, 1);
        assert_eq!(served_version(&cache).await, Some(1));

        manager.update("a", route("a.example.com", "svc9")).await.unwrap();
        assert_eq!(
            manager.get("a").await.unwrap().rules[0].backend_refs[0].host,
            "svc9"
        );

        manager.delete("a").await.unwrap();
        assert!(manager.get("a").await.is_none());
        assert_eq!(served_version(&cache).await, Some(3));
    }

    #[tokio::test]
    async fn concurrent_creates_are_not_lost() {
        let (manager, cache) = manager();
        let manager = Arc::new(manager);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .create(&format!("r{i}"), route(&format!("r{i}.example.com"), "svc"))
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(manager.list().await.len(), 16);
        assert_eq!(served_version(&cache).await, Some(16));
    }

    #[tokio::test]
    async fn load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yaml");
        let (manager, _cache) = manager();

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        let grpc = Rule::to_backend(BackendRef::new("svc3", 9000).http2()).path_exact("/grpc");
        manager
            .create("b", route("b.example.com", "svc2").with_rule(grpc))
            .await
            .unwrap();
        manager.save_to_file(&path).await.unwrap();

        let (loaded, cache) = self::manager();
        loaded.load_from_file(&path).await.unwrap();

        assert_eq!(loaded.list().await, manager.list().await);
        assert_eq!(served_version(&cache).await, Some(1));
    }

    #[tokio::test]
    async fn bad_file_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yaml");
        let (manager, _cache) = manager();

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        tokio::fs::write(&path, "routes: [not, a, map]").await.unwrap();

        assert!(matches!(manager.load_from_file(&path).await, Err(ManagerError::Parse(_))));
        assert!(matches!(
            manager.load_from_file(&PathBuf::from("/nonexistent/routes.yaml")).await,
            Err(ManagerError::Io { .. })
        ));
        assert!(manager.get("a").await.is_some());
    }

    #[tokio::test]
    async fn unreadable_tls_keeps_previous_snapshot() {
        let cache = Arc::new(MemoryCache::default());
        let manager = RouteManager::new(cache.clone(), options(None));

        manager.create("a", route("a.example.com", "svc1")).await.unwrap();

        let broken = RouteManager::new(
            cache.clone(),
            options(Some(TlsListenerOptions {
                port: 10443,
                cert_file: "/nonexistent/tls.crt".into(),
                key_file: "/nonexistent/tls.key".into(),
            })),
        );

        let err = broken.create("b", route("b.example.com", "svc2")).await.unwrap_err();

        assert!(matches!(err, ManagerError::Synthesis(_)));
        // The table change stands, the cache still serves the old snapshot
        assert!(broken.get("b").await.is_some());
        assert_eq!(served_version(&cache).await, Some(1));
    }

    #[tokio::test]
    async fn install_timeout_rolls_back() {
        let manager = RouteManager::new(
            Arc::new(StuckCache),
            ManagerOptions {
                snapshot_timeout: Duration::from_millis(20),
                ..options(None)
            },
        );

        let err = manager.create("a", route("a.example.com", "svc1")).await.unwrap_err();

        assert!(matches!(err, ManagerError::CacheTimeout(_)));
        assert!(manager.get("a").await.is_none());
        // The attempted version is never reused
        assert_eq!(manager.version().await, 1);
    }

    #[tokio::test]
    async fn refresh_bumps_version_only() {
        let (manager, cache) = manager();

        manager.refresh().await.unwrap();
        manager.refresh().await.unwrap();

        assert!(manager.list().await.is_empty());
        assert_eq!(served_version(&cache).await, Some(2));
    }
}
