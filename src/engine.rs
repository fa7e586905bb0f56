use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ai::OllamaForwarder;
use crate::backend::{ClusterBackend, EventRecord, bounded};
use crate::bookmarks::BookmarkStore;
use crate::catalog::ResourceCatalog;
use crate::config::EngineConfig;
use crate::dependency::DependencyResolver;
use crate::error::{EngineError, EngineResult};
use crate::groups::GroupStore;
use crate::model::{Cluster, DependencyChain, KindGroups, ResourceCapability, canonical_kind};
use crate::namespaces::NamespaceResolver;
use crate::persist::{BOOKMARKS_FILE, GROUPS_FILE, RECENT_KINDS_FILE};
use crate::probe::ConnectivityProbe;
use crate::recent::RecentKinds;
use crate::registry::ClusterRegistry;
use crate::session::{SessionManager, SessionServices};
use crate::streaming::StreamingGateway;
use crate::watcher::ResourceWatcher;

/// Wires every component over one backend.
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn ClusterBackend>,
    registry: Arc<ClusterRegistry>,
    probe: Arc<ConnectivityProbe>,
    namespaces: Arc<NamespaceResolver>,
    catalog: Arc<ResourceCatalog>,
    watcher: Arc<ResourceWatcher>,
    resolver: Arc<DependencyResolver>,
    sessions: Arc<SessionManager>,
    gateway: StreamingGateway,
    groups: Arc<GroupStore>,
    bookmarks: BookmarkStore,
    recent: Arc<RecentKinds>,
    forwarder: OllamaForwarder,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn ClusterBackend>, config: EngineConfig) -> EngineResult<Self> {
        let timeout = config.request_timeout;
        let (groups, bookmarks, recent) = match &config.state_dir {
            Some(dir) => (
                GroupStore::open(dir.join(GROUPS_FILE)),
                BookmarkStore::open(dir.join(BOOKMARKS_FILE)),
                RecentKinds::open(dir.join(RECENT_KINDS_FILE)),
            ),
            None => (
                GroupStore::in_memory(KindGroups::default()),
                BookmarkStore::in_memory(),
                RecentKinds::in_memory(),
            ),
        };
        let groups = Arc::new(groups);
        let recent = Arc::new(recent);

        let registry = Arc::new(ClusterRegistry::new(backend.clone()));
        let probe = Arc::new(ConnectivityProbe::new(
            backend.clone(),
            registry.clone(),
            config.probe_timeout,
        ));
        let namespaces = Arc::new(NamespaceResolver::new(backend.clone(), timeout));
        let catalog = Arc::new(ResourceCatalog::new(
            backend.clone(),
            groups.clone(),
            timeout,
        ));
        let watcher = Arc::new(ResourceWatcher::new(
            backend.clone(),
            config.watch_settings(),
        ));
        let resolver = Arc::new(DependencyResolver::new(
            backend.clone(),
            registry.clone(),
            timeout,
        ));
        let sessions = SessionManager::new(
            SessionServices {
                registry: registry.clone(),
                namespaces: namespaces.clone(),
                catalog: catalog.clone(),
                watcher: watcher.clone(),
                resolver: resolver.clone(),
                recent: recent.clone(),
            },
            config.catalog_resync,
        );
        let gateway = StreamingGateway::new(backend.clone(), timeout);
        let forwarder = OllamaForwarder::new(&config.inference_endpoint, timeout)?;

        Ok(Self {
            config,
            backend,
            registry,
            probe,
            namespaces,
            catalog,
            watcher,
            resolver,
            sessions,
            gateway,
            groups,
            bookmarks,
            recent,
            forwarder,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Loads clusters and starts the probe loop. Idempotent only in the sense
    /// that a second call refreshes the cluster list without a second loop.
    pub async fn start(&self) -> EngineResult<BTreeMap<String, Cluster>> {
        let clusters = self.registry.list_clusters().await?;

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tasks.is_empty() {
            tasks.push(self.sessions.watch_reachability(self.probe.subscribe()));
            tasks.push(
                self.probe
                    .clone()
                    .spawn(self.config.probe_interval, self.cancel.child_token()),
            );
            info!(
                "engine started with {} clusters, probing every {}ms",
                clusters.len(),
                self.config.probe_interval.as_millis()
            );
        }
        Ok(clusters)
    }

    /// Re-reads kubeconfig and drops the cached Argo CD topology.
    pub async fn reload_clusters(&self) -> EngineResult<BTreeMap<String, Cluster>> {
        let clusters = self.registry.list_clusters().await?;
        self.resolver.forget_management_index().await;
        Ok(clusters)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.shutdown();
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn probe(&self) -> &Arc<ConnectivityProbe> {
        &self.probe
    }

    pub fn namespaces(&self) -> &Arc<NamespaceResolver> {
        &self.namespaces
    }

    pub fn catalog(&self) -> &Arc<ResourceCatalog> {
        &self.catalog
    }

    pub fn watcher(&self) -> &Arc<ResourceWatcher> {
        &self.watcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn gateway(&self) -> &StreamingGateway {
        &self.gateway
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub fn bookmarks(&self) -> &BookmarkStore {
        &self.bookmarks
    }

    pub fn recent(&self) -> &Arc<RecentKinds> {
        &self.recent
    }

    pub fn capability(&self, kind: &str) -> ResourceCapability {
        ResourceCapability::for_kind(kind)
    }

    pub async fn get_resource_yaml(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> EngineResult<String> {
        let kind = canonical_kind(kind);
        bounded(
            cluster,
            "fetch yaml",
            self.config.request_timeout,
            self.backend
                .get_resource_yaml(cluster, &kind, namespace, name),
        )
        .await
    }

    /// Creates the object or updates it in place.
    pub async fn apply_resource(&self, cluster: &str, yaml: &str) -> EngineResult<()> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|error| EngineError::InvalidInput(format!("failed to decode YAML: {error}")))?;
        for field in ["apiVersion", "kind"] {
            if document.get(field).and_then(serde_yaml::Value::as_str).is_none() {
                return Err(EngineError::InvalidInput(format!(
                    "manifest is missing {field}"
                )));
            }
        }
        let has_name = document
            .get("metadata")
            .and_then(|metadata| metadata.get("name"))
            .and_then(serde_yaml::Value::as_str)
            .is_some_and(|name| !name.is_empty());
        if !has_name {
            return Err(EngineError::InvalidInput(
                "manifest is missing metadata.name".to_string(),
            ));
        }

        bounded(
            cluster,
            "apply",
            self.config.request_timeout,
            self.backend.apply_resource(cluster, yaml),
        )
        .await
    }

    pub async fn delete_resource(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> EngineResult<()> {
        let kind = canonical_kind(kind);
        bounded(
            cluster,
            "delete",
            self.config.request_timeout,
            self.backend.delete_resource(cluster, namespace, &kind, name),
        )
        .await?;
        info!("deleted {kind} {namespace}/{name} on {cluster}");
        Ok(())
    }

    pub async fn get_events(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> EngineResult<Vec<EventRecord>> {
        let kind = canonical_kind(kind);
        bounded(
            cluster,
            "list events",
            self.config.request_timeout,
            self.backend.get_events(cluster, &kind, namespace, name),
        )
        .await
    }

    /// The events as the JSON list the UI consumes.
    pub async fn get_events_json(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> EngineResult<String> {
        let events = self.get_events(cluster, kind, namespace, name).await?;
        serde_json::to_string(&events).map_err(|error| {
            EngineError::upstream(cluster, format!("failed to encode events: {error}"))
        })
    }

    pub async fn decode_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> EngineResult<BTreeMap<String, String>> {
        bounded(
            cluster,
            "read secret",
            self.config.request_timeout,
            self.backend.get_secret_data(cluster, namespace, name),
        )
        .await
    }

    /// Outside any session; only `cancel` aborts it.
    pub async fn resolve_dependencies(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<DependencyChain> {
        self.resolver
            .resolve(cluster, kind, namespace, name, cancel)
            .await
    }

    pub async fn forward_to_ollama(&self, request_body: &str) -> EngineResult<String> {
        self.forwarder.forward(request_body).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::Engine;
    use crate::backend::EventRecord;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::model::{Reachability, ResourceCapability};
    use crate::testing::FakeBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(state_dir: Option<&std::path::Path>) -> EngineConfig {
        EngineConfig {
            probe_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(1),
            state_dir: state_dir.map(std::path::Path::to_path_buf),
            ..EngineConfig::default()
        }
    }

    fn engine(backend: FakeBackend) -> (Arc<FakeBackend>, Engine) {
        let backend = Arc::new(backend);
        let engine = Engine::new(backend.clone(), config(None)).expect("engine");
        (backend, engine)
    }

    #[tokio::test]
    async fn start_lists_clusters_and_probes_them() {
        let (_backend, engine) = engine(FakeBackend::new().with_cluster("prod"));

        let clusters = engine.start().await.expect("start");
        assert!(clusters.contains_key("prod"));

        let mut reachability = None;
        for _ in 0..50 {
            reachability = engine.registry().reachability("prod");
            if reachability == Some(Reachability::Connected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reachability, Some(Reachability::Connected));
        engine.shutdown();
    }

    #[tokio::test]
    async fn apply_rejects_malformed_manifests_locally() {
        let (backend, engine) = engine(FakeBackend::new().with_cluster("prod"));

        let broken = engine.apply_resource("prod", "kind: [unterminated").await;
        assert!(matches!(broken, Err(EngineError::InvalidInput(_))));

        let nameless = engine
            .apply_resource("prod", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n")
            .await;
        assert!(matches!(nameless, Err(EngineError::InvalidInput(_))));
        assert!(backend.applied().is_empty());

        engine
            .apply_resource(
                "prod",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n",
            )
            .await
            .expect("apply");
        assert_eq!(backend.applied().len(), 1);
    }

    #[tokio::test]
    async fn resource_operations_normalise_kind_aliases() {
        let (backend, engine) = engine(FakeBackend::new().with_cluster("prod"));
        backend.set_yaml("prod", "deployments", "default", "web", "kind: Deployment\n");

        let yaml = engine
            .get_resource_yaml("prod", "deploy", "default", "web")
            .await
            .expect("yaml");
        assert_eq!(yaml, "kind: Deployment\n");

        engine
            .delete_resource("prod", "default", "svc", "web")
            .await
            .expect("delete");
        assert_eq!(
            backend.deleted(),
            vec![(
                "prod".to_string(),
                "services".to_string(),
                "default".to_string(),
                "web".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn events_serialise_with_a_type_field() {
        let (backend, engine) = engine(FakeBackend::new().with_cluster("prod"));
        backend.set_events(
            "prod",
            "pods",
            "default",
            "web-1",
            vec![EventRecord {
                event_type: "Warning".to_string(),
                reason: "BackOff".to_string(),
                age: "2m".to_string(),
                from: "kubelet".to_string(),
                message: "Back-off restarting failed container".to_string(),
            }],
        );

        let json = engine
            .get_events_json("prod", "po", "default", "web-1")
            .await
            .expect("events");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(parsed[0]["type"], "Warning");
        assert_eq!(parsed[0]["reason"], "BackOff");
    }

    #[tokio::test]
    async fn secrets_decode_and_unreachable_clusters_fail_upstream() {
        let (backend, engine) = engine(FakeBackend::new().with_cluster("prod"));
        backend.set_secret("prod", "default", "db", &[("password", "hunter2")]);

        let data = engine
            .decode_secret("prod", "default", "db")
            .await
            .expect("secret");
        assert_eq!(data["password"], "hunter2");
        assert_eq!(engine.capability("secret"), ResourceCapability::SecretResource);

        backend.fail_cluster("prod");
        let error = engine
            .decode_secret("prod", "default", "db")
            .await
            .expect_err("fail");
        assert!(error.is_upstream());
    }

    #[tokio::test]
    async fn stores_persist_under_the_state_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(FakeBackend::new().with_cluster("prod"));

        {
            let engine = Engine::new(backend.clone(), config(Some(dir.path()))).expect("engine");
            engine
                .bookmarks()
                .add("prod", "default", "pods")
                .expect("bookmark");
            engine.recent().touch("services").expect("recent");
        }

        let engine = Engine::new(backend, config(Some(dir.path()))).expect("engine");
        assert_eq!(engine.bookmarks().list().len(), 1);
        assert_eq!(engine.recent().list()[0].kind, "services");
    }
}
