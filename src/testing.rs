//! In-memory [`ClusterBackend`] used by the unit tests.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backend::{ClusterBackend, EventRecord, ExecSession};
use crate::catalog::ResourceCatalog;
use crate::dependency::DependencyResolver;
use crate::groups::GroupStore;
use crate::model::{
    ApiResourceMap, ClusterInfo, ContainerTarget, InstanceDetails, KindGroups, ObjectLocator,
    ObjectRecord, OwnerRef, ResourceInstance, ResourceRef, TerminalSize, WatchKey,
    canonical_kind,
};
use crate::namespaces::NamespaceResolver;
use crate::recent::RecentKinds;
use crate::registry::ClusterRegistry;
use crate::session::{SessionManager, SessionServices};
use crate::watcher::{ResourceWatcher, WatchSettings};

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct FakeState {
    clusters: BTreeMap<String, ClusterInfo>,
    kubeconfig_error: Option<String>,
    failing: HashSet<String>,
    unreachable: HashSet<String>,
    connectivity_failures: HashSet<String>,
    connectivity_delay: Duration,
    connectivity_calls: usize,
    namespaces: HashMap<String, Vec<String>>,
    default_namespaces: HashMap<String, String>,
    api_resources: HashMap<String, ApiResourceMap>,
    instances: HashMap<WatchKey, Vec<ResourceInstance>>,
    poll_delays: HashMap<WatchKey, Duration>,
    active_polls: usize,
    max_active_polls: usize,
    poll_count: usize,
    completed_polls: HashMap<WatchKey, usize>,
    objects: Vec<(String, ObjectRecord)>,
    object_delay: Duration,
    control_plane: HashMap<String, Vec<String>>,
    argocd_servers: HashMap<String, Vec<String>>,
    applications: HashSet<(String, String, String)>,
    containers: HashMap<(String, String, String), Vec<String>>,
    logs: HashMap<String, String>,
    yaml: HashMap<ObjectKey, String>,
    applied: Vec<(String, String)>,
    deleted: Vec<ObjectKey>,
    events: HashMap<ObjectKey, Vec<EventRecord>>,
    secrets: HashMap<(String, String, String), BTreeMap<String, String>>,
    exec_commands: Vec<Vec<String>>,
    command_output: HashMap<String, String>,
    resizes: Vec<TerminalSize>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(self, name: &str) -> Self {
        self.lock().clusters.insert(
            name.to_string(),
            ClusterInfo {
                cluster: name.to_string(),
                user: Some(format!("{name}-admin")),
                namespace: None,
                server: Some(format!("https://{name}.example.com:6443")),
            },
        );
        self
    }

    pub fn with_namespaces(self, cluster: &str, namespaces: &[&str]) -> Self {
        self.lock().namespaces.insert(
            cluster.to_string(),
            namespaces.iter().map(|ns| ns.to_string()).collect(),
        );
        self
    }

    pub fn with_default_namespace(self, cluster: &str, namespace: &str) -> Self {
        self.lock()
            .default_namespaces
            .insert(cluster.to_string(), namespace.to_string());
        self
    }

    pub fn with_api_resources(self, cluster: &str, resources: ApiResourceMap) -> Self {
        self.lock()
            .api_resources
            .insert(cluster.to_string(), resources);
        self
    }

    pub fn with_containers(self, cluster: &str, namespace: &str, pod: &str, names: &[&str]) -> Self {
        self.lock().containers.insert(
            (cluster.to_string(), namespace.to_string(), pod.to_string()),
            names.iter().map(|name| name.to_string()).collect(),
        );
        self
    }

    pub fn remove_cluster(&self, name: &str) {
        self.lock().clusters.remove(name);
    }

    pub fn fail_kubeconfig(&self, message: &str) {
        self.lock().kubeconfig_error = Some(message.to_string());
    }

    /// Every call against `cluster` fails from now on.
    pub fn fail_cluster(&self, cluster: &str) {
        self.lock().failing.insert(cluster.to_string());
    }

    pub fn set_reachable(&self, cluster: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable.remove(cluster);
        } else {
            state.unreachable.insert(cluster.to_string());
        }
    }

    pub fn fail_connectivity(&self, cluster: &str) {
        self.lock()
            .connectivity_failures
            .insert(cluster.to_string());
    }

    pub fn set_connectivity_delay(&self, delay: Duration) {
        self.lock().connectivity_delay = delay;
    }

    pub fn connectivity_calls(&self) -> usize {
        self.lock().connectivity_calls
    }

    pub fn set_instances(&self, key: &WatchKey, items: Vec<ResourceInstance>) {
        self.lock().instances.insert(key.clone(), items);
    }

    pub fn set_poll_delay(&self, key: &WatchKey, delay: Duration) {
        self.lock().poll_delays.insert(key.clone(), delay);
    }

    pub fn poll_count(&self) -> usize {
        self.lock().poll_count
    }

    pub fn max_concurrent_polls(&self) -> usize {
        self.lock().max_active_polls
    }

    /// Polls of `key` that ran to completion.
    pub fn completed_polls(&self, key: &WatchKey) -> usize {
        self.lock().completed_polls.get(key).copied().unwrap_or(0)
    }

    pub fn add_object(&self, cluster: &str, record: ObjectRecord) {
        self.lock().objects.push((cluster.to_string(), record));
    }

    pub fn set_object_delay(&self, delay: Duration) {
        self.lock().object_delay = delay;
    }

    pub fn set_control_plane_ips(&self, cluster: &str, ips: &[&str]) {
        self.lock().control_plane.insert(
            cluster.to_string(),
            ips.iter().map(|ip| ip.to_string()).collect(),
        );
    }

    pub fn set_argocd_servers(&self, cluster: &str, servers: &[&str]) {
        self.lock().argocd_servers.insert(
            cluster.to_string(),
            servers.iter().map(|server| server.to_string()).collect(),
        );
    }

    pub fn add_application(&self, cluster: &str, namespace: &str, name: &str) {
        self.lock().applications.insert((
            cluster.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
    }

    pub fn set_logs(&self, target: &ContainerTarget, text: &str) {
        self.lock().logs.insert(target.to_string(), text.to_string());
    }

    pub fn set_yaml(&self, cluster: &str, kind: &str, namespace: &str, name: &str, yaml: &str) {
        self.lock()
            .yaml
            .insert(object_key(cluster, kind, namespace, name), yaml.to_string());
    }

    pub fn set_events(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        events: Vec<EventRecord>,
    ) {
        self.lock()
            .events
            .insert(object_key(cluster, kind, namespace, name), events);
    }

    pub fn set_secret(&self, cluster: &str, namespace: &str, name: &str, data: &[(&str, &str)]) {
        self.lock().secrets.insert(
            (cluster.to_string(), namespace.to_string(), name.to_string()),
            data.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
    }

    pub fn applied(&self) -> Vec<(String, String)> {
        self.lock().applied.clone()
    }

    pub fn deleted(&self) -> Vec<(String, String, String, String)> {
        self.lock().deleted.clone()
    }

    pub fn set_command_output(&self, target: &ContainerTarget, text: &str) {
        self.lock()
            .command_output
            .insert(target.to_string(), text.to_string());
    }

    pub fn set_api_resources(&self, cluster: &str, resources: ApiResourceMap) {
        self.lock()
            .api_resources
            .insert(cluster.to_string(), resources);
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.lock().exec_commands.clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_healthy(&self, cluster: &str) -> Result<()> {
        if self.lock().failing.contains(cluster) {
            bail!("connection refused by {cluster}");
        }
        Ok(())
    }

    async fn object_pause(&self) {
        let delay = self.lock().object_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Keeps the concurrency gauge honest when a poll future is dropped mid-flight.
struct PollGuard {
    state: Arc<Mutex<FakeState>>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.active_polls = state.active_polls.saturating_sub(1);
    }
}

fn object_key(cluster: &str, kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (
        cluster.to_string(),
        canonical_kind(kind),
        namespace.to_string(),
        name.to_string(),
    )
}

fn matches_selector(record: &ObjectRecord, selector: Option<&str>) -> bool {
    let Some(selector) = selector.filter(|selector| !selector.is_empty()) else {
        return true;
    };

    selector.split(',').all(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        record.labels.get(key).is_some_and(|label| label == value)
    })
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    async fn get_clusters(&self) -> Result<BTreeMap<String, ClusterInfo>> {
        let state = self.lock();
        if let Some(message) = &state.kubeconfig_error {
            bail!("{message}");
        }
        Ok(state.clusters.clone())
    }

    async fn test_cluster_connectivity(&self, cluster: &str) -> Result<bool> {
        let delay = {
            let mut state = self.lock();
            state.connectivity_calls += 1;
            state.connectivity_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if !state.clusters.contains_key(cluster) {
            bail!("context {cluster} not found");
        }
        if state.connectivity_failures.contains(cluster) || state.failing.contains(cluster) {
            bail!("dial tcp: connection refused");
        }
        Ok(!state.unreachable.contains(cluster))
    }

    async fn get_namespaces(&self, cluster: &str) -> Result<Vec<String>> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .namespaces
            .get(cluster)
            .cloned()
            .unwrap_or_else(|| vec!["default".to_string()]))
    }

    async fn get_default_namespace(&self, cluster: &str) -> Result<String> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .default_namespaces
            .get(cluster)
            .cloned()
            .unwrap_or_else(|| "default".to_string()))
    }

    async fn get_api_resources(&self, cluster: &str) -> Result<ApiResourceMap> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .api_resources
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_resources_in_namespace(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceInstance>> {
        let key = WatchKey::new(cluster, namespace, kind);
        let delay = {
            let mut state = self.lock();
            state.poll_count += 1;
            state.active_polls += 1;
            state.max_active_polls = state.max_active_polls.max(state.active_polls);
            state.poll_delays.get(&key).copied().unwrap_or_default()
        };
        let _guard = PollGuard {
            state: self.state.clone(),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_healthy(cluster)?;

        let mut state = self.lock();
        *state.completed_polls.entry(key.clone()).or_default() += 1;
        Ok(state.instances.get(&key).cloned().unwrap_or_default())
    }

    async fn get_resource_yaml(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<String> {
        self.ensure_healthy(cluster)?;
        self.lock()
            .yaml
            .get(&object_key(cluster, kind, namespace, name))
            .cloned()
            .ok_or_else(|| anyhow!("{kind} {namespace}/{name} not found"))
    }

    async fn apply_resource(&self, cluster: &str, yaml: &str) -> Result<()> {
        self.ensure_healthy(cluster)?;
        serde_yaml::from_str::<serde_yaml::Value>(yaml)?;
        self.lock()
            .applied
            .push((cluster.to_string(), yaml.to_string()));
        Ok(())
    }

    async fn delete_resource(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<()> {
        self.ensure_healthy(cluster)?;
        self.lock()
            .deleted
            .push(object_key(cluster, kind, namespace, name));
        Ok(())
    }

    async fn get_events(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<EventRecord>> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .events
            .get(&object_key(cluster, kind, namespace, name))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_object(&self, cluster: &str, locator: &ObjectLocator) -> Result<ObjectRecord> {
        self.object_pause().await;
        self.ensure_healthy(cluster)?;
        let kind = canonical_kind(&locator.kind);
        self.lock()
            .objects
            .iter()
            .find(|(owner, record)| {
                owner == cluster
                    && canonical_kind(&record.reference.kind) == kind
                    && record.reference.name == locator.name
                    && (locator.namespace.is_none()
                        || record.reference.namespace == locator.namespace)
            })
            .map(|(_, record)| record.clone())
            .ok_or_else(|| anyhow!("{} {} not found", locator.kind, locator.name))
    }

    async fn list_objects(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectRecord>> {
        self.object_pause().await;
        self.ensure_healthy(cluster)?;
        let kind = canonical_kind(kind);
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(owner, record)| {
                owner == cluster
                    && canonical_kind(&record.reference.kind) == kind
                    && record.reference.namespace.as_deref() == Some(namespace)
                    && matches_selector(record, label_selector)
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn application_exists(&self, cluster: &str, namespace: &str, name: &str) -> Result<bool> {
        self.ensure_healthy(cluster)?;
        Ok(self.lock().applications.contains(&(
            cluster.to_string(),
            namespace.to_string(),
            name.to_string(),
        )))
    }

    async fn control_plane_ips(&self, cluster: &str) -> Result<Vec<String>> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .control_plane
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn argocd_cluster_servers(&self, cluster: &str) -> Result<Vec<String>> {
        self.ensure_healthy(cluster)?;
        Ok(self
            .lock()
            .argocd_servers
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn pod_containers(&self, cluster: &str, namespace: &str, pod: &str) -> Result<Vec<String>> {
        self.ensure_healthy(cluster)?;
        self.lock()
            .containers
            .get(&(cluster.to_string(), namespace.to_string(), pod.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("pods \"{pod}\" not found"))
    }

    async fn get_pod_container_logs(&self, target: &ContainerTarget) -> Result<String> {
        self.ensure_healthy(&target.cluster)?;
        Ok(self
            .lock()
            .logs
            .get(&target.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn stream_pod_logs(
        &self,
        target: &ContainerTarget,
    ) -> Result<BoxStream<'static, Result<String>>> {
        self.ensure_healthy(&target.cluster)?;
        let lines: Vec<Result<String>> = self
            .lock()
            .logs
            .get(&target.to_string())
            .map(|text| text.lines().map(|line| Ok(line.to_string())).collect())
            .unwrap_or_default();
        // Follow mode: the stream stays open after the backlog.
        Ok(stream::iter(lines).chain(stream::pending()).boxed())
    }

    async fn exec(&self, target: &ContainerTarget, command: Vec<String>) -> Result<ExecSession> {
        self.ensure_healthy(&target.cluster)?;
        self.lock().exec_commands.push(command);

        let (stdin, mut remote_in) = tokio::io::duplex(1024);
        let (mut remote_out, stdout) = tokio::io::duplex(1024);
        let echo = tokio::spawn(async move {
            tokio::io::copy(&mut remote_in, &mut remote_out).await
        });

        let (resize, mut resizes) = mpsc::channel::<TerminalSize>(8);
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(size) = resizes.recv().await {
                state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .resizes
                    .push(size);
            }
        });

        Ok(ExecSession {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            resize,
            completion: async move {
                echo.await??;
                Ok(())
            }
            .boxed(),
        })
    }

    async fn exec_capture(&self, target: &ContainerTarget, command: Vec<String>) -> Result<String> {
        self.ensure_healthy(&target.cluster)?;
        let mut state = self.lock();
        state.exec_commands.push(command);
        Ok(state
            .command_output
            .get(&target.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_secret_data(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.ensure_healthy(cluster)?;
        self.lock()
            .secrets
            .get(&(cluster.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("secrets \"{name}\" not found"))
    }
}

pub fn pod(name: &str, status: &str) -> ResourceInstance {
    ResourceInstance {
        name: name.to_string(),
        namespace: Some("default".to_string()),
        kind: "Pod".to_string(),
        age: "1m".to_string(),
        details: InstanceDetails::Pod {
            status: status.to_string(),
            ready: "1/1".to_string(),
            restarts: 0,
            containers: vec!["app".to_string()],
        },
    }
}

/// A namespaced object in `default`.
pub fn object(kind: &str, name: &str, uid: &str) -> ObjectRecord {
    ObjectRecord {
        reference: ResourceRef {
            name: name.to_string(),
            kind: kind.to_string(),
            namespace: Some("default".to_string()),
            uid: uid.to_string(),
        },
        api_version: "v1".to_string(),
        ..ObjectRecord::default()
    }
}

pub fn owned_by(mut record: ObjectRecord, kind: &str, name: &str, uid: &str) -> ObjectRecord {
    record.owners.push(OwnerRef {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: true,
    });
    record
}

pub fn fast_watch() -> WatchSettings {
    WatchSettings {
        poll_interval: Duration::from_millis(20),
        poll_timeout: Duration::from_secs(1),
    }
}

/// A session manager over `backend` with fast polling and in-memory stores.
pub async fn session_manager(
    backend: Arc<FakeBackend>,
) -> (Arc<SessionManager>, Arc<ClusterRegistry>) {
    session_manager_with_resync(backend, Duration::from_secs(10)).await
}

pub async fn session_manager_with_resync(
    backend: Arc<FakeBackend>,
    catalog_resync: Duration,
) -> (Arc<SessionManager>, Arc<ClusterRegistry>) {
    let registry = Arc::new(ClusterRegistry::new(backend.clone()));
    registry.list_clusters().await.expect("clusters");
    let timeout = Duration::from_secs(1);

    let services = SessionServices {
        registry: registry.clone(),
        namespaces: Arc::new(NamespaceResolver::new(backend.clone(), timeout)),
        catalog: Arc::new(ResourceCatalog::new(
            backend.clone(),
            Arc::new(GroupStore::in_memory(KindGroups::default())),
            timeout,
        )),
        watcher: Arc::new(ResourceWatcher::new(backend.clone(), fast_watch())),
        resolver: Arc::new(DependencyResolver::new(backend, registry.clone(), timeout)),
        recent: Arc::new(RecentKinds::in_memory()),
    };

    (
        SessionManager::new(services, catalog_resync),
        registry,
    )
}
