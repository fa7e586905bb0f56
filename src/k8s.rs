use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::future::{FutureExt, join_all};
use futures::stream::{self, BoxStream, StreamExt};
use futures::{AsyncBufReadExt, SinkExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResourceList, Time};
use kube::api::{
    AttachParams, DeleteParams, ListParams, LogParams, PostParams,
    TerminalSize as KubeTerminalSize,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client, Config, ResourceExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, EventRecord, ExecSession};
use crate::model::{
    ApiResourceInfo, ApiResourceMap, ClusterInfo, ContainerTarget, InstanceDetails,
    ObjectLocator, ObjectRecord, OwnerRef, ResourceInstance, ResourceRef, TerminalSize,
    format_elapsed_seconds,
};

const ARGOCD_NAMESPACE: &str = "argocd";
const ARGOCD_CLUSTER_SECRET_SELECTOR: &str = "argocd.argoproj.io/secret-type=cluster";
const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];
const STRIPPED_METADATA: [&str; 4] = [
    "creationTimestamp",
    "resourceVersion",
    "uid",
    "managedFields",
];

/// Live clusters reached through the contexts of a kubeconfig.
///
/// One client per context is built lazily and kept until the kubeconfig is
/// re-read by [`ClusterBackend::get_clusters`].
pub struct KubeBackend {
    explicit_kubeconfig: Option<PathBuf>,
    connect_timeout: Duration,
    kubeconfig: Mutex<Option<Kubeconfig>>,
    clients: Mutex<HashMap<String, Client>>,
    discovery: Mutex<HashMap<String, ApiResourceMap>>,
}

#[derive(Debug, Clone)]
struct ResolvedResource {
    api_resource: ApiResource,
    namespaced: bool,
}

impl KubeBackend {
    pub fn new(explicit_kubeconfig: Option<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            explicit_kubeconfig,
            connect_timeout,
            kubeconfig: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            discovery: Mutex::new(HashMap::new()),
        }
    }

    fn load_kubeconfig(&self) -> Result<Option<Kubeconfig>> {
        match &self.explicit_kubeconfig {
            Some(path) => Kubeconfig::read_from(path)
                .map(Some)
                .with_context(|| format!("failed to parse kubeconfig {}", path.display())),
            None => discover_kubeconfig(),
        }
    }

    fn kubeconfig(&self) -> Result<Kubeconfig> {
        let cached = lock(&self.kubeconfig).clone();
        if let Some(kubeconfig) = cached {
            return Ok(kubeconfig);
        }

        let loaded = self
            .load_kubeconfig()?
            .ok_or_else(|| anyhow!("no kubeconfig found"))?;
        *lock(&self.kubeconfig) = Some(loaded.clone());
        Ok(loaded)
    }

    async fn client(&self, cluster: &str) -> Result<Client> {
        let cached = lock(&self.clients).get(cluster).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let kubeconfig = self.kubeconfig()?;
        if !kubeconfig
            .contexts
            .iter()
            .any(|named| named.name == cluster)
        {
            bail!("context {cluster} not found in kubeconfig");
        }

        let options = KubeConfigOptions {
            context: Some(cluster.to_string()),
            cluster: None,
            user: None,
        };
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .with_context(|| format!("failed to build client config for {cluster}"))?;
        config.connect_timeout = Some(self.connect_timeout);

        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;
        lock(&self.clients).insert(cluster.to_string(), client.clone());
        debug!("client for {cluster} initialized");
        Ok(client)
    }

    fn context_namespace(&self, cluster: &str) -> Option<String> {
        let kubeconfig = self.kubeconfig().ok()?;
        kubeconfig
            .contexts
            .into_iter()
            .find(|named| named.name == cluster)
            .and_then(|named| named.context)
            .and_then(|context| context.namespace)
            .filter(|namespace| !namespace.is_empty())
    }

    async fn discover(&self, cluster: &str) -> Result<ApiResourceMap> {
        let client = self.client(cluster).await?;

        let mut group_versions = Vec::new();
        let core = client
            .list_core_api_versions()
            .await
            .context("failed to list core API versions")?;
        group_versions.extend(core.versions.into_iter().map(|version| (version, true)));

        let groups = client
            .list_api_groups()
            .await
            .context("failed to list API groups")?;
        for group in groups.groups {
            group_versions.extend(
                group
                    .versions
                    .into_iter()
                    .map(|version| (version.group_version, false)),
            );
        }

        let listed = join_all(
            group_versions
                .iter()
                .filter(|(group_version, _)| !group_version.starts_with("metrics.k8s.io"))
                .map(|(group_version, core)| {
                    let client = client.clone();
                    async move {
                        let result = if *core {
                            client.list_core_api_resources(group_version).await
                        } else {
                            client.list_api_group_resources(group_version).await
                        };
                        (group_version.clone(), result)
                    }
                }),
        )
        .await;

        let mut resources = ApiResourceMap::new();
        for (group_version, result) in listed {
            match result {
                Ok(list) => {
                    let listable = listable_resources(&list);
                    if !listable.is_empty() {
                        resources.insert(group_version, listable);
                    }
                }
                Err(error) => warn!("skipping {group_version} on {cluster}: {error}"),
            }
        }

        if resources.is_empty() {
            bail!("no listable resources discovered on {cluster}");
        }

        lock(&self.discovery).insert(cluster.to_string(), resources.clone());
        Ok(resources)
    }

    async fn resolve(
        &self,
        cluster: &str,
        kind: &str,
        api_version: Option<&str>,
    ) -> Result<ResolvedResource> {
        let cached = lock(&self.discovery).get(cluster).cloned();
        let resources = match cached {
            Some(resources) => resources,
            None => self.discover(cluster).await?,
        };

        find_resource(&resources, kind, api_version)
            .with_context(|| format!("resource type {kind} not found on {cluster}"))
    }

    async fn dynamic_api(
        &self,
        cluster: &str,
        resolved: &ResolvedResource,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let client = self.client(cluster).await?;
        Ok(match namespace.filter(|_| resolved.namespaced) {
            Some(namespace) => Api::namespaced_with(client, namespace, &resolved.api_resource),
            None => Api::all_with(client, &resolved.api_resource),
        })
    }

    async fn pods(&self, cluster: &str, namespace: &str) -> Result<Api<Pod>> {
        Ok(Api::namespaced(self.client(cluster).await?, namespace))
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn get_clusters(&self) -> Result<BTreeMap<String, ClusterInfo>> {
        let loaded = self.load_kubeconfig()?;
        lock(&self.clients).clear();
        lock(&self.discovery).clear();

        let Some(kubeconfig) = loaded else {
            warn!("no kubeconfig found, cluster list is empty");
            *lock(&self.kubeconfig) = None;
            return Ok(BTreeMap::new());
        };

        let clusters = cluster_infos(&kubeconfig);
        info!("kubeconfig loaded with {} context(s)", clusters.len());
        *lock(&self.kubeconfig) = Some(kubeconfig);
        Ok(clusters)
    }

    async fn test_cluster_connectivity(&self, cluster: &str) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client(cluster).await?);
        match nodes.list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(true),
            Err(error) if api_status(&error) == Some(403) => Ok(true),
            Err(error) => Err(error).with_context(|| format!("failed to reach {cluster}")),
        }
    }

    async fn get_namespaces(&self, cluster: &str) -> Result<Vec<String>> {
        let namespaces: Api<Namespace> = Api::all(self.client(cluster).await?);
        let list = match namespaces.list(&list_params()).await {
            Ok(list) => list,
            Err(error) if api_status(&error) == Some(403) => {
                let fallback = self
                    .context_namespace(cluster)
                    .unwrap_or_else(|| "default".to_string());
                debug!("namespace listing forbidden on {cluster}, using {fallback}");
                return Ok(vec![fallback]);
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to list namespaces on {cluster}"));
            }
        };

        let mut names = list
            .into_iter()
            .map(|namespace| namespace.name_any())
            .collect::<Vec<_>>();
        if names.is_empty() {
            bail!("no namespaces found on {cluster}");
        }
        names.sort();
        Ok(names)
    }

    async fn get_default_namespace(&self, cluster: &str) -> Result<String> {
        Ok(self
            .context_namespace(cluster)
            .unwrap_or_else(|| "default".to_string()))
    }

    async fn get_api_resources(&self, cluster: &str) -> Result<ApiResourceMap> {
        self.discover(cluster).await
    }

    async fn get_resources_in_namespace(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceInstance>> {
        let resolved = self.resolve(cluster, kind, None).await?;
        let scope = resolved.namespaced.then_some(namespace);
        let client = self.client(cluster).await?;
        let api_resource = &resolved.api_resource;

        if api_resource.group.is_empty() && api_resource.plural == "pods" {
            let pods: Api<Pod> = Api::namespaced(client, namespace);
            let list = pods
                .list(&list_params())
                .await
                .with_context(|| format!("failed to list pods in {namespace}"))?;
            return Ok(list.into_iter().map(pod_instance).collect());
        }

        if api_resource.group == "apps" && api_resource.plural == "deployments" {
            let deployments: Api<Deployment> = Api::namespaced(client, namespace);
            let list = deployments
                .list(&list_params())
                .await
                .with_context(|| format!("failed to list deployments in {namespace}"))?;
            return Ok(list.into_iter().map(deployment_instance).collect());
        }

        let objects = self.dynamic_api(cluster, &resolved, scope).await?;
        let list = objects
            .list(&list_params())
            .await
            .with_context(|| format!("failed to list {}", api_resource.plural))?;
        Ok(list
            .into_iter()
            .map(|object| generic_instance(&object, &api_resource.kind))
            .collect())
    }

    async fn get_resource_yaml(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<String> {
        let resolved = self.resolve(cluster, kind, None).await?;
        let objects = self.dynamic_api(cluster, &resolved, Some(namespace)).await?;
        let object = objects
            .get(name)
            .await
            .with_context(|| format!("failed to get {kind} {name}"))?;

        let manifest = strip_server_fields(serde_json::to_value(&object)?);
        serde_yaml::to_string(&manifest).context("failed to render manifest as yaml")
    }

    async fn apply_resource(&self, cluster: &str, yaml: &str) -> Result<()> {
        let mut object: DynamicObject =
            serde_yaml::from_str(yaml).context("failed to parse manifest")?;
        let types = object
            .types
            .clone()
            .context("manifest has no apiVersion or kind")?;
        let name = object
            .metadata
            .name
            .clone()
            .context("manifest has no metadata.name")?;

        let resolved = self
            .resolve(cluster, &types.kind, Some(&types.api_version))
            .await?;
        let namespace = resolved.namespaced.then(|| {
            object
                .metadata
                .namespace
                .get_or_insert_with(|| "default".to_string())
                .clone()
        });
        let objects = self
            .dynamic_api(cluster, &resolved, namespace.as_deref())
            .await?;

        let params = PostParams::default();
        match objects.get_opt(&name).await? {
            None => {
                objects
                    .create(&params, &object)
                    .await
                    .with_context(|| format!("failed to create {} {name}", types.kind))?;
                info!("{} {name} created on {cluster}", types.kind);
            }
            Some(existing) => {
                object.metadata.resource_version = existing.metadata.resource_version;
                objects
                    .replace(&name, &params, &object)
                    .await
                    .with_context(|| format!("failed to update {} {name}", types.kind))?;
                info!("{} {name} updated on {cluster}", types.kind);
            }
        }
        Ok(())
    }

    async fn delete_resource(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<()> {
        let resolved = self.resolve(cluster, kind, None).await?;
        let objects = self.dynamic_api(cluster, &resolved, Some(namespace)).await?;

        match objects.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("{kind} {name} deleted on {cluster}");
                Ok(())
            }
            Err(error) if api_status(&error) == Some(404) => {
                bail!("{kind} {name} not found in {namespace}")
            }
            Err(error) => Err(error).with_context(|| format!("failed to delete {kind} {name}")),
        }
    }

    async fn get_events(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<EventRecord>> {
        let resolved = self.resolve(cluster, kind, None).await?;
        let objects = self.dynamic_api(cluster, &resolved, Some(namespace)).await?;
        let object = objects
            .get(name)
            .await
            .with_context(|| format!("failed to get {kind} {name}"))?;
        let uid = object
            .uid()
            .with_context(|| format!("{kind} {name} has no uid"))?;

        let client = self.client(cluster).await?;
        let events: Api<Event> = if resolved.namespaced {
            Api::namespaced(client, namespace)
        } else {
            Api::all(client)
        };
        let params = ListParams::default().fields(&format!("involvedObject.uid={uid}"));
        let list = events
            .list(&params)
            .await
            .with_context(|| format!("failed to list events for {kind} {name}"))?;

        Ok(list.into_iter().map(|event| event_record(&event)).collect())
    }

    async fn fetch_object(&self, cluster: &str, locator: &ObjectLocator) -> Result<ObjectRecord> {
        let resolved = self
            .resolve(cluster, &locator.kind, locator.api_version.as_deref())
            .await?;
        let objects = self
            .dynamic_api(cluster, &resolved, locator.namespace.as_deref())
            .await?;
        let object = objects
            .get(&locator.name)
            .await
            .with_context(|| format!("failed to get {} {}", locator.kind, locator.name))?;

        Ok(object_record(&object, &resolved.api_resource))
    }

    async fn list_objects(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectRecord>> {
        let resolved = self.resolve(cluster, kind, None).await?;
        let objects = self.dynamic_api(cluster, &resolved, Some(namespace)).await?;
        let params = match label_selector {
            Some(selector) => list_params().labels(selector),
            None => list_params(),
        };
        let list = objects
            .list(&params)
            .await
            .with_context(|| format!("failed to list {kind} in {namespace}"))?;

        Ok(list
            .iter()
            .map(|object| object_record(object, &resolved.api_resource))
            .collect())
    }

    async fn application_exists(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        let gvk = GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Application");
        let api_resource = ApiResource::from_gvk_with_plural(&gvk, "applications");
        let applications: Api<DynamicObject> =
            Api::namespaced_with(self.client(cluster).await?, namespace, &api_resource);

        let found = applications
            .get_opt(name)
            .await
            .with_context(|| format!("failed to look up application {namespace}/{name}"))?;
        Ok(found.is_some())
    }

    async fn control_plane_ips(&self, cluster: &str) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client(cluster).await?);
        let list = nodes
            .list(&list_params())
            .await
            .with_context(|| format!("failed to list nodes on {cluster}"))?;

        Ok(list
            .iter()
            .filter(|node| is_control_plane(node))
            .flat_map(internal_ips)
            .collect())
    }

    async fn argocd_cluster_servers(&self, cluster: &str) -> Result<Vec<String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client(cluster).await?, ARGOCD_NAMESPACE);
        let list = match secrets
            .list(&ListParams::default().labels(ARGOCD_CLUSTER_SECRET_SELECTOR))
            .await
        {
            Ok(list) => list,
            Err(error) if matches!(api_status(&error), Some(403 | 404)) => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to list argo cd secrets on {cluster}"));
            }
        };

        let servers = list
            .iter()
            .filter_map(|secret| {
                let server = secret.data.as_ref()?.get("server")?;
                Some(String::from_utf8_lossy(&server.0).into_owned())
            })
            .collect::<Vec<_>>();
        debug!("{cluster} holds {} argo cd cluster secret(s)", servers.len());
        Ok(servers)
    }

    async fn pod_containers(
        &self,
        cluster: &str,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>> {
        let pods = self.pods(cluster, namespace).await?;
        let pod = pods
            .get(pod)
            .await
            .with_context(|| format!("failed to get pod {namespace}/{pod}"))?;
        Ok(container_names(&pod))
    }

    async fn get_pod_container_logs(&self, target: &ContainerTarget) -> Result<String> {
        let pods = self.pods(&target.cluster, &target.namespace).await?;
        let params = LogParams {
            container: Some(target.container.clone()),
            follow: false,
            ..LogParams::default()
        };

        pods.logs(&target.pod, &params)
            .await
            .with_context(|| format!("failed to load logs for {target}"))
    }

    async fn stream_pod_logs(
        &self,
        target: &ContainerTarget,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let pods = self.pods(&target.cluster, &target.namespace).await?;
        let params = LogParams {
            container: Some(target.container.clone()),
            follow: true,
            ..LogParams::default()
        };

        let pod = target.pod.clone();
        let label = target.to_string();

        // The reader borrows the pod api, so a task owns both and forwards lines.
        let (lines_tx, lines_rx) = mpsc::channel::<Result<String>>(256);
        let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();
        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(error) => {
                    let _ = opened_tx.send(Err(anyhow!(error).context(format!(
                        "failed to follow logs for {label}"
                    ))));
                    return;
                }
            };

            let mut lines = Box::pin(reader.lines());
            while let Some(line) = lines.next().await {
                if lines_tx.send(line.map_err(anyhow::Error::from)).await.is_err() {
                    break;
                }
            }
            debug!("log stream for {label} ended");
        });

        opened_rx
            .await
            .context("log stream task ended before opening")??;
        Ok(stream::unfold(lines_rx, |mut lines| async move {
            lines.recv().await.map(|line| (line, lines))
        })
        .boxed())
    }

    async fn exec(&self, target: &ContainerTarget, command: Vec<String>) -> Result<ExecSession> {
        let pods = self.pods(&target.cluster, &target.namespace).await?;
        let params = AttachParams::interactive_tty().container(target.container.clone());
        let mut process = pods
            .exec(&target.pod, command, &params)
            .await
            .with_context(|| format!("failed to exec into {target}"))?;

        let stdin = process.stdin().context("exec session has no stdin")?;
        let stdout = process.stdout().context("exec session has no stdout")?;
        let mut sizes = process
            .terminal_size()
            .context("exec session has no terminal size channel")?;

        let (resize, mut resizes) = mpsc::channel::<TerminalSize>(8);
        tokio::spawn(async move {
            while let Some(size) = resizes.recv().await {
                let size = KubeTerminalSize {
                    width: size.cols,
                    height: size.rows,
                };
                if sizes.send(size).await.is_err() {
                    break;
                }
            }
        });

        let label = target.to_string();
        let completion = async move {
            process
                .join()
                .await
                .with_context(|| format!("exec session {label} failed"))
        }
        .boxed();

        Ok(ExecSession {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            resize,
            completion,
        })
    }

    async fn exec_capture(&self, target: &ContainerTarget, command: Vec<String>) -> Result<String> {
        let pods = self.pods(&target.cluster, &target.namespace).await?;
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(false);
        let mut process = pods
            .exec(&target.pod, command, &params)
            .await
            .with_context(|| format!("failed to exec into {target}"))?;

        let mut stdout = process.stdout().context("exec has no stdout")?;
        let mut captured = Vec::new();
        stdout
            .read_to_end(&mut captured)
            .await
            .with_context(|| format!("failed to read output of {target}"))?;
        process
            .join()
            .await
            .with_context(|| format!("command in {target} failed"))?;

        debug!("captured {} bytes from {target}", captured.len());
        Ok(String::from_utf8_lossy(&captured).into_owned())
    }

    async fn get_secret_data(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client(cluster).await?, namespace);
        let secret = secrets
            .get(name)
            .await
            .with_context(|| format!("failed to get secret {namespace}/{name}"))?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value.0).into_owned()))
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn list_params() -> ListParams {
    ListParams::default().limit(500)
}

fn api_status(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// `KUBECONFIG` wins, then `~/.kube/config`, then every parseable file in `~/.kube`.
fn discover_kubeconfig() -> Result<Option<Kubeconfig>> {
    if std::env::var_os("KUBECONFIG").is_some_and(|value| !value.is_empty()) {
        let kubeconfig = Kubeconfig::read().context("failed to read kubeconfig from KUBECONFIG")?;
        return Ok(Some(kubeconfig));
    }

    let Some(home) = dirs::home_dir() else {
        warn!("home directory unknown, no kubeconfig to load");
        return Ok(None);
    };

    let kube_dir = home.join(".kube");
    let primary = kube_dir.join("config");
    if primary.is_file() {
        let kubeconfig = Kubeconfig::read_from(&primary)
            .with_context(|| format!("failed to parse kubeconfig {}", primary.display()))?;
        return Ok(Some(kubeconfig));
    }

    Ok(merge_kubeconfigs(&scan_kube_dir(&kube_dir)))
}

fn scan_kube_dir(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            debug!("cannot read {}: {error}", dir.display());
            return Vec::new();
        }
    };

    let mut paths = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'))
        })
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// Files that do not parse are skipped; the first file's current context wins.
fn merge_kubeconfigs(paths: &[PathBuf]) -> Option<Kubeconfig> {
    let mut merged: Option<Kubeconfig> = None;
    for path in paths {
        let next = match Kubeconfig::read_from(path) {
            Ok(kubeconfig) => kubeconfig,
            Err(error) => {
                debug!("{} is not a kubeconfig: {error}", path.display());
                continue;
            }
        };

        merged = Some(match merged.take() {
            None => next,
            Some(mut base) => {
                base.clusters.extend(next.clusters);
                base.auth_infos.extend(next.auth_infos);
                base.contexts.extend(next.contexts);
                if base.current_context.is_none() {
                    base.current_context = next.current_context;
                }
                base
            }
        });
    }
    merged
}

fn cluster_infos(kubeconfig: &Kubeconfig) -> BTreeMap<String, ClusterInfo> {
    let servers = kubeconfig
        .clusters
        .iter()
        .filter_map(|named| {
            let server = named.cluster.as_ref()?.server.clone()?;
            Some((named.name.clone(), server))
        })
        .collect::<HashMap<_, _>>();

    let mut clusters = BTreeMap::new();
    for named in &kubeconfig.contexts {
        let Some(context) = named.context.as_ref() else {
            continue;
        };
        clusters
            .entry(named.name.clone())
            .or_insert_with(|| ClusterInfo {
                cluster: context.cluster.clone(),
                user: context.user.clone(),
                namespace: context.namespace.clone(),
                server: servers.get(&context.cluster).cloned(),
            });
    }
    clusters
}

fn listable_resources(list: &APIResourceList) -> Vec<ApiResourceInfo> {
    list.resources
        .iter()
        .filter(|resource| !resource.name.contains('/'))
        .filter(|resource| resource.verbs.iter().any(|verb| verb == "list"))
        .map(|resource| ApiResourceInfo {
            name: resource.name.clone(),
            kind: resource.kind.clone(),
            version: list.group_version.clone(),
            namespaced: resource.namespaced,
        })
        .collect()
}

/// Matches a plural name or a Kind, preferring `api_version` and then the core group.
fn find_resource(
    resources: &ApiResourceMap,
    kind: &str,
    api_version: Option<&str>,
) -> Option<ResolvedResource> {
    let wanted = kind.trim();
    let mut candidates = resources
        .iter()
        .flat_map(|(group_version, infos)| infos.iter().map(move |info| (group_version, info)))
        .filter(|(_, info)| {
            info.name.eq_ignore_ascii_case(wanted) || info.kind.eq_ignore_ascii_case(wanted)
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(group_version, _)| {
        (
            api_version != Some(group_version.as_str()),
            group_version.contains('/'),
        )
    });

    let (group_version, info) = candidates.into_iter().next()?;
    let (group, version) = group_version
        .split_once('/')
        .unwrap_or(("", group_version.as_str()));
    let gvk = GroupVersionKind::gvk(group, version, &info.kind);

    Some(ResolvedResource {
        api_resource: ApiResource::from_gvk_with_plural(&gvk, &info.name),
        namespaced: info.namespaced,
    })
}

fn strip_server_fields(mut manifest: Value) -> Value {
    if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in STRIPPED_METADATA {
            metadata.remove(field);
        }
    }
    manifest
}

fn object_record(object: &DynamicObject, api_resource: &ApiResource) -> ObjectRecord {
    let types = object.types.as_ref();
    let spec = object.data.get("spec");

    ObjectRecord {
        reference: ResourceRef {
            name: object.name_any(),
            kind: types
                .map(|types| types.kind.clone())
                .filter(|kind| !kind.is_empty())
                .unwrap_or_else(|| api_resource.kind.clone()),
            namespace: object.namespace(),
            uid: object.uid().unwrap_or_default(),
        },
        api_version: types
            .map(|types| types.api_version.clone())
            .filter(|api_version| !api_version.is_empty())
            .unwrap_or_else(|| api_resource.api_version.clone()),
        owners: object
            .owner_references()
            .iter()
            .map(|owner| OwnerRef {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: owner.controller.unwrap_or(false),
            })
            .collect(),
        labels: object.labels().clone(),
        annotations: object.annotations().clone(),
        selector: spec
            .and_then(|spec| spec.get("selector"))
            .map(selector_labels)
            .unwrap_or_default(),
        replicas: spec
            .and_then(|spec| spec.get("replicas"))
            .and_then(Value::as_i64),
    }
}

/// Workloads nest labels under `matchLabels`; services keep them flat.
fn selector_labels(selector: &Value) -> BTreeMap<String, String> {
    let labels = selector.get("matchLabels").unwrap_or(selector);
    labels
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn generic_instance(object: &DynamicObject, kind: &str) -> ResourceInstance {
    ResourceInstance {
        name: object.name_any(),
        namespace: object.namespace(),
        kind: kind.to_string(),
        age: human_age(object.metadata.creation_timestamp.as_ref()),
        details: InstanceDetails::Generic,
    }
}

fn pod_instance(pod: Pod) -> ResourceInstance {
    let (ready, total, restarts) = pod_readiness(&pod);
    ResourceInstance {
        name: pod.name_any(),
        namespace: pod.namespace(),
        kind: "Pod".to_string(),
        age: human_age(pod.metadata.creation_timestamp.as_ref()),
        details: InstanceDetails::Pod {
            status: pod_status(&pod),
            ready: format!("{ready}/{total}"),
            restarts,
            containers: container_names(&pod),
        },
    }
}

fn deployment_instance(deployment: Deployment) -> ResourceInstance {
    let status = deployment.status.clone().unwrap_or_default();
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .filter(|replicas| *replicas > 0)
        .or(status.replicas)
        .unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    ResourceInstance {
        name: deployment.name_any(),
        namespace: deployment.namespace(),
        kind: "Deployment".to_string(),
        age: human_age(deployment.metadata.creation_timestamp.as_ref()),
        details: InstanceDetails::Deployment {
            ready: format!("{available}/{replicas}"),
            up_to_date: i64::from(status.updated_replicas.unwrap_or(0)),
            available: i64::from(available),
        },
    }
}

/// The phase, unless the pod is terminating or a container reports a waiting/terminated reason.
fn pod_status(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }

    let status = pod.status.as_ref();
    for container in status
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or(&[])
    {
        let Some(state) = container.state.as_ref() else {
            continue;
        };
        if let Some(waiting) = state.waiting.as_ref() {
            if let Some(reason) = waiting.reason.as_ref().filter(|reason| !reason.is_empty()) {
                return reason.clone();
            }
            continue;
        }
        if let Some(reason) = state
            .terminated
            .as_ref()
            .and_then(|terminated| terminated.reason.as_ref())
            .filter(|reason| !reason.is_empty())
        {
            return reason.clone();
        }
    }

    status
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Running init containers count toward both sides of the ratio.
fn pod_readiness(pod: &Pod) -> (usize, usize, i32) {
    let regular = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.len())
        .unwrap_or(0);
    let status = pod.status.as_ref();
    let container_statuses = status
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or(&[]);
    let running_init = status
        .and_then(|status| status.init_container_statuses.as_deref())
        .unwrap_or(&[])
        .iter()
        .filter(|container| {
            container
                .state
                .as_ref()
                .is_some_and(|state| state.running.is_some())
        })
        .collect::<Vec<_>>();

    let total = regular + running_init.len();
    let ready = container_statuses
        .iter()
        .filter(|container| container.ready)
        .count()
        + running_init
            .iter()
            .filter(|container| container.ready)
            .count();
    let restarts = container_statuses
        .iter()
        .map(|container| container.restart_count)
        .sum();

    (ready, total, restarts)
}

fn container_names(pod: &Pod) -> Vec<String> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.init_containers
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .chain(spec.containers.iter())
        .map(|container| container.name.clone())
        .collect()
}

fn is_control_plane(node: &Node) -> bool {
    let labels = node.labels();
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| labels.contains_key(*label))
        || labels.get("kubernetes.io/role").map(String::as_str) == Some("master")
}

fn internal_ips(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|address| address.type_ == "InternalIP" && !address.address.is_empty())
                .map(|address| address.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn event_record(event: &Event) -> EventRecord {
    let from = event
        .reporting_component
        .clone()
        .filter(|component| !component.is_empty())
        .or_else(|| {
            event
                .source
                .as_ref()
                .and_then(|source| source.component.clone())
        })
        .unwrap_or_default();

    EventRecord {
        event_type: event.type_.clone().unwrap_or_default(),
        reason: event.reason.clone().unwrap_or_default(),
        age: event_age(event),
        from,
        message: event.message.clone().unwrap_or_default(),
    }
}

fn event_age(event: &Event) -> String {
    if let Some(event_time) = event.event_time.as_ref() {
        return human_age_timestamp(event_time.0);
    }

    if let Some(last_timestamp) = event.last_timestamp.as_ref() {
        return human_age(Some(last_timestamp));
    }

    human_age(event.first_timestamp.as_ref())
}

fn human_age(timestamp: Option<&Time>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };

    human_age_timestamp(timestamp.0)
}

fn human_age_timestamp(ts: k8s_openapi::jiff::Timestamp) -> String {
    format_elapsed_seconds(k8s_openapi::jiff::Timestamp::now().as_second() - ts.as_second())
}

#[cfg(test)]
mod tests {
    use super::{
        cluster_infos, find_resource, merge_kubeconfigs, pod_readiness, pod_status,
        scan_kube_dir, selector_labels, strip_server_fields,
    };
    use crate::model::{ApiResourceInfo, ApiResourceMap};
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;
    use std::fs;

    fn kubeconfig_yaml(name: &str, namespace: &str) -> String {
        format!(
            "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: https://{name}.example:6443\ncontexts:\n- name: {name}\n  context:\n    cluster: {name}\n    user: {name}-admin\n    namespace: {namespace}\nusers:\n- name: {name}-admin\n  user:\n    token: secret\ncurrent-context: {name}\n"
        )
    }

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).expect("pod")
    }

    #[test]
    fn scattered_kubeconfigs_merge_and_junk_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("alpha"), kubeconfig_yaml("alpha", "apps")).expect("write");
        fs::write(dir.path().join("beta.yaml"), kubeconfig_yaml("beta", "batch")).expect("write");
        fs::write(dir.path().join("notes.txt"), "just some notes").expect("write");
        fs::write(dir.path().join(".hidden"), kubeconfig_yaml("hidden", "x")).expect("write");
        fs::create_dir(dir.path().join("cache")).expect("mkdir");

        let paths = scan_kube_dir(dir.path());
        assert_eq!(paths.len(), 3);

        let merged = merge_kubeconfigs(&paths).expect("merged");
        assert_eq!(merged.current_context.as_deref(), Some("alpha"));

        let clusters = cluster_infos(&merged);
        assert_eq!(clusters.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(clusters["beta"].namespace.as_deref(), Some("batch"));
        assert_eq!(clusters["beta"].user.as_deref(), Some("beta-admin"));
        assert_eq!(
            clusters["alpha"].server.as_deref(),
            Some("https://alpha.example:6443")
        );
    }

    #[test]
    fn empty_kube_dir_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(merge_kubeconfigs(&scan_kube_dir(dir.path())).is_none());
    }

    #[test]
    fn waiting_reason_overrides_phase() {
        let crashing = pod(json!({
            "metadata": {"name": "api"},
            "spec": {"containers": [{"name": "api"}]},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "api", "image": "api", "imageID": "", "ready": false, "restartCount": 4,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        }));
        assert_eq!(pod_status(&crashing), "CrashLoopBackOff");

        let leaving = pod(json!({
            "metadata": {"name": "api", "deletionTimestamp": "2024-01-01T00:00:00Z"},
            "status": {"phase": "Running"}
        }));
        assert_eq!(pod_status(&leaving), "Terminating");
    }

    #[test]
    fn running_init_containers_count_toward_readiness() {
        let starting = pod(json!({
            "metadata": {"name": "web"},
            "spec": {"containers": [{"name": "web"}, {"name": "proxy"}]},
            "status": {
                "phase": "Pending",
                "initContainerStatuses": [
                    {"name": "sidecar", "image": "s", "imageID": "", "ready": true, "restartCount": 0,
                     "state": {"running": {}}},
                    {"name": "migrate", "image": "m", "imageID": "", "ready": false, "restartCount": 0,
                     "state": {"terminated": {"exitCode": 0, "reason": "Completed"}}}
                ],
                "containerStatuses": [
                    {"name": "web", "image": "w", "imageID": "", "ready": true, "restartCount": 2},
                    {"name": "proxy", "image": "p", "imageID": "", "ready": false, "restartCount": 1}
                ]
            }
        }));

        assert_eq!(pod_readiness(&starting), (2, 3, 3));
    }

    #[test]
    fn resource_lookup_prefers_core_group_and_requested_version() {
        let info = |name: &str, kind: &str, version: &str| ApiResourceInfo {
            name: name.to_string(),
            kind: kind.to_string(),
            version: version.to_string(),
            namespaced: true,
        };
        let mut resources = ApiResourceMap::new();
        resources.insert("v1".to_string(), vec![info("events", "Event", "v1")]);
        resources.insert(
            "events.k8s.io/v1".to_string(),
            vec![info("events", "Event", "events.k8s.io/v1")],
        );
        resources.insert(
            "apps/v1".to_string(),
            vec![info("replicasets", "ReplicaSet", "apps/v1")],
        );

        let core = find_resource(&resources, "events", None).expect("events");
        assert_eq!(core.api_resource.api_version, "v1");

        let grouped = find_resource(&resources, "Event", Some("events.k8s.io/v1")).expect("events");
        assert_eq!(grouped.api_resource.group, "events.k8s.io");

        let by_kind = find_resource(&resources, "ReplicaSet", None).expect("replicasets");
        assert_eq!(by_kind.api_resource.plural, "replicasets");
        assert!(find_resource(&resources, "widgets", None).is_none());
    }

    #[test]
    fn server_fields_are_removed_from_manifests() {
        let manifest = strip_server_fields(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "uid": "abc",
                "resourceVersion": "42",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [],
                "labels": {"app": "web"}
            }
        }));

        assert_eq!(
            manifest["metadata"],
            json!({"name": "settings", "labels": {"app": "web"}})
        );
    }

    #[test]
    fn selectors_read_match_labels_or_flat_maps() {
        assert_eq!(
            selector_labels(&json!({"matchLabels": {"app": "web"}})),
            [("app".to_string(), "web".to_string())].into()
        );
        assert_eq!(
            selector_labels(&json!({"app": "api", "tier": "backend"})).len(),
            2
        );
    }
}
