use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, bounded};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    ApplicationRef, DependencyChain, ObjectLocator, ObjectRecord, OwnerRef, ResourceRef,
};
use crate::registry::ClusterRegistry;

pub const TRACKING_ID_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

const MAX_OWNER_DEPTH: usize = 16;
const MAX_DESCENDANT_DEPTH: usize = 2;
const DESCENDANT_KINDS: [&str; 5] = ["pods", "replicasets", "services", "configmaps", "secrets"];
const ARGOCD_NAMESPACE: &str = "argocd";

/// Application named by an Argo CD tracking id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TrackedApplication {
    pub namespace: String,
    pub name: String,
}

/// Parses `ns_app:group/Kind:...` or `parent:argoproj.io/Application:...`.
pub fn parse_tracking_id(value: &str) -> Option<TrackedApplication> {
    let (instance, _) = value.trim().split_once(':')?;
    if instance.is_empty() {
        return None;
    }

    if value.contains("argoproj.io/Application:") || value.contains("argoproj.io/ApplicationSet:") {
        return Some(TrackedApplication {
            namespace: ARGOCD_NAMESPACE.to_string(),
            name: instance.to_string(),
        });
    }

    let (namespace, name) = instance.split_once('_')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(TrackedApplication {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ManagedServer {
    Address(IpAddr),
    /// `kubernetes.default.svc`: the cluster that stores the secret.
    InCluster,
}

/// Which clusters run Argo CD, and which API servers they manage.
#[derive(Debug, Default)]
struct ManagementIndex {
    managed: BTreeMap<String, Vec<ManagedServer>>,
}

impl ManagementIndex {
    fn management_for(&self, workload: &str, workload_ips: &HashSet<IpAddr>) -> Option<String> {
        self.managed
            .iter()
            .find(|(management, servers)| {
                servers.iter().any(|server| match server {
                    ManagedServer::Address(ip) => workload_ips.contains(ip),
                    ManagedServer::InCluster => management.as_str() == workload,
                })
            })
            .map(|(management, _)| management.clone())
    }
}

/// Host part of an API server URL, without scheme, path or port.
pub fn server_host(url: &str) -> &str {
    let rest = url.trim();
    let rest = rest
        .strip_prefix("https://")
        .or_else(|| rest.strip_prefix("http://"))
        .unwrap_or(rest);
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

async fn resolve_server(url: &str) -> Option<ManagedServer> {
    let host = server_host(url);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ManagedServer::Address(ip));
    }

    if host == "kubernetes.default.svc" || host.ends_with(".default.svc") {
        return Some(ManagedServer::InCluster);
    }

    match tokio::net::lookup_host((host, 443)).await {
        Ok(mut addresses) => addresses
            .map(|address| address.ip())
            .find(IpAddr::is_ipv4)
            .map(ManagedServer::Address),
        Err(error) => {
            debug!("failed to resolve api server host {host}: {error}");
            None
        }
    }
}

pub struct DependencyResolver {
    backend: Arc<dyn ClusterBackend>,
    registry: Arc<ClusterRegistry>,
    request_timeout: Duration,
    management: Mutex<Option<Arc<ManagementIndex>>>,
}

impl DependencyResolver {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        registry: Arc<ClusterRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            request_timeout,
            management: Mutex::new(None),
        }
    }

    /// Drops the cached Argo CD topology; the next resolve rebuilds it.
    pub async fn forget_management_index(&self) {
        *self.management.lock().await = None;
    }

    /// A chain holding only `current` means "no relations", not failure.
    ///
    /// Only failing to fetch the object itself is an error; every later
    /// lookup degrades to partial data.
    pub async fn resolve(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<DependencyChain> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Aborted),
            chain = self.resolve_chain(cluster, kind, namespace, name) => chain,
        }
    }

    async fn resolve_chain(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> EngineResult<DependencyChain> {
        let scope = (!namespace.is_empty()).then_some(namespace);
        let current = self
            .fetch(cluster, &ObjectLocator::new(kind, scope, name))
            .await?;

        let mut chain = DependencyChain::new(current.reference.clone());
        chain.ancestors = self.ancestors(cluster, &current).await;
        chain.descendants = self.descendants(cluster, &current).await;
        chain.applications = self.applications(cluster, &current).await;

        debug!(
            "resolved {} {}: {} applications, {} ancestors, {} descendants",
            chain.current.kind,
            chain.current.name,
            chain.applications.len(),
            chain.ancestors.len(),
            chain.descendants.len()
        );
        Ok(chain)
    }

    /// Owner walk, root-most first.
    async fn ancestors(&self, cluster: &str, current: &ObjectRecord) -> Vec<ResourceRef> {
        let namespace = current.reference.namespace.clone();
        let mut visited = HashSet::from([current.reference.uid.clone()]);
        let mut ancestors = Vec::new();
        let mut cursor = current.clone();

        loop {
            let Some(owner) = primary_owner(&cursor.owners) else {
                break;
            };

            if ancestors.len() >= MAX_OWNER_DEPTH {
                warn!(
                    "owner chain of {} {} exceeds {MAX_OWNER_DEPTH} levels, truncating",
                    current.reference.kind, current.reference.name
                );
                break;
            }

            if !visited.insert(owner.uid.clone()) {
                warn!(
                    "owner cycle at {} {} (uid {}), truncating",
                    owner.kind, owner.name, owner.uid
                );
                break;
            }

            let locator = ObjectLocator::new(&owner.kind, namespace.as_deref(), &owner.name)
                .with_api_version(&owner.api_version);
            match self.fetch(cluster, &locator).await {
                Ok(record) => {
                    ancestors.push(record.reference.clone());
                    cursor = record;
                }
                Err(error) => {
                    debug!("owner {} {} not fetched: {error}", owner.kind, owner.name);
                    ancestors.push(ResourceRef {
                        name: owner.name.clone(),
                        kind: owner.kind.clone(),
                        namespace: namespace.clone(),
                        uid: owner.uid.clone(),
                    });
                    break;
                }
            }
        }

        ancestors.reverse();
        ancestors
    }

    async fn descendants(&self, cluster: &str, current: &ObjectRecord) -> Vec<ResourceRef> {
        let Some(namespace) = current.reference.namespace.as_deref() else {
            return Vec::new();
        };

        let found = match current.reference.kind.to_ascii_lowercase().as_str() {
            "service" => self.service_descendants(cluster, namespace, current).await,
            "deployment" => self.deployment_descendants(cluster, namespace, current).await,
            _ => self.owned_descendants(cluster, namespace, current).await,
        };

        let mut seen = HashSet::from([current.reference.uid.clone()]);
        found
            .into_iter()
            .filter(|reference| {
                let fresh = reference.uid.is_empty() || seen.insert(reference.uid.clone());
                if !fresh {
                    warn!(
                        "dropping repeated descendant {} {} of {}",
                        reference.kind, reference.name, current.reference.name
                    );
                }
                fresh
            })
            .collect()
    }

    async fn service_descendants(
        &self,
        cluster: &str,
        namespace: &str,
        service: &ObjectRecord,
    ) -> Vec<ResourceRef> {
        let name = &service.reference.name;
        let mut found = Vec::new();

        match self
            .fetch(cluster, &ObjectLocator::new("endpoints", Some(namespace), name))
            .await
        {
            Ok(endpoints) => found.push(endpoints.reference),
            Err(error) => debug!("no endpoints for service {name}: {error}"),
        }

        let slice_selector = format!("{SERVICE_NAME_LABEL}={name}");
        found.extend(
            self.list(cluster, namespace, "endpointslices", Some(&slice_selector))
                .await
                .into_iter()
                .map(|slice| slice.reference),
        );

        if !service.selector.is_empty() {
            let pod_selector = selector_query(&service.selector);
            found.extend(
                self.list(cluster, namespace, "pods", Some(&pod_selector))
                    .await
                    .into_iter()
                    .map(|pod| pod.reference),
            );
        }

        found
    }

    async fn deployment_descendants(
        &self,
        cluster: &str,
        namespace: &str,
        deployment: &ObjectRecord,
    ) -> Vec<ResourceRef> {
        let replica_sets = self.list(cluster, namespace, "replicasets", None).await;
        let Some(active) = replica_sets
            .into_iter()
            .filter(|replica_set| replica_set.is_owned_by(&deployment.reference.uid))
            .filter(|replica_set| replica_set.replicas.unwrap_or(0) > 0)
            .max_by_key(|replica_set| replica_set.replicas.unwrap_or(0))
        else {
            return Vec::new();
        };

        let pods = self.list(cluster, namespace, "pods", None).await;
        let mut found = vec![active.reference.clone()];
        found.extend(
            pods.into_iter()
                .filter(|pod| pod.is_owned_by(&active.reference.uid))
                .map(|pod| pod.reference),
        );
        found
    }

    /// Breadth-first over owner references among common namespaced kinds.
    async fn owned_descendants(
        &self,
        cluster: &str,
        namespace: &str,
        current: &ObjectRecord,
    ) -> Vec<ResourceRef> {
        let listed = join_all(
            DESCENDANT_KINDS
                .iter()
                .map(|kind| self.list(cluster, namespace, kind, None)),
        )
        .await
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        let mut visited = HashSet::from([current.reference.uid.clone()]);
        let mut frontier = vec![current.reference.clone()];
        let mut found = Vec::new();

        for _ in 0..MAX_DESCENDANT_DEPTH {
            let mut next = Vec::new();
            for record in &listed {
                let owned = frontier.iter().any(|owner| record.is_owned_by(&owner.uid));
                if owned && visited.insert(record.reference.uid.clone()) {
                    found.push(record.reference.clone());
                    next.push(record.reference.clone());
                }
            }

            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        // ReplicaSets on the last level still bring their Pods.
        let replica_sets = frontier
            .iter()
            .filter(|reference| reference.kind == "ReplicaSet")
            .collect::<Vec<_>>();
        if !replica_sets.is_empty() {
            for record in &listed {
                let pod_of_set = record.reference.kind == "Pod"
                    && replica_sets
                        .iter()
                        .any(|replica_set| record.is_owned_by(&replica_set.uid));
                if pod_of_set && visited.insert(record.reference.uid.clone()) {
                    found.push(record.reference.clone());
                }
            }
        }

        found
    }

    async fn applications(&self, cluster: &str, current: &ObjectRecord) -> Vec<ApplicationRef> {
        let Some(tracking_id) = current.annotations.get(TRACKING_ID_ANNOTATION) else {
            return Vec::new();
        };
        let Some(tracked) = parse_tracking_id(tracking_id) else {
            debug!("unparseable tracking id on {}: {tracking_id}", current.reference.name);
            return Vec::new();
        };
        let Some(management) = self.management_cluster_for(cluster).await else {
            debug!("no management cluster found for {cluster}");
            return Vec::new();
        };

        let exists = bounded(
            &management,
            "look up application",
            self.request_timeout,
            self.backend
                .application_exists(&management, &tracked.namespace, &tracked.name),
        )
        .await;

        match exists {
            Ok(true) => {
                info!(
                    "{} {} belongs to application {}/{} on {management}",
                    current.reference.kind, current.reference.name, tracked.namespace, tracked.name
                );
                vec![ApplicationRef {
                    name: tracked.name,
                    namespace: tracked.namespace,
                    cluster: management,
                }]
            }
            Ok(false) => Vec::new(),
            Err(error) => {
                warn!("application lookup failed: {error}");
                Vec::new()
            }
        }
    }

    async fn management_cluster_for(&self, workload: &str) -> Option<String> {
        let index = self.management_index().await;
        if index.managed.is_empty() {
            return None;
        }

        let workload_ips = match bounded(
            workload,
            "list control-plane addresses",
            self.request_timeout,
            self.backend.control_plane_ips(workload),
        )
        .await
        {
            Ok(ips) => ips
                .iter()
                .filter_map(|ip| ip.parse::<IpAddr>().ok())
                .collect::<HashSet<_>>(),
            Err(error) => {
                debug!("control-plane addresses unavailable: {error}");
                HashSet::new()
            }
        };

        index.management_for(workload, &workload_ips)
    }

    async fn management_index(&self) -> Arc<ManagementIndex> {
        let mut cached = self.management.lock().await;
        if let Some(index) = cached.as_ref() {
            return index.clone();
        }

        let names = self.registry.names();
        let discovered = join_all(names.iter().map(|name| async move {
            let servers = bounded(
                name,
                "list argo cd cluster secrets",
                self.request_timeout,
                self.backend.argocd_cluster_servers(name),
            )
            .await
            .unwrap_or_default();

            let mut resolved = Vec::new();
            for server in &servers {
                if let Some(target) = resolve_server(server).await {
                    resolved.push(target);
                }
            }
            (name.clone(), resolved)
        }))
        .await;

        let index = Arc::new(ManagementIndex {
            managed: discovered
                .into_iter()
                .filter(|(_, servers)| !servers.is_empty())
                .collect(),
        });
        info!("found {} argo cd management clusters", index.managed.len());
        *cached = Some(index.clone());
        index
    }

    async fn fetch(&self, cluster: &str, locator: &ObjectLocator) -> EngineResult<ObjectRecord> {
        bounded(
            cluster,
            &format!("get {} {}", locator.kind, locator.name),
            self.request_timeout,
            self.backend.fetch_object(cluster, locator),
        )
        .await
    }

    async fn list(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        label_selector: Option<&str>,
    ) -> Vec<ObjectRecord> {
        let listed = bounded(
            cluster,
            &format!("list {kind}"),
            self.request_timeout,
            self.backend
                .list_objects(cluster, namespace, kind, label_selector),
        )
        .await;

        listed.unwrap_or_else(|error| {
            debug!("skipping {kind} while resolving dependencies: {error}");
            Vec::new()
        })
    }
}

/// Controller owner first, otherwise the first listed owner.
fn primary_owner(owners: &[OwnerRef]) -> Option<&OwnerRef> {
    owners
        .iter()
        .find(|owner| owner.controller)
        .or_else(|| owners.first())
}

pub fn selector_query(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
