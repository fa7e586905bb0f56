use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

pub const DEFAULT_KIND: &str = "pods";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Unknown,
    Checking,
    Connected,
    Disconnected,
}

impl Reachability {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Kubeconfig context as the backend reports it.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: Option<String>,
    pub server: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub info: ClusterInfo,
    pub reachability: Reachability,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, info: ClusterInfo) -> Self {
        Self {
            name: name.into(),
            info,
            reachability: Reachability::Unknown,
            last_checked: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReachabilityTransition {
    pub cluster: String,
    pub from: Reachability,
    pub to: Reachability,
}

impl ReachabilityTransition {
    pub fn lost_connection(&self) -> bool {
        self.from == Reachability::Connected && self.to == Reachability::Disconnected
    }
}

/// Behaviour a kind gets beyond list/yaml/apply/delete/events/dependencies.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceCapability {
    Resource,
    PodResource,
    SecretResource,
}

impl ResourceCapability {
    pub fn for_kind(kind: &str) -> Self {
        match canonical_kind(kind).as_str() {
            "pods" => Self::PodResource,
            "secrets" => Self::SecretResource,
            _ => Self::Resource,
        }
    }

    pub fn supports_logs(self) -> bool {
        matches!(self, Self::PodResource)
    }

    pub fn supports_terminal(self) -> bool {
        matches!(self, Self::PodResource)
    }

    pub fn supports_decode(self) -> bool {
        matches!(self, Self::SecretResource)
    }
}

/// Normalises kubectl-style short names to the plural resource name.
/// Unknown tokens are lowercased and passed through.
pub fn canonical_kind(token: &str) -> String {
    let lowered = token.trim().to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "po" | "pod" | "pods" => "pods",
        "cj" | "cronjob" | "cronjobs" | "cron-job" | "cron-jobs" => "cronjobs",
        "ds" | "daemonset" | "daemonsets" | "daemon-set" | "daemon-sets" => "daemonsets",
        "deploy" | "deployment" | "deployments" | "dp" => "deployments",
        "rs" | "replicaset" | "replicasets" | "replica-set" | "replica-sets" => "replicasets",
        "rc" | "replicationcontroller" | "replicationcontrollers" => "replicationcontrollers",
        "sts" | "statefulset" | "statefulsets" => "statefulsets",
        "job" | "jobs" => "jobs",
        "svc" | "service" | "services" => "services",
        "ing" | "ingress" | "ingresses" => "ingresses",
        "ingclass" | "ingressclass" | "ingressclasses" => "ingressclasses",
        "cm" | "configmap" | "configmaps" | "config-map" | "config-maps" => "configmaps",
        "pvc" | "persistentvolumeclaim" | "persistentvolumeclaims" => "persistentvolumeclaims",
        "secret" | "secrets" => "secrets",
        "sc" | "storageclass" | "storageclasses" => "storageclasses",
        "pv" | "persistentvolume" | "persistentvolumes" => "persistentvolumes",
        "sa" | "serviceaccount" | "serviceaccounts" => "serviceaccounts",
        "role" | "roles" => "roles",
        "rb" | "rolebinding" | "rolebindings" => "rolebindings",
        "crole" | "clusterrole" | "clusterroles" => "clusterroles",
        "crb" | "clusterrolebinding" | "clusterrolebindings" => "clusterrolebindings",
        "np" | "netpol" | "networkpolicy" | "networkpolicies" => "networkpolicies",
        "hpa" | "horizontalpodautoscaler" | "horizontalpodautoscalers" => {
            "horizontalpodautoscalers"
        }
        "pdb" | "poddisruptionbudget" | "poddisruptionbudgets" => "poddisruptionbudgets",
        "ep" | "endpoint" | "endpoints" => "endpoints",
        "endpointslice" | "endpointslices" => "endpointslices",
        "node" | "nodes" | "no" => "nodes",
        "event" | "events" | "ev" => "events",
        "ns" | "namespace" | "namespaces" => "namespaces",
        "crd" | "crds" | "customresourcedefinition" | "customresourcedefinitions" => {
            "customresourcedefinitions"
        }
        other => return other.to_string(),
    };
    canonical.to_string()
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub namespaced: bool,
}

/// API group/version → listable resources in it.
pub type ApiResourceMap = BTreeMap<String, Vec<ApiResourceInfo>>;

/// The fixed identity a watcher subscription polls.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WatchKey {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
}

impl WatchKey {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            kind: kind.into(),
        }
    }
}

impl Display for WatchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.kind)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InstanceDetails {
    Generic,
    Pod {
        status: String,
        ready: String,
        restarts: i32,
        containers: Vec<String>,
    },
    Deployment {
        ready: String,
        up_to_date: i64,
        available: i64,
    },
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ResourceInstance {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub age: String,
    pub details: InstanceDetails,
}

impl ResourceInstance {
    pub fn generic(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            kind: kind.into(),
            age: "-".to_string(),
            details: InstanceDetails::Generic,
        }
    }

    pub fn status(&self) -> Option<&str> {
        match &self.details {
            InstanceDetails::Pod { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn matches_filter(&self, query: &str) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return true;
        }

        let query_lower = query.to_ascii_lowercase();

        if self.name.to_ascii_lowercase().contains(&query_lower) {
            return true;
        }

        if let Some(namespace) = &self.namespace
            && namespace.to_ascii_lowercase().contains(&query_lower)
        {
            return true;
        }

        if self.kind.to_ascii_lowercase().contains(&query_lower) {
            return true;
        }

        self.status()
            .is_some_and(|status| status.to_ascii_lowercase().contains(&query_lower))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub uid: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub name: String,
    pub namespace: String,
    /// Management cluster hosting the Application.
    pub cluster: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

/// How to address one object: `kind` is a plural resource name or a Kind.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ObjectLocator {
    pub kind: String,
    pub api_version: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectLocator {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            api_version: None,
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        let api_version = api_version.into();
        self.api_version = (!api_version.is_empty()).then_some(api_version);
        self
    }
}

/// The slice of an object the dependency walk needs.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ObjectRecord {
    pub reference: ResourceRef,
    pub api_version: String,
    pub owners: Vec<OwnerRef>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub replicas: Option<i64>,
}

impl ObjectRecord {
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owners.iter().any(|owner| owner.uid == uid)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct DependencyChain {
    pub applications: Vec<ApplicationRef>,
    pub ancestors: Vec<ResourceRef>,
    pub current: ResourceRef,
    pub descendants: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChainEntry<'a> {
    Application(&'a ApplicationRef),
    Ancestor(&'a ResourceRef),
    Current(&'a ResourceRef),
    Descendant(&'a ResourceRef),
}

impl DependencyChain {
    pub fn new(current: ResourceRef) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.applications.len() + self.ancestors.len() + 1 + self.descendants.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn has_relations(&self) -> bool {
        self.len() > 1
    }

    /// Applications, then ancestors root-most first, current, descendants nearest first.
    pub fn entries(&self) -> Vec<ChainEntry<'_>> {
        let mut entries = Vec::with_capacity(self.len());
        entries.extend(self.applications.iter().map(ChainEntry::Application));
        entries.extend(self.ancestors.iter().map(ChainEntry::Ancestor));
        entries.push(ChainEntry::Current(&self.current));
        entries.extend(self.descendants.iter().map(ChainEntry::Descendant));
        entries
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ContainerTarget {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Display for ContainerTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.cluster, self.namespace, self.pod, self.container
        )
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: u64,
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.cluster, self.namespace, self.kind)
    }

    pub fn same_target(&self, cluster: &str, namespace: &str, kind: &str) -> bool {
        self.cluster == cluster && self.namespace == namespace && self.kind == kind
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecentKind {
    pub kind: String,
    pub hits: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct KindGroups {
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub uncategorized: Vec<String>,
}

impl Default for KindGroups {
    fn default() -> Self {
        let seed: [(&str, &[&str]); 8] = [
            (
                "Workloads",
                &[
                    "pods",
                    "deployments",
                    "statefulsets",
                    "daemonsets",
                    "replicasets",
                    "cronjobs",
                    "jobs",
                    "horizontalpodautoscalers",
                ],
            ),
            (
                "Network",
                &[
                    "services",
                    "ingresses",
                    "networkpolicies",
                    "endpoints",
                    "endpointslices",
                    "ingressclasses",
                ],
            ),
            (
                "Storage",
                &[
                    "persistentvolumes",
                    "persistentvolumeclaims",
                    "storageclasses",
                    "csistoragecapacities",
                ],
            ),
            ("Config", &["configmaps", "leases"]),
            ("Secrets", &["secrets"]),
            (
                "Access Control",
                &[
                    "roles",
                    "rolebindings",
                    "clusterroles",
                    "clusterrolebindings",
                    "serviceaccounts",
                ],
            ),
            (
                "Policy",
                &[
                    "poddisruptionbudgets",
                    "validatingadmissionpolicies",
                    "validatingadmissionpolicybindings",
                    "validatingwebhookconfigurations",
                    "mutatingwebhookconfigurations",
                    "resourcequotas",
                    "limitranges",
                ],
            ),
            (
                "Cluster",
                &[
                    "namespaces",
                    "nodes",
                    "events",
                    "customresourcedefinitions",
                    "runtimeclasses",
                    "priorityclasses",
                    "flowschemas",
                    "prioritylevelconfigurations",
                ],
            ),
        ];

        Self {
            groups: seed
                .into_iter()
                .map(|(name, kinds)| {
                    (
                        name.to_string(),
                        kinds.iter().map(|kind| kind.to_string()).collect(),
                    )
                })
                .collect(),
            uncategorized: Vec::new(),
        }
    }
}

impl KindGroups {
    pub fn group_of(&self, kind: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, kinds)| kinds.iter().any(|member| member == kind))
            .map(|(name, _)| name.as_str())
    }
}

pub fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{}s", seconds.max(0))
}

#[cfg(test)]
mod tests {
    use super::{
        DependencyChain, InstanceDetails, ResourceCapability, ResourceInstance, ResourceRef,
        canonical_kind, format_elapsed_seconds,
    };

    #[test]
    fn kind_aliases_map_to_plural_names() {
        assert_eq!(canonical_kind("po"), "pods");
        assert_eq!(canonical_kind("Deploy"), "deployments");
        assert_eq!(canonical_kind("svc"), "services");
        assert_eq!(canonical_kind("cm"), "configmaps");
        assert_eq!(canonical_kind("pvc"), "persistentvolumeclaims");
        assert_eq!(canonical_kind("crb"), "clusterrolebindings");
        assert_eq!(canonical_kind("np"), "networkpolicies");
        assert_eq!(canonical_kind("Widgets"), "widgets");
    }

    #[test]
    fn capability_factory_is_keyed_on_kind() {
        assert_eq!(
            ResourceCapability::for_kind("pods"),
            ResourceCapability::PodResource
        );
        assert_eq!(
            ResourceCapability::for_kind("secret"),
            ResourceCapability::SecretResource
        );
        assert_eq!(
            ResourceCapability::for_kind("deployments"),
            ResourceCapability::Resource
        );
        assert!(ResourceCapability::PodResource.supports_terminal());
        assert!(!ResourceCapability::Resource.supports_logs());
        assert!(ResourceCapability::SecretResource.supports_decode());
    }

    #[test]
    fn filter_matches_name_namespace_and_status() {
        let pod = ResourceInstance {
            name: "api-7d9f".to_string(),
            namespace: Some("payments".to_string()),
            kind: "Pod".to_string(),
            age: "3m".to_string(),
            details: InstanceDetails::Pod {
                status: "CrashLoopBackOff".to_string(),
                ready: "0/1".to_string(),
                restarts: 4,
                containers: vec!["api".to_string()],
            },
        };

        assert!(pod.matches_filter(""));
        assert!(pod.matches_filter("API"));
        assert!(pod.matches_filter("pay"));
        assert!(pod.matches_filter("crashloop"));
        assert!(!pod.matches_filter("worker"));
    }

    #[test]
    fn chain_with_only_current_has_length_one() {
        let chain = DependencyChain::new(ResourceRef {
            name: "web-0".to_string(),
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            uid: "u1".to_string(),
        });
        assert_eq!(chain.len(), 1);
        assert!(!chain.has_relations());
        assert_eq!(chain.entries().len(), 1);
    }

    #[test]
    fn elapsed_seconds_render_in_largest_unit() {
        assert_eq!(format_elapsed_seconds(42), "42s");
        assert_eq!(format_elapsed_seconds(125), "2m");
        assert_eq!(format_elapsed_seconds(7_300), "2h");
        assert_eq!(format_elapsed_seconds(190_000), "2d");
        assert_eq!(format_elapsed_seconds(-5), "0s");
    }
}
