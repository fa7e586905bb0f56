use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::backend::ClusterBackend;
use crate::error::{EngineError, EngineResult};
use crate::model::{Cluster, Reachability, ReachabilityTransition};

pub const NO_CLUSTERS_MESSAGE: &str =
    "No Kubernetes clusters found. Please check your kubeconfig.";

/// Known clusters and their reachability.
///
/// Only the connectivity probe writes reachability; everything else reads.
pub struct ClusterRegistry {
    backend: Arc<dyn ClusterBackend>,
    clusters: RwLock<BTreeMap<String, Cluster>>,
}

impl ClusterRegistry {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self {
            backend,
            clusters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Re-reads the kubeconfig. Clusters that are still configured keep their reachability.
    pub async fn list_clusters(&self) -> EngineResult<BTreeMap<String, Cluster>> {
        let discovered = self
            .backend
            .get_clusters()
            .await
            .map_err(|error| EngineError::Config(format!("{error:#}")))?;

        let mut clusters = self.write();
        let mut refreshed = BTreeMap::new();
        for (name, info) in discovered {
            let entry = match clusters.remove(&name) {
                Some(mut known) => {
                    known.info = info;
                    known
                }
                None => Cluster::new(name.clone(), info),
            };
            refreshed.insert(name, entry);
        }

        for dropped in clusters.keys() {
            debug!("cluster {dropped} removed from configuration");
        }
        *clusters = refreshed;

        if clusters.is_empty() {
            info!("{NO_CLUSTERS_MESSAGE}");
        }
        Ok(clusters.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Cluster> {
        self.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Cluster> {
        self.read().get(name).cloned()
    }

    pub fn reachability(&self, name: &str) -> Option<Reachability> {
        self.read().get(name).map(|cluster| cluster.reachability)
    }

    /// Moves a never-probed cluster into `Checking`.
    pub fn begin_check(&self, name: &str) -> Option<ReachabilityTransition> {
        let mut clusters = self.write();
        let cluster = clusters.get_mut(name)?;
        if cluster.reachability != Reachability::Unknown {
            return None;
        }

        cluster.reachability = Reachability::Checking;
        Some(ReachabilityTransition {
            cluster: name.to_string(),
            from: Reachability::Unknown,
            to: Reachability::Checking,
        })
    }

    /// Last write wins; returns the transition when the state changed.
    pub fn record_probe(&self, name: &str, reachable: bool) -> Option<ReachabilityTransition> {
        let mut clusters = self.write();
        let cluster = clusters.get_mut(name)?;
        let next = if reachable {
            Reachability::Connected
        } else {
            Reachability::Disconnected
        };

        cluster.last_checked = Some(Utc::now());
        let previous = cluster.reachability;
        if previous == next {
            return None;
        }

        cluster.reachability = next;
        Some(ReachabilityTransition {
            cluster: name.to_string(),
            from: previous,
            to: next,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Cluster>> {
        self.clusters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Cluster>> {
        self.clusters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Renders the `clusters` listing, or the empty-kubeconfig notice.
pub fn cluster_table(clusters: &BTreeMap<String, Cluster>) -> String {
    if clusters.is_empty() {
        return NO_CLUSTERS_MESSAGE.to_string();
    }

    let mut table = format!("{:<32} {:<14} {:<16} SERVER", "CONTEXT", "STATUS", "NAMESPACE");
    for (name, cluster) in clusters {
        table.push_str(&format!(
            "\n{:<32} {:<14} {:<16} {}",
            name,
            cluster.reachability.label(),
            cluster.info.namespace.as_deref().unwrap_or("-"),
            cluster.info.server.as_deref().unwrap_or("-"),
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::{ClusterRegistry, NO_CLUSTERS_MESSAGE, cluster_table};
    use crate::error::EngineError;
    use crate::model::Reachability;
    use crate::testing::FakeBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn rescan_keeps_reachability_and_drops_removed_clusters() {
        let backend = Arc::new(FakeBackend::new().with_cluster("prod").with_cluster("stage"));
        let registry = ClusterRegistry::new(backend.clone());

        registry.list_clusters().await.expect("list");
        registry.record_probe("prod", true);

        backend.remove_cluster("stage");
        let clusters = registry.list_clusters().await.expect("list");

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters["prod"].reachability, Reachability::Connected);
    }

    #[tokio::test]
    async fn unreadable_kubeconfig_is_a_config_error() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_kubeconfig("invalid kubeconfig");
        let registry = ClusterRegistry::new(backend);

        let error = registry.list_clusters().await.expect_err("should fail");
        assert!(matches!(error, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn empty_kubeconfig_lists_no_clusters() {
        let registry = ClusterRegistry::new(Arc::new(FakeBackend::new()));
        assert!(registry.list_clusters().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn empty_listing_prints_the_kubeconfig_notice() {
        let registry = ClusterRegistry::new(Arc::new(FakeBackend::new()));
        registry.list_clusters().await.expect("list");

        assert_eq!(cluster_table(&registry.snapshot()), NO_CLUSTERS_MESSAGE);
    }

    #[tokio::test]
    async fn listing_has_one_row_per_cluster() {
        let registry = ClusterRegistry::new(Arc::new(FakeBackend::new().with_cluster("prod")));
        registry.list_clusters().await.expect("list");

        let table = cluster_table(&registry.snapshot());
        let rows: Vec<&str> = table.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("CONTEXT"));
        assert!(rows[1].starts_with("prod"));
        assert!(rows[1].contains("unknown"));
    }

    #[tokio::test]
    async fn transitions_are_reported_once_per_change() {
        let registry = ClusterRegistry::new(Arc::new(FakeBackend::new().with_cluster("prod")));
        registry.list_clusters().await.expect("list");

        let checking = registry.begin_check("prod").expect("transition");
        assert_eq!(checking.to, Reachability::Checking);
        assert!(registry.begin_check("prod").is_none());

        let connected = registry.record_probe("prod", true).expect("transition");
        assert_eq!(connected.from, Reachability::Checking);
        assert!(registry.record_probe("prod", true).is_none());

        let lost = registry.record_probe("prod", false).expect("transition");
        assert!(lost.lost_connection());
        assert!(registry.get("prod").and_then(|c| c.last_checked).is_some());
    }
}
