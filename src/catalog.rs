use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ClusterBackend, bounded};
use crate::error::EngineResult;
use crate::groups::GroupStore;
use crate::model::{ApiResourceMap, KindGroups};

pub struct ResourceCatalog {
    backend: Arc<dyn ClusterBackend>,
    groups: Arc<GroupStore>,
    request_timeout: Duration,
}

impl ResourceCatalog {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        groups: Arc<GroupStore>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            groups,
            request_timeout,
        }
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub async fn api_resources(&self, cluster: &str) -> EngineResult<ApiResourceMap> {
        bounded(
            cluster,
            "discover api resources",
            self.request_timeout,
            self.backend.get_api_resources(cluster),
        )
        .await
    }

    pub async fn list_kinds(&self, cluster: &str) -> EngineResult<BTreeSet<String>> {
        let resources = self.api_resources(cluster).await?;
        Ok(flatten_kinds(&resources))
    }

    /// Fetches the kind set and reconciles the user groups against it.
    pub async fn sync(&self, cluster: &str) -> EngineResult<KindGroups> {
        let kinds = self.list_kinds(cluster).await?;
        debug!("catalog for {cluster} has {} kinds", kinds.len());
        self.groups.reconcile(cluster, &kinds)
    }

    /// Re-syncs `cluster` every `every` and hands each fresh kind set to `on_sync`.
    pub fn spawn_resync<F>(
        self: Arc<Self>,
        cluster: String,
        every: Duration,
        cancel: CancellationToken,
        on_sync: F,
    ) -> JoinHandle<()>
    where
        F: Fn(BTreeSet<String>) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = tokio::select! {
                            _ = cancel.cancelled() => break,
                            outcome = self.list_kinds(&cluster) => outcome,
                        };
                        match outcome {
                            Ok(kinds) => {
                                if let Err(error) = self.groups.reconcile(&cluster, &kinds) {
                                    warn!("storing kind groups for {cluster} failed: {error}");
                                }
                                on_sync(kinds);
                            }
                            Err(error) => warn!("catalog resync for {cluster} failed: {error}"),
                        }
                    }
                }
            }
        })
    }
}

/// Fans the grouped discovery map into one set of resource names.
pub fn flatten_kinds(resources: &ApiResourceMap) -> BTreeSet<String> {
    resources
        .values()
        .flatten()
        .map(|resource| resource.name.to_ascii_lowercase())
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .collect()
}
