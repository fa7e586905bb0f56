use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{ClusterBackend, bounded};
use crate::error::EngineResult;

pub struct NamespaceResolver {
    backend: Arc<dyn ClusterBackend>,
    request_timeout: Duration,
}

impl NamespaceResolver {
    pub fn new(backend: Arc<dyn ClusterBackend>, request_timeout: Duration) -> Self {
        Self {
            backend,
            request_timeout,
        }
    }

    pub async fn list_namespaces(&self, cluster: &str) -> EngineResult<Vec<String>> {
        bounded(
            cluster,
            "list namespaces",
            self.request_timeout,
            self.backend.get_namespaces(cluster),
        )
        .await
    }

    /// A previous selection wins while it still exists; otherwise the backend default.
    pub async fn default_namespace(
        &self,
        cluster: &str,
        previous: Option<&str>,
    ) -> EngineResult<String> {
        if let Some(previous) = previous.filter(|value| !value.is_empty()) {
            let namespaces = self.list_namespaces(cluster).await?;
            if namespaces.iter().any(|namespace| namespace == previous) {
                return Ok(previous.to_string());
            }
            debug!("namespace {previous} no longer exists on {cluster}, using default");
        }

        bounded(
            cluster,
            "resolve default namespace",
            self.request_timeout,
            self.backend.get_default_namespace(cluster),
        )
        .await
    }
}
