use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    ApiResourceMap, ClusterInfo, ContainerTarget, ObjectLocator, ObjectRecord, ResourceInstance,
    TerminalSize,
};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub age: String,
    pub from: String,
    pub message: String,
}

/// A running exec with a TTY attached.
pub struct ExecSession {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub resize: mpsc::Sender<TerminalSize>,
    /// Resolves when the remote process exits.
    pub completion: BoxFuture<'static, Result<()>>,
}

/// Everything the engine asks of a set of clusters.
///
/// Implementations report failures as `anyhow` errors with context; callers
/// bound every call with [`bounded`] which converts them into [`EngineError`].
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn get_clusters(&self) -> Result<BTreeMap<String, ClusterInfo>>;

    /// `Ok(true)` also for an authenticated-but-forbidden answer.
    async fn test_cluster_connectivity(&self, cluster: &str) -> Result<bool>;

    async fn get_namespaces(&self, cluster: &str) -> Result<Vec<String>>;

    async fn get_default_namespace(&self, cluster: &str) -> Result<String>;

    async fn get_api_resources(&self, cluster: &str) -> Result<ApiResourceMap>;

    async fn get_resources_in_namespace(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceInstance>>;

    async fn get_resource_yaml(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<String>;

    async fn apply_resource(&self, cluster: &str, yaml: &str) -> Result<()>;

    async fn delete_resource(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<()>;

    async fn get_events(
        &self,
        cluster: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<EventRecord>>;

    async fn fetch_object(&self, cluster: &str, locator: &ObjectLocator) -> Result<ObjectRecord>;

    async fn list_objects(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectRecord>>;

    async fn application_exists(&self, cluster: &str, namespace: &str, name: &str)
    -> Result<bool>;

    /// InternalIPs of the cluster's control-plane nodes.
    async fn control_plane_ips(&self, cluster: &str) -> Result<Vec<String>>;

    /// Server URLs of the Argo CD cluster secrets stored on `cluster`.
    async fn argocd_cluster_servers(&self, cluster: &str) -> Result<Vec<String>>;

    /// Init containers first, then regular containers.
    async fn pod_containers(&self, cluster: &str, namespace: &str, pod: &str)
    -> Result<Vec<String>>;

    async fn get_pod_container_logs(&self, target: &ContainerTarget) -> Result<String>;

    async fn stream_pod_logs(
        &self,
        target: &ContainerTarget,
    ) -> Result<BoxStream<'static, Result<String>>>;

    async fn exec(&self, target: &ContainerTarget, command: Vec<String>) -> Result<ExecSession>;

    /// Runs `command` without a TTY and returns its stdout once it exits.
    async fn exec_capture(&self, target: &ContainerTarget, command: Vec<String>) -> Result<String>;

    async fn get_secret_data(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>>;
}

/// Runs one backend call under a deadline and maps its failure into the engine taxonomy.
pub async fn bounded<T, F>(
    cluster: &str,
    operation: &str,
    limit: Duration,
    call: F,
) -> EngineResult<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(EngineError::from_anyhow(cluster, &error)),
        Err(_) => Err(EngineError::timeout(format!("{operation} on {cluster}"), limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::bounded;
    use crate::error::EngineError;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_call_times_out() {
        let result: Result<(), EngineError> =
            bounded("prod", "list pods", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let error = result.expect_err("call should time out");
        assert!(error.is_upstream());
        assert!(matches!(error, EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn bounded_call_maps_backend_error() {
        let result: Result<(), EngineError> =
            bounded("prod", "list pods", Duration::from_secs(1), async {
                Err(anyhow::anyhow!("forbidden"))
            })
            .await;

        assert_eq!(result, Err(EngineError::upstream("prod", "forbidden")));
    }
}
