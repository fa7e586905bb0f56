use std::time::Duration;
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The kubeconfig could not be read or parsed.
    #[error("cluster configuration unavailable: {0}")]
    Config(String),

    /// A call against one cluster failed.
    #[error("{cluster}: {message}")]
    Upstream { cluster: String, message: String },

    /// A cluster call did not finish in time. Handled like `Upstream`.
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The call was cancelled by a key switch or a closed session.
    #[error("operation aborted")]
    Aborted,

    #[error("unknown session {0}")]
    UnknownSession(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to persist {path}: {message}")]
    Persistence { path: String, message: String },
}

impl EngineError {
    pub fn upstream(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Wraps a backend error with its full cause chain.
    pub fn from_anyhow(cluster: &str, error: &anyhow::Error) -> Self {
        Self::upstream(cluster, format!("{error:#}"))
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Timeout { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;
    use std::time::Duration;

    #[test]
    fn timeout_counts_as_upstream_failure() {
        let error = EngineError::timeout("poll pods", Duration::from_secs(10));
        assert!(error.is_upstream());
        assert_eq!(error.to_string(), "poll pods timed out after 10s");
    }

    #[test]
    fn aborted_is_not_an_upstream_failure() {
        assert!(!EngineError::Aborted.is_upstream());
        assert!(EngineError::Aborted.is_aborted());
    }

    #[test]
    fn anyhow_chain_is_kept_in_message() {
        let error = anyhow::anyhow!("connection refused").context("failed to list pods");
        let wrapped = EngineError::from_anyhow("prod", &error);
        assert_eq!(
            wrapped.to_string(),
            "prod: failed to list pods: connection refused"
        );
    }
}
