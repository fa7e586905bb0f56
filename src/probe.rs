use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ClusterBackend;
use crate::model::ReachabilityTransition;
use crate::registry::ClusterRegistry;

type ProbeFuture = Shared<BoxFuture<'static, bool>>;

/// Periodic reachability checks across every registered cluster.
pub struct ConnectivityProbe {
    backend: Arc<dyn ClusterBackend>,
    registry: Arc<ClusterRegistry>,
    probe_timeout: Duration,
    in_flight: Mutex<HashMap<String, ProbeFuture>>,
    transitions: broadcast::Sender<ReachabilityTransition>,
}

impl ConnectivityProbe {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        registry: Arc<ClusterRegistry>,
        probe_timeout: Duration,
    ) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            backend,
            registry,
            probe_timeout,
            in_flight: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityTransition> {
        self.transitions.subscribe()
    }

    /// Never fails: errors and timeouts read as unreachable.
    ///
    /// Concurrent callers for the same cluster share one backend call.
    pub async fn test_connectivity(&self, cluster: &str) -> bool {
        let probe = {
            let mut in_flight = self.lock();
            match in_flight.get(cluster) {
                Some(existing) => existing.clone(),
                None => {
                    let probe = self.start_probe(cluster);
                    in_flight.insert(cluster.to_string(), probe.clone());
                    probe
                }
            }
        };

        let reachable = probe.clone().await;

        let mut in_flight = self.lock();
        if in_flight
            .get(cluster)
            .is_some_and(|current| current.ptr_eq(&probe))
        {
            in_flight.remove(cluster);
        }

        reachable
    }

    /// Probes one cluster and records the outcome in the registry.
    pub async fn check(&self, cluster: &str) -> bool {
        if let Some(transition) = self.registry.begin_check(cluster) {
            self.publish(transition);
        }

        let reachable = self.test_connectivity(cluster).await;
        if let Some(transition) = self.registry.record_probe(cluster, reachable) {
            self.publish(transition);
        }

        reachable
    }

    pub async fn probe_all(&self) -> HashMap<String, bool> {
        let names = self.registry.names();
        let results = join_all(names.iter().map(|name| self.check(name))).await;
        names.into_iter().zip(results).collect()
    }

    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = self.probe_all().await;
                        let connected = results.values().filter(|reachable| **reachable).count();
                        debug!("probe cycle: {connected}/{} clusters reachable", results.len());
                    }
                }
            }
            debug!("connectivity probe loop stopped");
        })
    }

    fn start_probe(&self, cluster: &str) -> ProbeFuture {
        let backend = self.backend.clone();
        let name = cluster.to_string();
        let limit = self.probe_timeout;

        async move {
            match timeout(limit, backend.test_cluster_connectivity(&name)).await {
                Ok(Ok(reachable)) => reachable,
                Ok(Err(error)) => {
                    debug!("connectivity check failed for {name}: {error:#}");
                    false
                }
                Err(_) => {
                    warn!(
                        "connectivity check for {name} timed out after {}s",
                        limit.as_secs()
                    );
                    false
                }
            }
        }
        .boxed()
        .shared()
    }

    fn publish(&self, transition: ReachabilityTransition) {
        info!(
            "cluster {} is now {} (was {})",
            transition.cluster,
            transition.to.label(),
            transition.from.label()
        );
        let _ = self.transitions.send(transition);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProbeFuture>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
