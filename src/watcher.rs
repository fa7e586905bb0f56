use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ClusterBackend, bounded};
use crate::error::{EngineError, EngineResult};
use crate::model::{ResourceInstance, WatchKey};
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            poll_timeout: Duration::from_secs(10),
        }
    }
}

/// Names touched by applying one poll result.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SnapshotDiff {
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl SnapshotDiff {
    pub fn operation_count(&self) -> usize {
        self.updated.len() + self.removed.len() + self.added.len()
    }

    pub fn is_structural(&self) -> bool {
        !self.removed.is_empty() || !self.added.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    items: Vec<ResourceInstance>,
}

impl Snapshot {
    pub fn items(&self) -> &[ResourceInstance] {
        &self.items
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.name.as_str()).collect()
    }

    /// Merges a fresh poll keyed by name.
    ///
    /// Survivors are overwritten in place and keep their position. Newcomers
    /// go in front, in the order the backend returned them.
    pub fn apply(&mut self, fresh: Vec<ResourceInstance>) -> SnapshotDiff {
        let fresh_names = fresh
            .iter()
            .map(|item| item.name.clone())
            .collect::<HashSet<_>>();

        let mut diff = SnapshotDiff::default();
        self.items.retain(|item| {
            let keep = fresh_names.contains(&item.name);
            if !keep {
                diff.removed.push(item.name.clone());
            }
            keep
        });

        let positions = self
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| (item.name.clone(), index))
            .collect::<HashMap<_, _>>();

        let mut newcomers = Vec::new();
        for item in fresh {
            match positions.get(&item.name) {
                Some(&index) => {
                    diff.updated.push(item.name.clone());
                    self.items[index] = item;
                }
                None if newcomers
                    .iter()
                    .any(|seen: &ResourceInstance| seen.name == item.name) => {}
                None => {
                    diff.added.push(item.name.clone());
                    newcomers.push(item);
                }
            }
        }

        if !newcomers.is_empty() {
            newcomers.append(&mut self.items);
            self.items = newcomers;
        }

        diff
    }

    /// Status histogram in order of first appearance.
    pub fn status_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for status in self.items.iter().filter_map(ResourceInstance::status) {
            match counts.iter_mut().find(|(known, _)| known == status) {
                Some((_, count)) => *count += 1,
                None => counts.push((status.to_string(), 1)),
            }
        }
        counts
    }

    pub fn status_summary(&self) -> String {
        self.status_counts()
            .into_iter()
            .map(|(status, count)| format!("{count} {status}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn filtered(&self, query: &str) -> Vec<ResourceInstance> {
        self.items
            .iter()
            .filter(|item| item.matches_filter(query))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Snapshot {
        items: Vec<ResourceInstance>,
        diff: SnapshotDiff,
    },
    Failed(EngineError),
}

#[derive(Debug, Clone)]
pub struct WatchUpdate {
    pub session: SessionId,
    pub key: WatchKey,
    pub event: WatchEvent,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RefreshOutcome {
    Requested,
    Suppressed,
    Paused,
}

#[derive(Debug)]
struct WatchState {
    key: WatchKey,
    generation: u64,
    snapshot: Snapshot,
    in_flight: Option<CancellationToken>,
    last_error: Option<EngineError>,
    paused: bool,
}

type SharedState = Arc<Mutex<WatchState>>;

/// Polls instances of one kind on a fixed cadence.
pub struct ResourceWatcher {
    backend: Arc<dyn ClusterBackend>,
    settings: WatchSettings,
}

impl ResourceWatcher {
    pub fn new(backend: Arc<dyn ClusterBackend>, settings: WatchSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    /// One bounded poll, outside any subscription.
    pub async fn poll(&self, key: &WatchKey) -> EngineResult<Vec<ResourceInstance>> {
        bounded(
            &key.cluster,
            &format!("list {}", key.kind),
            self.settings.poll_timeout,
            self.backend
                .get_resources_in_namespace(&key.cluster, &key.kind, &key.namespace),
        )
        .await
    }

    pub fn subscribe(
        &self,
        session: SessionId,
        key: WatchKey,
        updates: mpsc::UnboundedSender<WatchUpdate>,
    ) -> Subscription {
        let state = Arc::new(Mutex::new(WatchState {
            key,
            generation: 0,
            snapshot: Snapshot::default(),
            in_flight: None,
            last_error: None,
            paused: false,
        }));
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_subscription(
            self.backend.clone(),
            self.settings,
            session,
            state.clone(),
            wake.clone(),
            cancel.clone(),
            updates,
        ));

        Subscription {
            state,
            wake,
            cancel,
            task,
        }
    }
}

/// A live binding to one (cluster, namespace, kind). Dropping it stops polling.
pub struct Subscription {
    state: SharedState,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn key(&self) -> WatchKey {
        lock(&self.state).key.clone()
    }

    pub fn snapshot(&self) -> Vec<ResourceInstance> {
        lock(&self.state).snapshot.items().to_vec()
    }

    pub fn filtered(&self, query: &str) -> Vec<ResourceInstance> {
        lock(&self.state).snapshot.filtered(query)
    }

    pub fn status_summary(&self) -> String {
        lock(&self.state).snapshot.status_summary()
    }

    pub fn last_error(&self) -> Option<EngineError> {
        lock(&self.state).last_error.clone()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Rebinds to `key`, aborting any poll still running for the old one.
    pub fn switch(&self, key: WatchKey) -> bool {
        {
            let mut state = lock(&self.state);
            if state.key == key {
                return false;
            }

            if let Some(in_flight) = state.in_flight.take() {
                in_flight.cancel();
                debug!("aborted in-flight poll for {}", state.key);
            }
            state.key = key;
            state.generation += 1;
            state.snapshot = Snapshot::default();
            state.last_error = None;
        }

        self.wake.notify_one();
        true
    }

    pub fn refresh(&self) -> RefreshOutcome {
        {
            let state = lock(&self.state);
            if state.paused {
                return RefreshOutcome::Paused;
            }
            if state.in_flight.is_some() {
                return RefreshOutcome::Suppressed;
            }
        }

        self.wake.notify_one();
        RefreshOutcome::Requested
    }

    pub fn pause(&self) {
        lock(&self.state).paused = true;
    }

    pub fn resume(&self) {
        let was_paused = std::mem::replace(&mut lock(&self.state).paused, false);
        if was_paused {
            self.wake.notify_one();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_subscription(
    backend: Arc<dyn ClusterBackend>,
    settings: WatchSettings,
    session: SessionId,
    state: SharedState,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<WatchUpdate>,
) {
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let Some((key, generation, token)) = begin_poll(&state, &cancel) else {
            continue;
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = timeout(
                settings.poll_timeout,
                backend.get_resources_in_namespace(&key.cluster, &key.kind, &key.namespace),
            ) => Some(result),
        };

        let event = match outcome {
            None => {
                debug!("poll for {key} aborted");
                None
            }
            Some(Ok(Ok(items))) => finish_poll(&state, generation, Ok(items)),
            Some(Ok(Err(error))) => finish_poll(
                &state,
                generation,
                Err(EngineError::from_anyhow(&key.cluster, &error)),
            ),
            Some(Err(_)) => finish_poll(
                &state,
                generation,
                Err(EngineError::timeout(
                    format!("list {} in {}", key.kind, key.namespace),
                    settings.poll_timeout,
                )),
            ),
        };

        if let Some(event) = event
            && updates
                .send(WatchUpdate {
                    session,
                    key,
                    event,
                })
                .is_err()
        {
            debug!("watch receiver dropped, stopping subscription");
            break;
        }
    }
}

/// Claims the in-flight slot unless paused or already busy.
fn begin_poll(
    state: &SharedState,
    cancel: &CancellationToken,
) -> Option<(WatchKey, u64, CancellationToken)> {
    let mut state = lock(state);
    if state.paused || state.in_flight.is_some() {
        return None;
    }

    let token = cancel.child_token();
    state.in_flight = Some(token.clone());
    Some((state.key.clone(), state.generation, token))
}

/// Applies a result only if no key switch happened while it was in flight.
fn finish_poll(
    state: &SharedState,
    generation: u64,
    result: EngineResult<Vec<ResourceInstance>>,
) -> Option<WatchEvent> {
    let mut state = lock(state);
    if state.generation != generation {
        return None;
    }
    state.in_flight = None;

    match result {
        Ok(items) => {
            let diff = state.snapshot.apply(items);
            state.last_error = None;
            Some(WatchEvent::Snapshot {
                items: state.snapshot.items().to_vec(),
                diff,
            })
        }
        Err(error) => {
            warn!("refresh failed for {} (keeping last snapshot): {error}", state.key);
            state.last_error = Some(error.clone());
            Some(WatchEvent::Failed(error))
        }
    }
}

fn lock(state: &SharedState) -> MutexGuard<'_, WatchState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
