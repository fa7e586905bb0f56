use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ResourceCatalog;
use crate::dependency::DependencyResolver;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    DEFAULT_KIND, DependencyChain, Reachability, ReachabilityTransition, ResourceInstance,
    WatchKey, canonical_kind,
};
use crate::namespaces::NamespaceResolver;
use crate::recent::RecentKinds;
use crate::registry::ClusterRegistry;
use crate::state::{StateKey, StateStore};
use crate::watcher::{
    RefreshOutcome, ResourceWatcher, SnapshotDiff, Subscription, WatchEvent, WatchUpdate,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionPhase {
    ClusterSelection,
    Browsing,
}

impl SessionPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::ClusterSelection => "cluster-selection",
            Self::Browsing => "browsing",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Selection {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
}

impl Selection {
    pub fn key(&self) -> WatchKey {
        WatchKey::new(&self.cluster, &self.namespace, &self.kind)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub phase: SessionPhase,
    pub selection: Option<Selection>,
    pub active: bool,
    pub paused: bool,
}

/// What the UI of the active session should react to.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Activated {
        session: SessionId,
        phase: SessionPhase,
        selection: Option<Selection>,
    },
    SelectionChanged {
        session: SessionId,
        selection: Selection,
    },
    Resources {
        session: SessionId,
        key: WatchKey,
        items: Vec<ResourceInstance>,
        diff: SnapshotDiff,
    },
    ResourcesFailed {
        session: SessionId,
        key: WatchKey,
        error: EngineError,
    },
    ReturnedToClusterSelection {
        session: SessionId,
        cluster: String,
    },
    Reachability(ReachabilityTransition),
}

/// A fresh kind set from one session's catalog resync.
struct CatalogRefresh {
    session: SessionId,
    cluster: String,
    kinds: BTreeSet<String>,
}

pub struct SessionServices {
    pub registry: Arc<ClusterRegistry>,
    pub namespaces: Arc<NamespaceResolver>,
    pub catalog: Arc<ResourceCatalog>,
    pub watcher: Arc<ResourceWatcher>,
    pub resolver: Arc<DependencyResolver>,
    pub recent: Arc<RecentKinds>,
}

struct Session {
    phase: SessionPhase,
    selection: Option<Selection>,
    state: Arc<StateStore>,
    subscription: Option<Subscription>,
    resync: Option<CancellationToken>,
    resolve: Option<CancellationToken>,
    cancel: CancellationToken,
    namespaces: HashMap<String, String>,
    paused: bool,
}

impl Session {
    fn new(cancel: CancellationToken) -> Self {
        let state = Arc::new(StateStore::new());
        state.set(StateKey::Phase, SessionPhase::ClusterSelection.label());
        Self {
            phase: SessionPhase::ClusterSelection,
            selection: None,
            state,
            subscription: None,
            resync: None,
            resolve: None,
            cancel,
            namespaces: HashMap::new(),
            paused: false,
        }
    }

    fn publish_selection(&self) {
        self.state.set(StateKey::Phase, self.phase.label());
        match &self.selection {
            Some(selection) => {
                self.state.set(StateKey::Cluster, &selection.cluster);
                self.state.set(StateKey::Namespace, &selection.namespace);
                self.state.set(StateKey::Kind, &selection.kind);
            }
            None => {
                self.state.clear(StateKey::Cluster);
                self.state.clear(StateKey::Namespace);
                self.state.clear(StateKey::Kind);
            }
        }
    }

    fn abort_resolve(&mut self) {
        if let Some(resolve) = self.resolve.take() {
            resolve.cancel();
        }
    }

    /// Drops live subscriptions and background work; remembered namespaces stay.
    fn reset(&mut self) {
        self.subscription = None;
        if let Some(resync) = self.resync.take() {
            resync.cancel();
        }
        self.abort_resolve();
        self.phase = SessionPhase::ClusterSelection;
        self.selection = None;
        self.publish_selection();
    }
}

struct Sessions {
    entries: BTreeMap<SessionId, Session>,
    active: SessionId,
    next_id: u64,
}

impl Sessions {
    fn get(&self, id: SessionId) -> EngineResult<&Session> {
        self.entries.get(&id).ok_or(EngineError::UnknownSession(id.0))
    }

    fn get_mut(&mut self, id: SessionId) -> EngineResult<&mut Session> {
        self.entries
            .get_mut(&id)
            .ok_or(EngineError::UnknownSession(id.0))
    }

    fn browsing(&self, id: SessionId) -> EngineResult<Selection> {
        self.get(id)?.selection.clone().ok_or_else(|| {
            EngineError::InvalidInput(format!("session {id} has no cluster selected"))
        })
    }
}

/// Independent browsing sessions ("tabs"); exactly one is active.
pub struct SessionManager {
    services: SessionServices,
    catalog_resync: Duration,
    sessions: Mutex<Sessions>,
    updates: mpsc::UnboundedSender<WatchUpdate>,
    catalogs: mpsc::UnboundedSender<CatalogRefresh>,
    events: broadcast::Sender<UiEvent>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Starts with one session in cluster selection. Needs a running tokio runtime.
    pub fn new(services: SessionServices, catalog_resync: Duration) -> Arc<Self> {
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (catalogs, catalogs_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let shutdown = CancellationToken::new();

        let first = SessionId(1);
        let sessions = Sessions {
            entries: BTreeMap::from([(first, Session::new(shutdown.child_token()))]),
            active: first,
            next_id: 2,
        };

        let manager = Arc::new(Self {
            services,
            catalog_resync,
            sessions: Mutex::new(sessions),
            updates,
            catalogs,
            events,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(route_updates(
            Arc::downgrade(&manager),
            updates_rx,
            catalogs_rx,
            shutdown,
        ));
        manager
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn active_session(&self) -> SessionId {
        self.lock().active
    }

    pub fn session_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.lock();
        sessions
            .entries
            .iter()
            .map(|(id, session)| SessionSummary {
                id: *id,
                phase: session.phase,
                selection: session.selection.clone(),
                active: *id == sessions.active,
                paused: session.paused,
            })
            .collect()
    }

    pub fn summary(&self, id: SessionId) -> EngineResult<SessionSummary> {
        self.sessions()
            .into_iter()
            .find(|summary| summary.id == id)
            .ok_or(EngineError::UnknownSession(id.0))
    }

    pub fn state(&self, id: SessionId) -> EngineResult<Arc<StateStore>> {
        Ok(self.lock().get(id)?.state.clone())
    }

    /// New sessions start in cluster selection and become active.
    pub fn create_session(&self) -> SessionId {
        let id = {
            let mut sessions = self.lock();
            let id = SessionId(sessions.next_id);
            sessions.next_id += 1;
            sessions
                .entries
                .insert(id, Session::new(self.shutdown.child_token()));
            sessions.active = id;
            id
        };

        info!("session {id} created");
        self.emit(UiEvent::Activated {
            session: id,
            phase: SessionPhase::ClusterSelection,
            selection: None,
        });
        id
    }

    /// Returns `Ok(false)` without doing anything when `id` is the last session.
    pub fn close_session(&self, id: SessionId) -> EngineResult<bool> {
        let activated = {
            let mut sessions = self.lock();
            sessions.get(id)?;
            if sessions.entries.len() == 1 {
                debug!("refusing to close the last session {id}");
                return Ok(false);
            }

            if let Some(mut session) = sessions.entries.remove(&id) {
                session.reset();
                session.cancel.cancel();
            }

            if sessions.active == id {
                let next = sessions.entries.keys().next_back().copied();
                next.inspect(|next| sessions.active = *next)
            } else {
                None
            }
        };

        info!("session {id} closed");
        if let Some(next) = activated {
            self.announce_activation(next);
        }
        Ok(true)
    }

    /// The previous session keeps polling in the background.
    pub fn activate_session(&self, id: SessionId) -> EngineResult<()> {
        let lost_cluster = {
            let mut sessions = self.lock();
            let session = sessions.get(id)?;
            let lost_cluster = session
                .selection
                .as_ref()
                .filter(|selection| {
                    self.services.registry.reachability(&selection.cluster)
                        == Some(Reachability::Disconnected)
                })
                .map(|selection| selection.cluster.clone());
            sessions.active = id;
            lost_cluster
        };

        if let Some(cluster) = lost_cluster {
            self.force_cluster_selection(id, &cluster);
        }
        self.announce_activation(id);
        Ok(())
    }

    /// Enters browsing on `cluster` with its remembered or default namespace and `pods`.
    pub async fn select_cluster(&self, id: SessionId, cluster: &str) -> EngineResult<Selection> {
        match self.services.registry.reachability(cluster) {
            None => {
                return Err(EngineError::InvalidInput(format!(
                    "unknown cluster '{cluster}'"
                )));
            }
            Some(Reachability::Disconnected) => {
                return Err(EngineError::upstream(cluster, "cluster is not reachable"));
            }
            Some(_) => {}
        }

        let (previous, cancel) = {
            let sessions = self.lock();
            let session = sessions.get(id)?;
            (session.namespaces.get(cluster).cloned(), session.cancel.clone())
        };

        let namespace = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Aborted),
            namespace = self
                .services
                .namespaces
                .default_namespace(cluster, previous.as_deref()) => namespace?,
        };

        let selection = Selection {
            cluster: cluster.to_string(),
            namespace,
            kind: DEFAULT_KIND.to_string(),
        };

        {
            let mut sessions = self.lock();
            let session = sessions.get_mut(id).map_err(|_| EngineError::Aborted)?;
            session.abort_resolve();
            session
                .namespaces
                .insert(selection.cluster.clone(), selection.namespace.clone());
            session.phase = SessionPhase::Browsing;
            session.selection = Some(selection.clone());
            self.bind_subscription(id, session, selection.key());

            if let Some(resync) = session.resync.take() {
                resync.cancel();
            }
            let resync = session.cancel.child_token();
            let catalogs = self.catalogs.clone();
            let cluster = selection.cluster.clone();
            self.services.catalog.clone().spawn_resync(
                selection.cluster.clone(),
                self.catalog_resync,
                resync.clone(),
                move |kinds| {
                    let _ = catalogs.send(CatalogRefresh {
                        session: id,
                        cluster: cluster.clone(),
                        kinds,
                    });
                },
            );
            session.resync = Some(resync);
            session.publish_selection();
        }

        info!(
            "session {id} browsing {}/{}",
            selection.cluster, selection.namespace
        );
        self.emit_selection(id, &selection);
        Ok(selection)
    }

    pub fn select_namespace(&self, id: SessionId, namespace: &str) -> EngineResult<Selection> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(EngineError::InvalidInput(
                "namespace must not be empty".to_string(),
            ));
        }

        self.update_selection(id, |selection| selection.namespace = namespace.to_string())
    }

    /// Accepts kubectl short names.
    pub fn select_kind(&self, id: SessionId, kind: &str) -> EngineResult<Selection> {
        let kind = canonical_kind(kind);
        if kind.is_empty() {
            return Err(EngineError::InvalidInput(
                "kind must not be empty".to_string(),
            ));
        }

        let selection = self.update_selection(id, |selection| selection.kind = kind.clone())?;
        if let Err(error) = self.services.recent.touch(&kind) {
            warn!("failed to record recent kind {kind}: {error}");
        }
        Ok(selection)
    }

    pub fn back_to_cluster_selection(&self, id: SessionId) -> EngineResult<()> {
        {
            let mut sessions = self.lock();
            sessions.get_mut(id)?.reset();
        }

        if self.active_session() == id {
            self.announce_activation(id);
        }
        Ok(())
    }

    pub fn pause_session(&self, id: SessionId) -> EngineResult<()> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(id)?;
        session.paused = true;
        if let Some(subscription) = &session.subscription {
            subscription.pause();
        }
        Ok(())
    }

    pub fn resume_session(&self, id: SessionId) -> EngineResult<()> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(id)?;
        session.paused = false;
        if let Some(subscription) = &session.subscription {
            subscription.resume();
        }
        Ok(())
    }

    pub fn refresh(&self, id: SessionId) -> EngineResult<RefreshOutcome> {
        let sessions = self.lock();
        let session = sessions.get(id)?;
        session
            .subscription
            .as_ref()
            .map(Subscription::refresh)
            .ok_or_else(|| EngineError::InvalidInput(format!("session {id} is not browsing")))
    }

    pub fn snapshot(&self, id: SessionId) -> EngineResult<Vec<ResourceInstance>> {
        Ok(self
            .lock()
            .get(id)?
            .subscription
            .as_ref()
            .map(Subscription::snapshot)
            .unwrap_or_default())
    }

    pub fn filtered(&self, id: SessionId, query: &str) -> EngineResult<Vec<ResourceInstance>> {
        Ok(self
            .lock()
            .get(id)?
            .subscription
            .as_ref()
            .map(|subscription| subscription.filtered(query))
            .unwrap_or_default())
    }

    pub fn status_summary(&self, id: SessionId) -> EngineResult<String> {
        Ok(self
            .lock()
            .get(id)?
            .subscription
            .as_ref()
            .map(Subscription::status_summary)
            .unwrap_or_default())
    }

    pub fn last_error(&self, id: SessionId) -> EngineResult<Option<EngineError>> {
        Ok(self
            .lock()
            .get(id)?
            .subscription
            .as_ref()
            .and_then(Subscription::last_error))
    }

    /// Resolves within the session's cluster and namespace.
    ///
    /// Aborted when the session closes, its selection changes, or another
    /// resolve starts in the same session.
    pub async fn resolve_dependencies(
        &self,
        id: SessionId,
        kind: &str,
        name: &str,
    ) -> EngineResult<DependencyChain> {
        let (selection, token) = {
            let mut sessions = self.lock();
            let selection = sessions.browsing(id)?;
            let session = sessions.get_mut(id)?;
            session.abort_resolve();
            let token = session.cancel.child_token();
            session.resolve = Some(token.clone());
            (selection, token)
        };

        self.services
            .resolver
            .resolve(
                &selection.cluster,
                kind,
                &selection.namespace,
                name,
                &token,
            )
            .await
    }

    /// Forwards probe transitions; a cluster going down sends the active session back.
    pub fn watch_reachability(
        self: &Arc<Self>,
        mut transitions: broadcast::Receiver<ReachabilityTransition>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = transitions.recv() => match received {
                        Ok(transition) => transition,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("missed {skipped} reachability transitions");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transition(transition);
            }
        })
    }

    /// Returns the session that was sent back to cluster selection, if any.
    pub fn handle_transition(&self, transition: ReachabilityTransition) -> Option<SessionId> {
        self.emit(UiEvent::Reachability(transition.clone()));
        if transition.to != Reachability::Disconnected {
            return None;
        }

        let active = {
            let sessions = self.lock();
            let active = sessions.active;
            let on_cluster = sessions.get(active).ok().is_some_and(|session| {
                session
                    .selection
                    .as_ref()
                    .is_some_and(|selection| selection.cluster == transition.cluster)
            });
            on_cluster.then_some(active)
        }?;

        self.force_cluster_selection(active, &transition.cluster);
        Some(active)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut sessions = self.lock();
        for session in sessions.entries.values_mut() {
            session.reset();
        }
    }

    fn force_cluster_selection(&self, id: SessionId, cluster: &str) {
        {
            let mut sessions = self.lock();
            let Ok(session) = sessions.get_mut(id) else {
                return;
            };
            session.reset();
        }

        warn!("cluster {cluster} is unreachable, session {id} returned to cluster selection");
        self.emit(UiEvent::ReturnedToClusterSelection {
            session: id,
            cluster: cluster.to_string(),
        });
    }

    /// A kind that left its cluster's catalog falls back to the default kind.
    fn apply_catalog(&self, refresh: CatalogRefresh) {
        if refresh.kinds.is_empty() {
            return;
        }

        let mut vanished = None;
        let outcome = self.update_selection(refresh.session, |selection| {
            if selection.cluster == refresh.cluster
                && selection.kind != DEFAULT_KIND
                && !refresh.kinds.contains(&selection.kind)
            {
                vanished = Some(std::mem::replace(
                    &mut selection.kind,
                    DEFAULT_KIND.to_string(),
                ));
            }
        });

        match (outcome, vanished) {
            (Ok(_), Some(kind)) => info!(
                "{kind} is gone from {}, session {} switched to {DEFAULT_KIND}",
                refresh.cluster, refresh.session
            ),
            (Err(error), _) => debug!(
                "catalog refresh for session {} ignored: {error}",
                refresh.session
            ),
            (Ok(_), None) => {}
        }
    }

    fn update_selection(
        &self,
        id: SessionId,
        change: impl FnOnce(&mut Selection),
    ) -> EngineResult<Selection> {
        let selection = {
            let mut sessions = self.lock();
            let mut selection = sessions.browsing(id)?;
            change(&mut selection);

            let session = sessions.get_mut(id)?;
            if session.selection.as_ref() == Some(&selection) {
                return Ok(selection);
            }

            session.abort_resolve();
            session
                .namespaces
                .insert(selection.cluster.clone(), selection.namespace.clone());
            session.selection = Some(selection.clone());
            self.bind_subscription(id, session, selection.key());
            session.publish_selection();
            selection
        };

        self.emit_selection(id, &selection);
        Ok(selection)
    }

    fn bind_subscription(&self, id: SessionId, session: &mut Session, key: WatchKey) {
        match &session.subscription {
            Some(subscription) => {
                subscription.switch(key);
            }
            None => {
                let subscription =
                    self.services
                        .watcher
                        .subscribe(id, key, self.updates.clone());
                if session.paused {
                    subscription.pause();
                }
                session.subscription = Some(subscription);
            }
        }
    }

    fn announce_activation(&self, id: SessionId) {
        let restored = {
            let sessions = self.lock();
            let Ok(session) = sessions.get(id) else {
                return;
            };
            let snapshot = session.subscription.as_ref().map(|subscription| {
                (subscription.key(), subscription.snapshot())
            });
            (session.phase, session.selection.clone(), snapshot)
        };

        let (phase, selection, snapshot) = restored;
        debug!("session {id} activated ({})", phase.label());
        self.emit(UiEvent::Activated {
            session: id,
            phase,
            selection,
        });

        if let Some((key, items)) = snapshot
            && !items.is_empty()
        {
            self.emit(UiEvent::Resources {
                session: id,
                key,
                items,
                diff: SnapshotDiff::default(),
            });
        }
    }

    fn emit_selection(&self, id: SessionId, selection: &Selection) {
        if self.active_session() == id {
            self.emit(UiEvent::SelectionChanged {
                session: id,
                selection: selection.clone(),
            });
        }
    }

    /// Only updates of the active session's current key reach the UI.
    fn forward(&self, update: WatchUpdate) {
        let visible = {
            let sessions = self.lock();
            sessions.active == update.session
                && sessions
                    .entries
                    .get(&update.session)
                    .and_then(|session| session.subscription.as_ref())
                    .is_some_and(|subscription| subscription.key() == update.key)
        };

        if !visible {
            return;
        }

        let event = match update.event {
            WatchEvent::Snapshot { items, diff } => UiEvent::Resources {
                session: update.session,
                key: update.key,
                items,
                diff,
            },
            WatchEvent::Failed(error) => UiEvent::ResourcesFailed {
                session: update.session,
                key: update.key,
                error,
            },
        };
        self.emit(event);
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route_updates(
    manager: Weak<SessionManager>,
    mut updates: mpsc::UnboundedReceiver<WatchUpdate>,
    mut catalogs: mpsc::UnboundedReceiver<CatalogRefresh>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = updates.recv() => {
                let Some(update) = received else {
                    break;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.forward(update);
            }
            received = catalogs.recv() => {
                let Some(refresh) = received else {
                    break;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.apply_catalog(refresh);
            }
        }
    }
}
