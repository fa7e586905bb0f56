use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StateKey {
    Phase,
    Cluster,
    Namespace,
    Kind,
}

impl Display for StateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Phase => "phase",
            Self::Cluster => "cluster",
            Self::Namespace => "namespace",
            Self::Kind => "kind",
        };
        f.write_str(label)
    }
}

/// Observable selection state of one session.
///
/// Components read and subscribe here instead of holding references to one another.
#[derive(Debug, Default)]
pub struct StateStore {
    slots: Mutex<HashMap<StateKey, watch::Sender<Option<String>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifies subscribers only when the value actually changes.
    pub fn publish(&self, key: StateKey, value: Option<String>) -> bool {
        let mut slots = self.lock();
        let slot = slots
            .entry(key)
            .or_insert_with(|| watch::channel(None).0);
        slot.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }

    pub fn set(&self, key: StateKey, value: impl Into<String>) -> bool {
        self.publish(key, Some(value.into()))
    }

    pub fn clear(&self, key: StateKey) -> bool {
        self.publish(key, None)
    }

    pub fn get(&self, key: StateKey) -> Option<String> {
        self.lock()
            .get(&key)
            .and_then(|slot| slot.borrow().clone())
    }

    pub fn subscribe(&self, key: StateKey) -> watch::Receiver<Option<String>> {
        self.lock()
            .entry(key)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StateKey, watch::Sender<Option<String>>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
