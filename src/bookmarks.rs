use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::EngineResult;
use crate::model::Bookmark;
use crate::persist::{load_json, store_json};

#[derive(Debug)]
pub struct BookmarkStore {
    path: Option<PathBuf>,
    entries: Mutex<Vec<Bookmark>>,
}

impl BookmarkStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_json::<Vec<Bookmark>>(&path);
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Bookmark> {
        self.lock().clone()
    }

    /// Returns the bookmark for the target and whether it was newly created.
    pub fn add(&self, cluster: &str, namespace: &str, kind: &str) -> EngineResult<(Bookmark, bool)> {
        let mut entries = self.lock();
        if let Some(existing) = entries
            .iter()
            .find(|bookmark| bookmark.same_target(cluster, namespace, kind))
        {
            return Ok((existing.clone(), false));
        }

        let created_at = Utc::now();
        let next_id = entries.iter().map(|bookmark| bookmark.id).max().unwrap_or(0) + 1;
        let bookmark = Bookmark {
            id: next_id.max(created_at.timestamp_millis().max(0) as u64),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            created_at,
        };
        let mut next = entries.clone();
        next.insert(0, bookmark.clone());

        self.persist(&next)?;
        *entries = next;
        info!("bookmark {} added", bookmark.label());
        Ok((bookmark, true))
    }

    pub fn remove(&self, id: u64) -> EngineResult<bool> {
        let mut entries = self.lock();
        let next = entries
            .iter()
            .filter(|bookmark| bookmark.id != id)
            .cloned()
            .collect::<Vec<_>>();
        if next.len() == entries.len() {
            return Ok(false);
        }

        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    fn persist(&self, entries: &[Bookmark]) -> EngineResult<()> {
        match &self.path {
            Some(path) => store_json(path, &entries),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Bookmark>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
