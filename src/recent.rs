use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::EngineResult;
use crate::model::RecentKind;
use crate::persist::{load_json, store_json};

pub const RECENT_KINDS_LIMIT: usize = 5;

/// Recently opened kinds, most recent first.
#[derive(Debug)]
pub struct RecentKinds {
    path: Option<PathBuf>,
    entries: Mutex<Vec<RecentKind>>,
}

impl RecentKinds {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = load_json::<Vec<RecentKind>>(&path);
        entries.truncate(RECENT_KINDS_LIMIT);
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

    pub fn list(&self) -> Vec<RecentKind> {
        self.lock().clone()
    }

    pub fn touch(&self, kind: &str) -> EngineResult<Vec<RecentKind>> {
        let mut entries = self.lock();
        let mut next = entries.clone();
        let hits = match next.iter().position(|entry| entry.kind == kind) {
            Some(index) => next.remove(index).hits + 1,
            None => 1,
        };
        next.insert(
            0,
            RecentKind {
                kind: kind.to_string(),
                hits,
            },
        );
        next.truncate(RECENT_KINDS_LIMIT);

        if let Some(path) = &self.path {
            store_json(path, &next)?;
        }
        *entries = next;
        Ok(entries.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecentKind>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
