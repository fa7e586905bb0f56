use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

pub const GROUPS_FILE: &str = "groups.json";
pub const BOOKMARKS_FILE: &str = "bookmarks.json";
pub const RECENT_KINDS_FILE: &str = "recent-kinds.json";

pub fn default_state_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kubeplorer")
}

/// Loads `path`, falling back to `T::default()` when it is missing or unreadable.
pub fn load_json<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(error) => {
            warn!("failed to read state file {}, using defaults: {error}", path.display());
            return T::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(error) => {
            warn!("corrupt state file {}, using defaults: {error}", path.display());
            T::default()
        }
    }
}

/// Writes through a sibling temp file so readers never see a torn file.
pub fn store_json<T>(path: &Path, value: &T) -> EngineResult<()>
where
    T: Serialize,
{
    let failure = |message: String| EngineError::Persistence {
        path: path.display().to_string(),
        message,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|error| failure(error.to_string()))?;
    }

    let encoded = serde_json::to_vec_pretty(value).map_err(|error| failure(error.to_string()))?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    fs::write(&staging, encoded).map_err(|error| failure(error.to_string()))?;
    fs::rename(&staging, path).map_err(|error| failure(error.to_string()))
}
