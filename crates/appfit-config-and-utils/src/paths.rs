//! File system paths for the outbox.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory under the data root that holds every outbox file.
const APP_DIR_NAME: &str = "appfit";
/// Snapshot file holding undelivered events.
const CACHE_FILE_NAME: &str = "cache.af";
/// Persisted identity context (user id and anonymous id).
const IDENTITY_FILE_NAME: &str = "identity.json";
/// Optional configuration file.
const CONFIG_FILE_NAME: &str = "config.json";

/// Manages file system paths for the outbox.
#[derive(Debug, Clone)]
pub struct Paths {
    /// App-private durable storage root.
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at the platform data directory.
    ///
    /// Resolves to e.g. `~/.local/share/appfit` on Linux or
    /// `~/Library/Application Support/appfit` on macOS.
    pub fn new() -> CoreResult<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| CoreError::Path("Could not determine data directory".to_string()))?;

        Ok(Self { base_dir: data_dir })
    }

    /// Create a new Paths instance with a custom storage root.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the storage root.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the outbox directory (`<root>/appfit`).
    pub fn app_dir(&self) -> PathBuf {
        self.base_dir.join(APP_DIR_NAME)
    }

    /// Get the event cache path (`<root>/appfit/cache.af`).
    pub fn cache_file(&self) -> PathBuf {
        self.app_dir().join(CACHE_FILE_NAME)
    }

    /// Get the identity file path (`<root>/appfit/identity.json`).
    pub fn identity_file(&self) -> PathBuf {
        self.app_dir().join(IDENTITY_FILE_NAME)
    }

    /// Get the config file path (`<root>/appfit/config.json`).
    pub fn config_file(&self) -> PathBuf {
        self.app_dir().join(CONFIG_FILE_NAME)
    }

    /// Ensure the outbox directory exists.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(self.app_dir())?;
        Ok(())
    }
}
