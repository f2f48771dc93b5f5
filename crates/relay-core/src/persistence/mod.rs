//! Session persistence - save and load registry snapshots
//!
//! The whole registry is written as a single JSON document on every save:
//!
//! ```text
//! { "version": "3.0", "savedAt": "...", "state": { "sessions": {..}, "entries": {..}, "childToParentMap": {..} } }
//! ```
//!
//! Writes go to a temporary file that is renamed over the snapshot, so a
//! reader never observes a partial write. Loading never fails the caller:
//! a missing, unreadable or unrecognized snapshot means a cold start.

pub mod migration;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::RegistryState;

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: &str = "3.0";

/// File name of the snapshot inside the state directory
pub const SNAPSHOT_FILE_NAME: &str = "agent-sessions.json";

/// Snapshot document as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub version: String,
    /// Missing in some legacy snapshots
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    pub state: RegistryState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    version: &'a str,
    saved_at: DateTime<Utc>,
    state: &'a RegistryState,
}

/// Durable snapshot storage for the session registry
pub struct PersistenceStore {
    path: PathBuf,
    /// Serializes writers so two saves never interleave
    write_lock: Mutex<()>,
}

impl PersistenceStore {
    /// Store the snapshot under `state_dir`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self::with_file(state_dir.as_ref().join(SNAPSHOT_FILE_NAME))
    }

    /// Store the snapshot at an explicit file path
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the default state directory
    pub fn default_state_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".agent-relay"))
            .join("agent-relay")
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full registry state, replacing any previous snapshot
    pub async fn save(&self, state: &RegistryState) -> Result<()> {
        let snapshot = SnapshotRef {
            version: CURRENT_SCHEMA_VERSION,
            saved_at: Utc::now(),
            state,
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        if let Err(e) = write_and_replace(&tmp_path, &self.path, &json).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp_path.display(), "Failed to remove temporary snapshot: {}", cleanup);
            }
            return Err(e.into());
        }

        debug!(
            path = %self.path.display(),
            sessions = state.sessions.len(),
            "Saved session snapshot"
        );
        Ok(())
    }

    /// Load the registry state, or `None` for a cold start
    ///
    /// Read, parse and version failures are logged and treated as "no prior state".
    pub async fn load(&self) -> Option<RegistryState> {
        match self.load_snapshot().await {
            Ok(snapshot) => snapshot.map(|snapshot| snapshot.state),
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring persisted state: {}", e);
                None
            }
        }
    }

    /// Load the snapshot document, migrating an older layout if needed
    ///
    /// A migrated snapshot is re-persisted in the current layout before it is
    /// returned.
    pub async fn load_snapshot(&self) -> Result<Option<PersistedSnapshot>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::PersistenceRead(e.to_string())),
        };

        let document: Value =
            serde_json::from_str(&raw).map_err(|e| Error::PersistenceRead(e.to_string()))?;
        let version = document
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !migration::is_supported(&version) {
            return Err(Error::UnsupportedSchemaVersion(version));
        }

        let migrated = version != CURRENT_SCHEMA_VERSION;
        let document = migration::migrate_document(document)?;
        let snapshot: PersistedSnapshot =
            serde_json::from_value(document).map_err(|e| Error::PersistenceRead(e.to_string()))?;

        if migrated {
            info!(
                from = %version,
                to = CURRENT_SCHEMA_VERSION,
                sessions = snapshot.state.sessions.len(),
                "Migrated persisted session snapshot"
            );
            if let Err(e) = self.save(&snapshot.state).await {
                warn!("Failed to re-persist migrated snapshot: {}", e);
            }
        }

        Ok(Some(snapshot))
    }
}

/// Write `contents` to `tmp_path`, sync it, then rename it over `path`
async fn write_and_replace(tmp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp_path, path).await
}
