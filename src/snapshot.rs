//! Emergency state snapshots.
//!
//! Serializes a versioned snapshot of session + application state to an
//! in-memory holder and a durable local file, so a degraded or killed
//! session can be resumed without losing progress. At most one current
//! snapshot is retained; saving overwrites.
//!
//! The store is deliberately forgiving: `save` reports failure with a
//! `bool` instead of an error (callers are usually already handling a
//! degraded link and just want to log), and `restore` treats unknown
//! versions and corrupt files as "no usable snapshot" rather than a
//! parse error, so a future format change cannot brick old clients.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current snapshot format version. Bump on incompatible change.
const SNAPSHOT_VERSION: u32 = 1;

/// Directory name under the platform data dir.
const APP_DIR: &str = "duetlink";

/// Snapshot file name.
const SNAPSHOT_FILE: &str = "snapshot.json";

/// A self-contained snapshot record, restorable without any other
/// component's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Opaque serialized application state.
    pub payload: serde_json::Value,
}

/// Two-tier snapshot storage: memory first, durable file as fallback.
#[derive(Debug)]
pub struct StateSnapshotStore {
    path: PathBuf,
    memory: StdMutex<Option<StateSnapshot>>,
}

impl StateSnapshotStore {
    /// Create a store. `path` overrides the default location under the
    /// platform data directory.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(Self::default_path),
            memory: StdMutex::new(None),
        }
    }

    fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(SNAPSHOT_FILE)
    }

    /// Where the durable copy lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot of `payload`.
    ///
    /// Returns `false` (after logging) on serialization or storage
    /// failure. The in-memory copy is updated regardless, so a
    /// same-process restore still works even when the disk is the
    /// problem.
    pub fn save(&self, payload: &serde_json::Value) -> bool {
        let snapshot = StateSnapshot {
            version: SNAPSHOT_VERSION,
            captured_at: Utc::now(),
            payload: payload.clone(),
        };

        *self.memory.lock().expect("snapshot lock poisoned") = Some(snapshot.clone());

        match self.write_durable(&snapshot) {
            Ok(()) => {
                log::debug!("[Snapshot] Saved to {}", self.path.display());
                true
            }
            Err(e) => {
                log::warn!("[Snapshot] Durable save failed: {e:#}");
                false
            }
        }
    }

    fn write_durable(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(snapshot).context("serializing snapshot")?;
        fs::write(&self.path, json).with_context(|| format!("writing {}", self.path.display()))?;

        // Session state is user data; owner read/write only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("setting snapshot permissions")?;
        }

        Ok(())
    }

    /// Restore the most recent usable snapshot payload.
    ///
    /// Prefers the in-memory holder (same process), falls back to the
    /// durable file (after a full restart). Returns `None` when neither
    /// exists, the file is corrupt, or the version is unknown - restore
    /// is never assumed to succeed.
    pub fn restore(&self) -> Option<serde_json::Value> {
        if let Some(snapshot) = self
            .memory
            .lock()
            .expect("snapshot lock poisoned")
            .as_ref()
        {
            if snapshot.version == SNAPSHOT_VERSION {
                return Some(snapshot.payload.clone());
            }
        }

        let content = fs::read_to_string(&self.path).ok()?;
        let snapshot: StateSnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[Snapshot] Corrupt snapshot file ignored: {e}");
                return None;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            log::warn!(
                "[Snapshot] Unknown snapshot version {} ignored",
                snapshot.version
            );
            return None;
        }
        Some(snapshot.payload)
    }

    /// Drop both the in-memory and durable copies. Idempotent.
    pub fn clear(&self) {
        self.memory.lock().expect("snapshot lock poisoned").take();
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("[Snapshot] Cleared {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[Snapshot] Failed to remove snapshot file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateSnapshotStore {
        StateSnapshotStore::new(Some(dir.path().join("snapshot.json")))
    }

    #[test]
    fn test_restore_before_any_save_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.restore(), None);
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let state = serde_json::json!({
            "board": [[1, 2], [3, 4]],
            "turn": "guest",
            "elapsed_ms": 93_200,
        });

        assert!(store.save(&state));
        assert_eq!(store.restore(), Some(state.clone()));
        // Idempotent when nothing was saved in between.
        assert_eq!(store.restore(), Some(state));
    }

    #[test]
    fn test_restore_falls_back_to_durable_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");
        let state = serde_json::json!({ "progress": 7 });

        let store = StateSnapshotStore::new(Some(path.clone()));
        assert!(store.save(&state));

        // A fresh store (new process) has no memory copy.
        let reopened = StateSnapshotStore::new(Some(path));
        assert_eq!(reopened.restore(), Some(state));
    }

    #[test]
    fn test_memory_copy_survives_file_loss() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let state = serde_json::json!({ "progress": 9 });
        assert!(store.save(&state));

        std::fs::remove_file(store.path()).unwrap();
        assert_eq!(store.restore(), Some(state));
    }

    #[test]
    fn test_newer_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.save(&serde_json::json!({ "v": 1 })));
        assert!(store.save(&serde_json::json!({ "v": 2 })));
        assert_eq!(store.restore(), Some(serde_json::json!({ "v": 2 })));
    }

    #[test]
    fn test_clear_removes_both_copies() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.save(&serde_json::json!({ "v": 1 })));

        store.clear();
        assert_eq!(store.restore(), None);
        assert!(!store.path().exists());
        // Idempotent.
        store.clear();
    }

    #[test]
    fn test_unknown_version_is_no_snapshot_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            serde_json::json!({
                "version": 99,
                "captured_at": "2026-08-06T12:00:00Z",
                "payload": { "v": 1 },
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(store.restore(), None);
    }

    #[test]
    fn test_corrupt_file_is_no_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "not json {{{").unwrap();
        assert_eq!(store.restore(), None);
    }

    #[test]
    fn test_save_to_unwritable_path_returns_false() {
        let dir = TempDir::new().unwrap();
        // A path whose parent is a regular file cannot be created.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let store = StateSnapshotStore::new(Some(blocker.join("snapshot.json")));

        let state = serde_json::json!({ "v": 1 });
        assert!(!store.save(&state));
        // The in-memory copy still restores within this process.
        assert_eq!(store.restore(), Some(state));
    }
}
