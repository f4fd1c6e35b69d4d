//! Persistent engine state: auto-sync config, baselines and the run checkpoint.
//!
//! File layout of a [`FileStateStore`]:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK                    # Advisory lock, one process per directory
//! ├─ auto_sync.json          # AutoSyncConfig
//! ├─ baseline-<type>.json    # Baseline per entity type
//! ├─ checkpoint.json         # In-flight run, if any
//! ├─ runs.jsonl              # History (see history.rs)
//! └─ conflicts.jsonl
//! ```

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use edgesync_protocol::{AutoSyncConfig, Baseline, EntityType, SyncRun};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const AUTO_SYNC_FILE: &str = "auto_sync.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Progress of a run that has not finished yet.
///
/// Saved after each entity type so an interrupted run can resume after the
/// last completed type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// The run as of the last completed entity type.
    pub run: SyncRun,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

/// Storage for engine state that must survive restarts.
pub trait StateStore: Send + Sync {
    /// Loads the auto-sync config, if one was saved.
    fn load_auto_sync(&self) -> SyncResult<Option<AutoSyncConfig>>;

    /// Saves the auto-sync config.
    fn save_auto_sync(&self, config: &AutoSyncConfig) -> SyncResult<()>;

    /// Loads the baseline of an entity type (empty if never synced).
    fn load_baseline(&self, entity_type: EntityType) -> SyncResult<Baseline>;

    /// Saves the baseline of an entity type.
    fn save_baseline(&self, entity_type: EntityType, baseline: &Baseline) -> SyncResult<()>;

    /// Loads the checkpoint of an interrupted run.
    fn load_checkpoint(&self) -> SyncResult<Option<Checkpoint>>;

    /// Saves the checkpoint of the current run.
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> SyncResult<()>;

    /// Removes the checkpoint once a run ends.
    fn clear_checkpoint(&self) -> SyncResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    auto_sync: Option<AutoSyncConfig>,
    baselines: BTreeMap<EntityType, Baseline>,
    checkpoint: Option<Checkpoint>,
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load_auto_sync(&self) -> SyncResult<Option<AutoSyncConfig>> {
        Ok(self.state.lock().auto_sync.clone())
    }

    fn save_auto_sync(&self, config: &AutoSyncConfig) -> SyncResult<()> {
        self.state.lock().auto_sync = Some(config.clone());
        Ok(())
    }

    fn load_baseline(&self, entity_type: EntityType) -> SyncResult<Baseline> {
        Ok(self
            .state
            .lock()
            .baselines
            .get(&entity_type)
            .cloned()
            .unwrap_or_default())
    }

    fn save_baseline(&self, entity_type: EntityType, baseline: &Baseline) -> SyncResult<()> {
        self.state
            .lock()
            .baselines
            .insert(entity_type, baseline.clone());
        Ok(())
    }

    fn load_checkpoint(&self) -> SyncResult<Option<Checkpoint>> {
        Ok(self.state.lock().checkpoint.clone())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> SyncResult<()> {
        self.state.lock().checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn clear_checkpoint(&self) -> SyncResult<()> {
        self.state.lock().checkpoint = None;
        Ok(())
    }
}

/// State store backed by JSON files in a directory.
///
/// Holds an exclusive lock on the directory for its lifetime, so two
/// processes never drive the same state. Every write goes to a temporary
/// file that is then renamed over the target.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    _lock_file: File,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens (creating if needed) a state directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StateLocked`] if another process holds the lock.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::StateLocked(dir.display().to_string()));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn baseline_path(&self, entity_type: EntityType) -> PathBuf {
        self.dir.join(format!("baseline-{}.json", entity_type.as_str()))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> SyncResult<Option<T>> {
        match fs::read(path) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let data = serde_json::to_vec_pretty(value)?;
        let temp_path = path.with_extension("json.tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load_auto_sync(&self) -> SyncResult<Option<AutoSyncConfig>> {
        self.read_json(&self.dir.join(AUTO_SYNC_FILE))
    }

    fn save_auto_sync(&self, config: &AutoSyncConfig) -> SyncResult<()> {
        self.write_json(&self.dir.join(AUTO_SYNC_FILE), config)
    }

    fn load_baseline(&self, entity_type: EntityType) -> SyncResult<Baseline> {
        Ok(self
            .read_json(&self.baseline_path(entity_type))?
            .unwrap_or_default())
    }

    fn save_baseline(&self, entity_type: EntityType, baseline: &Baseline) -> SyncResult<()> {
        self.write_json(&self.baseline_path(entity_type), baseline)
    }

    fn load_checkpoint(&self) -> SyncResult<Option<Checkpoint>> {
        self.read_json(&self.dir.join(CHECKPOINT_FILE))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> SyncResult<()> {
        self.write_json(&self.dir.join(CHECKPOINT_FILE), checkpoint)
    }

    fn clear_checkpoint(&self) -> SyncResult<()> {
        match fs::remove_file(self.dir.join(CHECKPOINT_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_protocol::{SyncRequest, Version};
    use tempfile::tempdir;

    fn baseline() -> Baseline {
        let mut baseline = Baseline::new();
        baseline.insert("u1".into(), Version::from_hex("ab12"));
        baseline
    }

    fn exercise(store: &dyn StateStore) {
        assert!(store.load_auto_sync().unwrap().is_none());
        let mut config = AutoSyncConfig::default();
        config.arm(60_000, Utc::now());
        store.save_auto_sync(&config).unwrap();
        assert_eq!(store.load_auto_sync().unwrap(), Some(config));

        assert!(store.load_baseline(EntityType::User).unwrap().is_empty());
        store.save_baseline(EntityType::User, &baseline()).unwrap();
        assert_eq!(store.load_baseline(EntityType::User).unwrap(), baseline());
        assert!(store.load_baseline(EntityType::Academy).unwrap().is_empty());

        let checkpoint = Checkpoint {
            run: SyncRun::pending(&SyncRequest::scheduled()),
            saved_at: Utc::now(),
        };
        store.save_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.load_checkpoint().unwrap(), Some(checkpoint));
        store.clear_checkpoint().unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
        store.clear_checkpoint().unwrap();
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryStateStore::new());
    }

    #[test]
    fn file_store() {
        let dir = tempdir().unwrap();
        exercise(&FileStateStore::open(dir.path()).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store.save_baseline(EntityType::Academy, &baseline()).unwrap();
        }
        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_baseline(EntityType::Academy).unwrap(), baseline());
    }

    #[test]
    fn directory_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let _first = FileStateStore::open(dir.path()).unwrap();
        let second = FileStateStore::open(dir.path());
        assert!(matches!(second, Err(SyncError::StateLocked(_))));
    }
}
