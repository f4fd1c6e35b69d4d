//! Append-only ledger of finished runs and their conflicts.
//!
//! Runs are appended once, when they reach a terminal status; runs still
//! queued or executing are tracked by the run queue instead. Nothing in the
//! log is ever rewritten or deleted.

use crate::error::SyncResult;
use edgesync_protocol::{SyncConflict, SyncRun};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const RUNS_FILE: &str = "runs.jsonl";
const CONFLICTS_FILE: &str = "conflicts.jsonl";

/// Append-only run ledger.
pub trait HistoryLog: Send + Sync {
    /// Appends a terminal run.
    fn append_run(&self, run: &SyncRun) -> SyncResult<()>;

    /// Appends conflict records.
    fn append_conflicts(&self, conflicts: &[SyncConflict]) -> SyncResult<()>;

    /// Looks up a run by ID.
    fn find_run(&self, run_id: Uuid) -> Option<SyncRun>;

    /// Most recent runs, newest first.
    fn recent_runs(&self, limit: usize) -> Vec<SyncRun>;

    /// Conflicts recorded by one run, in detection order.
    fn conflicts_for(&self, run_id: Uuid) -> Vec<SyncConflict>;

    /// Number of runs recorded.
    fn run_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct Ledger {
    runs: Vec<SyncRun>,
    conflicts: Vec<SyncConflict>,
}

impl Ledger {
    fn find_run(&self, run_id: Uuid) -> Option<SyncRun> {
        self.runs.iter().rev().find(|r| r.id == run_id).cloned()
    }

    fn recent_runs(&self, limit: usize) -> Vec<SyncRun> {
        self.runs.iter().rev().take(limit).cloned().collect()
    }

    fn conflicts_for(&self, run_id: Uuid) -> Vec<SyncConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect()
    }
}

/// History held in memory.
#[derive(Debug, Default)]
pub struct MemoryHistoryLog {
    ledger: Mutex<Ledger>,
}

impl MemoryHistoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryLog for MemoryHistoryLog {
    fn append_run(&self, run: &SyncRun) -> SyncResult<()> {
        self.ledger.lock().runs.push(run.clone());
        Ok(())
    }

    fn append_conflicts(&self, conflicts: &[SyncConflict]) -> SyncResult<()> {
        self.ledger
            .lock()
            .conflicts
            .extend(conflicts.iter().cloned());
        Ok(())
    }

    fn find_run(&self, run_id: Uuid) -> Option<SyncRun> {
        self.ledger.lock().find_run(run_id)
    }

    fn recent_runs(&self, limit: usize) -> Vec<SyncRun> {
        self.ledger.lock().recent_runs(limit)
    }

    fn conflicts_for(&self, run_id: Uuid) -> Vec<SyncConflict> {
        self.ledger.lock().conflicts_for(run_id)
    }

    fn run_count(&self) -> usize {
        self.ledger.lock().runs.len()
    }
}

struct FileLedger {
    ledger: Ledger,
    runs_file: File,
    conflicts_file: File,
}

/// History stored as JSON Lines files.
///
/// The in-memory index is rebuilt from the files on open. A torn last line
/// from an interrupted write is skipped.
pub struct FileHistoryLog {
    dir: PathBuf,
    inner: Mutex<FileLedger>,
}

impl std::fmt::Debug for FileHistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHistoryLog")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileHistoryLog {
    /// Opens (creating if needed) the history files in `dir`.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(dir)?;
        let runs_path = dir.join(RUNS_FILE);
        let conflicts_path = dir.join(CONFLICTS_FILE);

        let ledger = Ledger {
            runs: read_lines(&runs_path)?,
            conflicts: read_lines(&conflicts_path)?,
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(FileLedger {
                ledger,
                runs_file: open_append(&runs_path)?,
                conflicts_file: open_append(&conflicts_path)?,
            }),
        })
    }

    /// Returns the history directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl HistoryLog for FileHistoryLog {
    fn append_run(&self, run: &SyncRun) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        append_line(&mut inner.runs_file, run)?;
        inner.ledger.runs.push(run.clone());
        Ok(())
    }

    fn append_conflicts(&self, conflicts: &[SyncConflict]) -> SyncResult<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        for conflict in conflicts {
            append_line(&mut inner.conflicts_file, conflict)?;
        }
        inner.conflicts_file.sync_data()?;
        inner.ledger.conflicts.extend(conflicts.iter().cloned());
        Ok(())
    }

    fn find_run(&self, run_id: Uuid) -> Option<SyncRun> {
        self.inner.lock().ledger.find_run(run_id)
    }

    fn recent_runs(&self, limit: usize) -> Vec<SyncRun> {
        self.inner.lock().ledger.recent_runs(limit)
    }

    fn conflicts_for(&self, run_id: Uuid) -> Vec<SyncConflict> {
        self.inner.lock().ledger.conflicts_for(run_id)
    }

    fn run_count(&self) -> usize {
        self.inner.lock().ledger.runs.len()
    }
}

fn open_append(path: &Path) -> SyncResult<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    // Terminate a torn last line so the next record starts on its own line.
    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            file.write_all(b"\n")?;
        }
    }
    Ok(file)
}

fn append_line<T: Serialize>(file: &mut File, value: &T) -> SyncResult<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.flush()?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> SyncResult<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                file = %path.display(),
                line = index + 1,
                error = %e,
                "skipping unreadable history record"
            ),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgesync_protocol::{EntityType, RunStatus, Side, SyncRequest};
    use tempfile::tempdir;

    fn finished_run() -> SyncRun {
        let mut run = SyncRun::pending(&SyncRequest::scheduled());
        run.start(Utc::now()).unwrap();
        run.finish(RunStatus::Succeeded, Utc::now()).unwrap();
        run
    }

    fn exercise(log: &dyn HistoryLog) -> (SyncRun, SyncRun) {
        let first = finished_run();
        let second = finished_run();
        log.append_run(&first).unwrap();
        log.append_run(&second).unwrap();
        log.append_conflicts(&[SyncConflict::invalid(
            first.id,
            EntityType::User,
            "u1",
            Side::Primary,
            "bad payload",
        )])
        .unwrap();

        let recent = log.recent_runs(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second.id);
        assert_eq!(log.recent_runs(1).len(), 1);
        assert_eq!(log.find_run(first.id), Some(first.clone()));
        assert!(log.find_run(Uuid::new_v4()).is_none());
        assert_eq!(log.conflicts_for(first.id).len(), 1);
        assert!(log.conflicts_for(second.id).is_empty());
        (first, second)
    }

    #[test]
    fn memory_log() {
        exercise(&MemoryHistoryLog::new());
    }

    #[test]
    fn file_log_survives_reopen() {
        let dir = tempdir().unwrap();
        let (first, second) = {
            let log = FileHistoryLog::open(dir.path()).unwrap();
            exercise(&log)
        };

        let log = FileHistoryLog::open(dir.path()).unwrap();
        assert_eq!(log.run_count(), 2);
        assert_eq!(log.recent_runs(10)[0].id, second.id);
        assert_eq!(log.conflicts_for(first.id).len(), 1);
    }

    #[test]
    fn torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let log = FileHistoryLog::open(dir.path()).unwrap();
            log.append_run(&finished_run()).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(RUNS_FILE))
            .unwrap();
        file.write_all(b"{\"id\":\"trunc").unwrap();

        let log = FileHistoryLog::open(dir.path()).unwrap();
        assert_eq!(log.run_count(), 1);
        log.append_run(&finished_run()).unwrap();
        drop(log);

        let log = FileHistoryLog::open(dir.path()).unwrap();
        assert_eq!(log.run_count(), 2);
    }
}
