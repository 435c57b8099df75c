//! File-backed state store.
//!
//! Two JSON documents live under the state directory: `state.json`
//! (process records, health states, trigger cursors) and
//! `trigger_history.json` (append-only history). Every write goes to a
//! temporary sibling first and is renamed into place, so external viewers
//! polling either file never see a partial document.

mod types;

pub use types::{
    EXITED_REASON, FireSource, HealthState, HealthStatus, HistoryOutcome, ProcessRecord, ProcessStatus,
    ProfileKey, Snapshot, TriggerCursor, TriggerHistoryEntry,
};

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::{AgentvisorError, Result};

const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "trigger_history.json";
const LOCK_FILE: &str = "state.lock";
const LOCK_RETRY: Duration = Duration::from_millis(20);

pub struct StateStore {
    dir: PathBuf,
    state_path: PathBuf,
    backup_path: PathBuf,
    history_path: PathBuf,
    lock_path: PathBuf,
    gate: Mutex<()>,
    last_good: StdMutex<Option<Snapshot>>,
    degraded: AtomicBool,
}

/// Advisory lock shared with other agentvisor processes (CLI, daemon).
struct DirLock {
    file: fs::File,
}

impl DirLock {
    /// Waits for another process to release the lock without blocking the
    /// runtime thread.
    async fn acquire(path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state_path: dir.join(STATE_FILE),
            backup_path: dir.join(format!("{STATE_FILE}.bak")),
            history_path: dir.join(HISTORY_FILE),
            lock_path: dir.join(LOCK_FILE),
            gate: Mutex::new(()),
            last_good: StdMutex::new(None),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Read the persisted snapshot. A missing file is an empty snapshot; an
    /// unreadable one is `StateCorrupt`.
    pub async fn load(&self) -> Result<Snapshot> {
        self.read_snapshot()
    }

    /// Apply `f` to the current snapshot and persist the result atomically.
    ///
    /// Callers are serialized both within this process and across processes
    /// sharing the directory. If `f` returns an error nothing is written.
    pub async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> Result<T>,
    {
        let _guard = self.gate.lock().await;
        let _lock = DirLock::acquire(&self.lock_path).await?;

        let mut snapshot = self.read_snapshot()?;
        let value = f(&mut snapshot)?;

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        atomic_write(&self.state_path, &bytes)?;
        if let Err(e) = atomic_write(&self.backup_path, &bytes) {
            warn!("Failed to refresh state backup: {}", e);
        }
        self.remember_good(snapshot);
        Ok(value)
    }

    pub async fn append_history(&self, entry: TriggerHistoryEntry) -> Result<()> {
        let _guard = self.gate.lock().await;
        let _lock = DirLock::acquire(&self.lock_path).await?;

        let mut entries: Vec<TriggerHistoryEntry> = read_document(&self.history_path)?;
        debug!(
            trigger_id = %entry.trigger_id,
            outcome = entry.outcome.as_str(),
            "Appending trigger history"
        );
        entries.push(entry);
        write_document(&self.history_path, &entries)
    }

    /// History entries in append order, optionally for a single trigger.
    pub async fn history(&self, trigger_id: Option<&str>) -> Result<Vec<TriggerHistoryEntry>> {
        let entries: Vec<TriggerHistoryEntry> = read_document(&self.history_path)?;
        Ok(match trigger_id {
            Some(id) => entries.into_iter().filter(|e| e.trigger_id == id).collect(),
            None => entries,
        })
    }

    /// Last snapshot that was successfully read or written by this store.
    pub fn last_good(&self) -> Option<Snapshot> {
        self.last_good
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Replace a corrupt `state.json` with the last known-good snapshot
    /// (in memory, else the on-disk backup). The corrupt file is kept
    /// alongside as `state.json.corrupt-<timestamp>`.
    pub async fn restore_last_good(&self) -> Result<Snapshot> {
        let _guard = self.gate.lock().await;
        let _lock = DirLock::acquire(&self.lock_path).await?;

        let source = match self.last_good() {
            Some(snapshot) => snapshot,
            None => read_document::<Snapshot>(&self.backup_path)?,
        };

        if self.state_path.exists() && read_document::<Snapshot>(&self.state_path).is_err() {
            let preserved = self.dir.join(format!(
                "{STATE_FILE}.corrupt-{}",
                Utc::now().format("%Y%m%dT%H%M%S")
            ));
            fs::rename(&self.state_path, &preserved)?;
            warn!("Preserved corrupt state as {}", preserved.display());
        }

        write_document(&self.state_path, &source)?;
        self.remember_good(source.clone());
        Ok(source)
    }

    fn read_snapshot(&self) -> Result<Snapshot> {
        match read_document::<Snapshot>(&self.state_path) {
            Ok(snapshot) => {
                self.remember_good(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                if matches!(e, AgentvisorError::StateCorrupt { .. }) {
                    self.degraded.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn remember_good(&self, snapshot: Snapshot) {
        if let Ok(mut guard) = self.last_good.lock() {
            *guard = Some(snapshot);
        }
        self.degraded.store(false, Ordering::SeqCst);
    }
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(AgentvisorError::StateCorrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };
    serde_json::from_slice(&raw).map_err(|e| AgentvisorError::StateCorrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}
