//! Durable workflow state storage.
//!
//! One JSON file per run under the state directory, written atomically:
//! serialize to `<id>.json.tmp`, then rename over `<id>.json`. The previous
//! file is copied to `<id>.json.bak` first, so a crash mid-save leaves
//! either the old state or the new state on disk, never a torn file.
//!
//! Every file embeds a SHA-256 checksum of its own contents (computed with
//! the checksum field empty). Load recomputes and compares; a mismatch is
//! reported as corruption and the stored state is never partially applied.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::rlog_debug;
use crate::workflow::{WorkflowId, WorkflowState};

/// Advisory single-writer lock for one workflow's state file.
///
/// Created via [`StateStore::lock`] and held for the duration of a run.
/// `save` requires a reference to the lock, so writes without it do not
/// compile. The lock file is removed on drop.
#[derive(Debug)]
pub struct StateLock {
    workflow_id: WorkflowId,
    path: PathBuf,
}

impl StateLock {
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            rlog_debug!(
                "StateLock::drop failed to remove {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// File-backed store for workflow run state.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    fn state_path(&self, id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn lock_path(&self, id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    /// Acquire the advisory writer lock for a run.
    ///
    /// Uses `create_new` so acquisition is atomic at the filesystem level.
    /// If another process (or a concurrent task) already holds the lock,
    /// returns a conflict error rather than blocking. A lock left behind
    /// by a crashed process is reclaimed: the holder PID recorded in the
    /// file is checked for liveness before conflicting.
    pub fn lock(&self, id: WorkflowId) -> Result<StateLock> {
        let path = self.lock_path(id);
        // Second iteration retries create_new after reclaiming a stale file.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    rlog_debug!("StateStore::lock acquired id={}", id.short());
                    return Ok(StateLock {
                        workflow_id: id,
                        path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_holder_is_alive(&path) {
                        return Err(Error::Conflict { workflow_id: id });
                    }
                    rlog_debug!(
                        "StateStore::lock reclaiming stale lock id={}",
                        id.short()
                    );
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict { workflow_id: id })
    }

    /// Persist the state atomically.
    ///
    /// Requires the run's writer lock; embeds a fresh checksum before
    /// writing. The caller's in-memory state is not modified.
    pub fn save(&self, state: &WorkflowState, lock: &StateLock) -> Result<()> {
        if lock.workflow_id != state.workflow_id {
            return Err(Error::Conflict {
                workflow_id: state.workflow_id,
            });
        }

        let mut stamped = state.clone();
        stamped.checksum = String::new();
        stamped.checksum = checksum_of(&stamped)?;
        let contents = serde_json::to_string_pretty(&stamped)?;

        let state_path = self.state_path(state.workflow_id);
        if state_path.exists() {
            let backup_path = state_path.with_extension("json.bak");
            fs::copy(&state_path, &backup_path)?;
        }

        let temp_path = state_path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &state_path)?;
        rlog_debug!(
            "StateStore::save id={} checkpoints={}",
            state.workflow_id.short(),
            state.checkpoints.len()
        );

        Ok(())
    }

    /// Load and verify a run's state.
    ///
    /// Returns `NotFound` if no file exists and `Corruption` if the file
    /// fails to parse or its checksum does not match its contents.
    pub fn load(&self, id: WorkflowId) -> Result<WorkflowState> {
        let state_path = self.state_path(id);
        if !state_path.exists() {
            return Err(Error::NotFound { workflow_id: id });
        }

        let contents = fs::read_to_string(&state_path)?;
        let mut state: WorkflowState = serde_json::from_str(&contents)
            .map_err(|_| Error::Corruption { workflow_id: id })?;

        let stored = std::mem::take(&mut state.checksum);
        let computed = checksum_of(&state)?;
        if stored != computed {
            rlog_debug!(
                "StateStore::load checksum mismatch id={} stored={} computed={}",
                id.short(),
                stored,
                computed
            );
            return Err(Error::Corruption { workflow_id: id });
        }
        state.checksum = stored;

        Ok(state)
    }

    /// Whether a state file exists for the run.
    pub fn exists(&self, id: WorkflowId) -> bool {
        self.state_path(id).exists()
    }

    /// Remove a run's state file, backup, and any stale lock.
    pub fn delete(&self, id: WorkflowId) -> Result<()> {
        let state_path = self.state_path(id);
        if !state_path.exists() {
            return Err(Error::NotFound { workflow_id: id });
        }
        fs::remove_file(&state_path)?;

        let backup_path = state_path.with_extension("json.bak");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        let lock_path = self.lock_path(id);
        if lock_path.exists() {
            fs::remove_file(&lock_path)?;
        }

        rlog_debug!("StateStore::delete id={}", id.short());
        Ok(())
    }

    /// Ids of all runs with a state file, in no particular order.
    pub fn list(&self) -> Result<Vec<WorkflowId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<WorkflowId>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Directory this store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Whether the process named in a lock file is still running.
///
/// An unreadable or unparseable lock file counts as dead. A PID matching
/// the current process means another task in this process holds the lock.
/// On platforms without procfs the holder is assumed alive, so stale
/// locks there need an explicit `delete`.
fn lock_holder_is_alive(path: &Path) -> bool {
    let pid = match fs::read_to_string(path) {
        Ok(contents) => match contents.trim().parse::<u32>() {
            Ok(pid) => pid,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// SHA-256 hex digest of the state's canonical serialization.
///
/// The caller must have emptied the checksum field first; otherwise the
/// digest would cover itself.
fn checksum_of(state: &WorkflowState) -> Result<String> {
    let bytes = serde_json::to_vec(state)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
