//! Durable snapshot of the checklist.
//!
//! The in-memory [`Checklist`] is the source of truth for scheduling; the file
//! only has to be good enough to resume after a restart. Writes are coalesced:
//! a flush requested while another is in flight is dropped, because the next
//! flush serializes whatever is in memory at that point. A wall-clock timer
//! flushes at second 58 of every minute as a backstop.
use chrono::{DateTime, Timelike, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::checklist::Checklist;

const BACKSTOP_SECOND_MS: u64 = 58_000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to serialize checklist: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write checklist snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to replace checklist snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Snapshot writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written,
    /// Another flush was already in progress.
    Suppressed,
}

#[derive(Debug, Default)]
struct CycleProgress {
    id: u64,
    expected: usize,
    completed: usize,
}

/// Resets the in-flight flag however the flush ends.
struct WritingGuard<'a>(&'a AtomicBool);

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChecklistStore {
    path: PathBuf,
    checklist: Mutex<Checklist>,
    writing: AtomicBool,
    cycle: Mutex<CycleProgress>,
}

impl ChecklistStore {
    pub fn new(path: impl Into<PathBuf>, checklist: Checklist) -> Self {
        Self {
            path: path.into(),
            checklist: Mutex::new(checklist),
            writing: AtomicBool::new(false),
            cycle: Mutex::new(CycleProgress::default()),
        }
    }

    /// Loads the snapshot at `path`. A missing or unreadable snapshot is a
    /// cold start with an empty checklist.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let checklist = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Checklist>(&raw) {
                Ok(checklist) => {
                    info!(path = ?path, checks = checklist.len(), "Loaded checklist snapshot.");
                    checklist
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Checklist snapshot is corrupt. Starting with an empty checklist.");
                    Checklist::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?path, "No checklist snapshot found. Starting with an empty checklist.");
                Checklist::new()
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read checklist snapshot. Starting with an empty checklist.");
                Checklist::new()
            }
        };
        Self::new(path, checklist)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Checklist> {
        self.checklist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the checklist. Must not be held across an await.
    pub fn read<R>(&self, f: impl FnOnce(&Checklist) -> R) -> R {
        f(&self.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Checklist) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Checklist {
        self.lock().clone()
    }

    pub fn replace(&self, checklist: Checklist) {
        *self.lock() = checklist;
    }

    /// Writes the current checklist to disk unless a write is already running.
    pub async fn flush(&self) -> Result<FlushOutcome, StoreError> {
        if self.writing.swap(true, Ordering::AcqRel) {
            debug!("Checklist flush already in progress; skipping.");
            return Ok(FlushOutcome::Suppressed);
        }
        let _guard = WritingGuard(&self.writing);

        let (serialized, checks) = {
            let checklist = self.lock();
            (serde_json::to_vec_pretty(&*checklist)?, checklist.len())
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &serialized)).await??;

        debug!(path = ?self.path, checks, "Checklist snapshot written.");
        Ok(FlushOutcome::Written)
    }

    /// Flushes and logs instead of returning the error; in-memory state keeps
    /// serving scheduling and the next successful write catches up.
    pub async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            error!(path = ?self.path, error = %e, "Failed to persist checklist.");
        }
    }

    /// Starts counting completions for a dispatch cycle of `expected` jobs.
    /// Returns the id completions of this cycle must be recorded under.
    pub fn begin_cycle(&self, expected: usize) -> u64 {
        let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        cycle.id += 1;
        cycle.expected = expected;
        cycle.completed = 0;
        cycle.id
    }

    /// Records one finalized job of cycle `cycle_id`. Returns true when this
    /// completion reached the cycle's expected count, in which case the store
    /// has been flushed. Completions of superseded cycles are not counted;
    /// their writes reach disk with the next flush.
    pub async fn record_completion(&self, cycle_id: u64) -> bool {
        let reached = {
            let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
            if cycle.id != cycle_id {
                debug!(cycle_id, current = cycle.id, "Completion from a superseded cycle.");
                return false;
            }
            cycle.completed += 1;
            cycle.expected > 0 && cycle.completed == cycle.expected
        };
        if reached {
            debug!("All checks of the current cycle completed; flushing checklist.");
            self.flush_logged().await;
        }
        reached
    }

    /// Flushes at second 58 of every minute until shutdown.
    pub async fn backstop_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let wait = until_backstop(Utc::now());
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping checklist backstop flush.");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.flush_logged().await;
                }
            }
        }
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

/// Time until the next wall-clock second 58.
pub fn until_backstop(now: DateTime<Utc>) -> Duration {
    // nanosecond() exceeds 1e9 during a leap second.
    let millis = (now.nanosecond() / 1_000_000).min(999) as u64;
    let into_minute = now.second() as u64 * 1000 + millis;
    let wait = if into_minute < BACKSTOP_SECOND_MS {
        BACKSTOP_SECOND_MS - into_minute
    } else {
        60_000 - into_minute + BACKSTOP_SECOND_MS
    };
    Duration::from_millis(wait)
}
