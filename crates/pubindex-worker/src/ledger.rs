//! Append-only task ledger
//!
//! One task identifier per line, newline-terminated UTF-8. Several worker
//! processes may append to the same file: every entry is written with a
//! single `O_APPEND` write followed by a flush, and the file is never
//! rewritten during normal operation. [`TaskLedger::reset`] truncates and is
//! only safe for a process that owns the ledger exclusively at startup.
//!
//! A [`LedgerPass`] scopes reads to the entries appended by one `process`
//! call, so concurrent writers never hand a worker someone else's task id.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use pubindex_common::types::TaskId;
use pubindex_common::{PubindexError, Result};

#[derive(Debug)]
pub struct TaskLedger {
    path: PathBuf,
    // serializes appends from tasks of this process
    write_lock: Mutex<()>,
}

impl TaskLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk
    pub async fn append(&self, task_id: &TaskId) -> Result<()> {
        let id = task_id.as_str().trim();
        if id.is_empty() || id.contains(['\n', '\r']) {
            return Err(PubindexError::validation(format!(
                "task id {:?} cannot be stored as a ledger line",
                task_id.as_str()
            )));
        }

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(format!("{}\n", id).as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(task_id = %id, ledger = %self.path.display(), "Task id appended to ledger");
        Ok(())
    }

    /// Every entry currently in the ledger, in file order. A missing file is
    /// an empty ledger; blank lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<TaskId>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(TaskId::new)
            .collect())
    }

    /// Truncate the ledger. Exclusive owners only.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&self.path).await?;
        Ok(())
    }

    /// Start a pass for one `process` call
    pub fn pass(&self) -> LedgerPass<'_> {
        LedgerPass {
            ledger: self,
            unclaimed: Vec::new(),
            recorded: 0,
        }
    }
}

/// Entries written by one processing pass
#[derive(Debug)]
pub struct LedgerPass<'a> {
    ledger: &'a TaskLedger,
    unclaimed: Vec<TaskId>,
    recorded: usize,
}

impl LedgerPass<'_> {
    /// Append to the shared ledger and remember the entry for this pass
    pub async fn record(&mut self, task_id: TaskId) -> Result<()> {
        self.ledger.append(&task_id).await?;
        self.unclaimed.push(task_id);
        self.recorded += 1;
        Ok(())
    }

    /// Take the most recently appended entry not claimed yet
    pub fn claim_latest(&mut self) -> Option<TaskId> {
        self.unclaimed.pop()
    }

    /// Number of entries this pass appended
    pub fn recorded(&self) -> usize {
        self.recorded
    }
}
