//! # Stage: Session Log
//!
//! ## Responsibility
//! Persist one tuning session as an append-only JSON-lines file:
//! `<directory>/<prefix>_<YYYYmmdd_HHMMSS>.jsonl`. Each line is either a
//! journal entry (`"kind": "evaluation" | "proposal" | "transition"`) or a
//! campaign checkpoint (`"kind": "checkpoint"`).
//!
//! ## Guarantees
//! - Journal entries are written in journal order, each exactly once; a
//!   batch that fails midway is truncated off the file
//! - The file and its directory are created on first write, so a session
//!   that never saves leaves nothing behind
//! - Lines are flushed to disk before [`SessionLog::write`] returns
//!
//! ## NOT Responsible For
//! - Deciding when to save (that belongs to `coordinator`)
//! - CSV export or plotting

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::optimizer::{CampaignState, SequentialOptimizer};

#[derive(Serialize)]
struct Checkpoint<'a> {
    kind: &'static str,
    timestamp: f64,
    state: &'a CampaignState,
}

/// Append-only JSON-lines log for one session.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    cursor: usize,
}

impl SessionLog {
    /// Session file named after the current local time.
    pub fn new(config: &LogConfig) -> Self {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = Path::new(&config.directory)
            .join(format!("{}_{stamp}.jsonl", config.filename_prefix));
        Self { path, cursor: 0 }
    }

    /// Session file at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: 0,
        }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal entries already written.
    pub fn written(&self) -> usize {
        self.cursor
    }

    /// Append journal entries not yet written, then a checkpoint of the
    /// campaign cursor. Returns the number of journal entries written.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O or serialization error. A failed batch is
    /// truncated off the file and retried in full on the next call.
    pub fn write(&mut self, optimizer: &SequentialOptimizer) -> io::Result<usize> {
        let entries = optimizer.journal_since(self.cursor);
        let mut batch = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut batch, entry)?;
            batch.push(b'\n');
        }
        let state = optimizer.state();
        serde_json::to_writer(
            &mut batch,
            &Checkpoint {
                kind: "checkpoint",
                timestamp: crate::unix_seconds(),
                state: &state,
            },
        )?;
        batch.push(b'\n');

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        append_or_rollback(&mut file, &batch, |f| f.set_len(start))?;

        let n = entries.len();
        self.cursor += n;
        debug!(path = %self.path.display(), entries = n, "session log written");
        if n > 0 {
            info!(path = %self.path.display(), total = self.cursor, "session saved");
        }
        Ok(n)
    }
}

/// Write `bytes` in full, or undo whatever part of them landed.
fn append_or_rollback<W: Write>(
    out: &mut W,
    bytes: &[u8],
    rollback: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()> {
    let written = out.write_all(bytes).and_then(|()| out.flush());
    if let Err(e) = written {
        if let Err(undo) = rollback(out) {
            warn!(error = %undo, "could not roll back partial session log batch");
        }
        return Err(e);
    }
    Ok(())
}

/// Read every line of a session file as JSON.
///
/// # Errors
///
/// Returns the I/O error, or an `InvalidData` error for a malformed line.
pub fn read_lines(path: &Path) -> io::Result<Vec<serde_json::Value>> {
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        values.push(serde_json::from_str(&line)?);
    }
    Ok(values)
}
