//! Participant lock log
//!
//! Single append-only text file (`log/log.txt`) recording every lock
//! transition as a `<source_file>:<commit_id>:<STATUS>` line. Replay keeps a
//! net count per `(source_file, commit_id)` pair: +1 for PREPARED, -1 for
//! ABORTED or COMMITTED. A positive net count for a file that still exists
//! on disk means the lock survives the restart.
//!
//! Source file names may themselves contain `:`. The commit id and status
//! are split off the right-hand side, so only the last two fields are
//! structural.

use crate::types::{CommitId, SourceFileStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-side handle to the participant log.
pub struct LockLogWriter {
    file: Mutex<File>,
    path: PathBuf,
}

impl LockLogWriter {
    /// Create or reopen the log at `path`, creating parent directories.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LockLogWriter {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one lock transition.
    pub fn log(
        &self,
        source_file: &str,
        commit_id: &str,
        status: SourceFileStatus,
    ) -> io::Result<()> {
        let mut file = self.file.lock();
        let line = format!("{}:{}:{}\n", source_file, commit_id, status);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_all()
    }
}

/// Replay result: net counts in first-seen log order.
#[derive(Debug, Default)]
pub struct LockLogReplay {
    counts: HashMap<(String, CommitId), i64>,
    order: Vec<(String, CommitId)>,
}

impl LockLogReplay {
    fn bump(&mut self, file: String, commit: CommitId, delta: i64) {
        let key = (file, commit);
        match self.counts.get_mut(&key) {
            Some(count) => *count += delta,
            None => {
                self.counts.insert(key.clone(), delta);
                self.order.push(key);
            }
        }
    }

    /// Pairs with a positive net count, in the order the log first named
    /// them. First-seen order is what makes conflicting replays (which
    /// cannot happen absent bugs) resolve deterministically.
    pub fn live_pairs(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.order.iter().filter_map(|key| {
            let count = *self.counts.get(key)?;
            (count > 0).then(|| (key.0.as_str(), key.1.as_str(), count))
        })
    }

    pub fn net_count(&self, source_file: &str, commit_id: &str) -> i64 {
        self.counts
            .get(&(source_file.to_string(), commit_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Replay the whole log. A missing file is an empty replay; a malformed
/// line is an error naming the offending text rather than a silent skip.
pub fn replay(path: &Path) -> io::Result<LockLogReplay> {
    let mut out = LockLogReplay::default();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (rest, status) = line
            .rsplit_once(':')
            .ok_or_else(|| malformed(&line))?;
        let (source_file, commit_id) = rest
            .rsplit_once(':')
            .ok_or_else(|| malformed(&line))?;
        if source_file.is_empty() || commit_id.is_empty() {
            return Err(malformed(&line));
        }
        let status = status
            .parse::<SourceFileStatus>()
            .map_err(|_| malformed(&line))?;

        let delta = match status {
            SourceFileStatus::Prepared => 1,
            SourceFileStatus::Aborted | SourceFileStatus::Committed => -1,
        };
        out.bump(source_file.to_string(), commit_id.to_string(), delta);
    }

    Ok(out)
}

fn malformed(line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed lock log line: {:?}", line),
    )
}
