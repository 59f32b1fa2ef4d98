//! Coordinator commit log
//!
//! One append-only text file per commit under the log directory, named
//! `log_<stem>.txt` where `<stem>` is the composite file name with any
//! directory and extension stripped. Line alphabet:
//!
//! ```text
//! File Name: composites/1.jpg
//! Sources: a:1.jpg,b:3.jpg
//! Phase One
//! Phase Two: yes
//! DONE
//! ```
//!
//! Every append is followed by an fsync so the marker is on disk before any
//! externally observable action that depends on it.

use crate::types::{Decision, SourceRef};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const FILE_NAME_PREFIX: &str = "File Name: ";
const SOURCES_PREFIX: &str = "Sources: ";
const PHASE_ONE_MARKER: &str = "Phase One";
const PHASE_TWO_PREFIX: &str = "Phase Two: ";
const DONE_MARKER: &str = "DONE";

/// Log file name for a composite, `log_<stem>.txt`.
pub fn log_file_name(composite: &str) -> String {
    let stem = Path::new(composite)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(composite);
    format!("log_{}.txt", stem)
}

/// Append-side handle to one commit's log.
pub struct CommitLogWriter {
    file: Mutex<File>,
    path: PathBuf,
}

impl CommitLogWriter {
    /// Create or reopen the log for `composite` under `log_dir`.
    pub fn open(log_dir: &Path, composite: &str) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(log_file_name(composite));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(CommitLogWriter {
            file: Mutex::new(file),
            path,
        })
    }

    /// Reopen an existing log at its path (recovery side).
    pub fn reopen(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(CommitLogWriter {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()
    }

    /// Durably record the commit's identity and contribution list.
    pub fn log_header(&self, composite: &str, sources: &[SourceRef]) -> io::Result<()> {
        self.append(&format!("{}{}", FILE_NAME_PREFIX, composite))?;
        let joined = sources
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.append(&format!("{}{}", SOURCES_PREFIX, joined))
    }

    /// Durably mark the start of Phase I.
    pub fn log_phase_one(&self) -> io::Result<()> {
        self.append(PHASE_ONE_MARKER)
    }

    /// Durably record the decision. For `yes` the caller must have written
    /// the composite to disk first; recovery treats a log without this
    /// marker as abort and deletes any partial composite.
    pub fn log_phase_two(&self, decision: Decision) -> io::Result<()> {
        self.append(&format!("{}{}", PHASE_TWO_PREFIX, decision))
    }

    /// Durably mark the commit finished; a DONE commit is never reprocessed.
    pub fn log_done(&self) -> io::Result<()> {
        self.append(DONE_MARKER)
    }
}

/// Replay summary of one commit log.
#[derive(Debug, Clone, Default)]
pub struct CommitLogReplay {
    pub file_name: Option<String>,
    pub sources: Vec<SourceRef>,
    pub phase_one: bool,
    pub phase_two: Option<Decision>,
    pub done: bool,
}

/// Replay one commit log file into its marker summary.
pub fn replay(path: &Path) -> io::Result<CommitLogReplay> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = CommitLogReplay::default();

    for line in reader.lines() {
        let line = line?;
        if let Some(name) = line.strip_prefix(FILE_NAME_PREFIX) {
            out.file_name = Some(name.to_string());
        } else if let Some(joined) = line.strip_prefix(SOURCES_PREFIX) {
            out.sources = joined
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<SourceRef>().map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, e)
                    })
                })
                .collect::<io::Result<Vec<_>>>()?;
        } else if line == PHASE_ONE_MARKER {
            out.phase_one = true;
        } else if let Some(decision) = line.strip_prefix(PHASE_TWO_PREFIX) {
            let decision = decision
                .parse::<Decision>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            out.phase_two = Some(decision);
        } else if line == DONE_MARKER {
            out.done = true;
        } else if !line.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized commit log line: {:?}", line),
            ));
        }
    }

    Ok(out)
}

/// All commit log files currently present under `log_dir`.
pub fn scan_log_dir(log_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    if !log_dir.exists() {
        return Ok(logs);
    }
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if path.is_file() && name.starts_with("log_") && name.ends_with(".txt") {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}
