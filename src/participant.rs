//! Two-Phase Commit participant
//!
//! Purely reactive: every inbound message is handled to completion and the
//! reply returned on the same stream. Handlers are serialized by a coarse
//! mutex so prepared/committed/aborted transitions for a file are totally
//! ordered, and every transition is durably logged before the reply goes
//! out.
//!
//! A file is either free or locked by exactly one commit. Commit execution
//! deletes the file and fsyncs its directory before the ack is sent, so an
//! acked deletion survives any crash.

use crate::lock_log::{self, LockLogWriter};
use crate::message::{CommitMessage, MessageType};
use crate::network::MessageHandler;
use crate::types::{CommitId, NodeId, SourceFileStatus};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Relative path of the participant's lock log.
pub const LOCK_LOG_PATH: &str = "log/log.txt";

/// Recovery gate poll interval.
const RECOVERY_POLL: Duration = Duration::from_millis(50);

/// The operator decision oracle: shown the composite image and the list of
/// local files it would consume, answers whether to contribute them.
pub trait ApprovalPolicy: Send + Sync {
    fn approve(&self, image: &[u8], files: &[String]) -> bool;
}

/// Approve everything; the headless default.
pub struct AutoApprove;

impl ApprovalPolicy for AutoApprove {
    fn approve(&self, _image: &[u8], _files: &[String]) -> bool {
        true
    }
}

impl<F> ApprovalPolicy for F
where
    F: Fn(&[u8], &[String]) -> bool + Send + Sync,
{
    fn approve(&self, image: &[u8], files: &[String]) -> bool {
        self(image, files)
    }
}

/// Participant state: lock table, durable log, recovery gate.
pub struct Participant {
    node_id: NodeId,
    work_dir: PathBuf,
    log: LockLogWriter,
    /// `source_file -> commit_id` for every tentative lock
    locks: DashMap<String, CommitId>,
    /// Coarse handler serialization; one message at a time
    handler_lock: Mutex<()>,
    recovered: AtomicBool,
    policy: Arc<dyn ApprovalPolicy>,
}

impl Participant {
    pub fn new(
        node_id: impl Into<NodeId>,
        work_dir: impl Into<PathBuf>,
        policy: Arc<dyn ApprovalPolicy>,
    ) -> io::Result<Arc<Self>> {
        let work_dir = work_dir.into();
        let log = LockLogWriter::open(&work_dir.join(LOCK_LOG_PATH))?;
        Ok(Arc::new(Participant {
            node_id: node_id.into(),
            work_dir,
            log,
            locks: DashMap::new(),
            handler_lock: Mutex::new(()),
            recovered: AtomicBool::new(false),
            policy,
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Replay the lock log and rebuild the lock table, then open the gate.
    /// A pair's lock survives if its net count is positive and the file
    /// still exists on disk. Must run before any message is delivered.
    pub fn recover(&self) -> io::Result<()> {
        let replayed = lock_log::replay(self.log.path())?;

        for (file, commit, count) in replayed.live_pairs() {
            if !self.source_path(file).exists() {
                continue;
            }
            if let Some(existing) = self.locks.get(file) {
                // I4 says this cannot happen absent bugs; first seen wins.
                warn!(node = %self.node_id, file = %file, commit = %commit,
                      holder = %*existing, "conflicting replayed lock ignored");
                continue;
            }
            info!(node = %self.node_id, file = %file, commit = %commit, count,
                  "restored lock");
            self.locks.insert(file.to_string(), commit.to_string());
        }

        self.recovered.store(true, Ordering::Release);
        Ok(())
    }

    /// Inbound message handler for the network listener. Blocks behind the
    /// recovery gate, then behind the coarse handler mutex.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let participant = Arc::clone(self);
        Arc::new(move |msg| participant.handle_message(msg))
    }

    fn handle_message(&self, msg: CommitMessage) -> Option<CommitMessage> {
        while !self.recovered.load(Ordering::Acquire) {
            std::thread::sleep(RECOVERY_POLL);
        }
        let _guard = self.handler_lock.lock();

        match msg.msg_type {
            MessageType::CommitQuery => self.handle_query(msg),
            MessageType::CommitMsg => self.handle_decision(msg),
            MessageType::CommitAbort => self.handle_abort(msg),
            other => {
                warn!(node = %self.node_id, msg_type = ?other,
                      "dropping unexpected message type");
                None
            }
        }
    }

    /// Phase I query: consult the oracle, tentatively lock each named file,
    /// and vote. The scan stops at the first missing or conflicting file;
    /// the deny branch releases exactly the locks this commit took, which
    /// may be a strict prefix of the query's file list.
    fn handle_query(&self, msg: CommitMessage) -> Option<CommitMessage> {
        let commit_id = msg.file_name.clone();
        let files = msg.files.clone().unwrap_or_default();
        let image = msg.image.as_deref().unwrap_or_default();

        let mut ok = self.policy.approve(image, &files);

        for file in &files {
            match self.locks.get(file).map(|c| c.value().clone()) {
                Some(holder) if holder != commit_id => {
                    info!(node = %self.node_id, file = %file, holder = %holder,
                          commit = %commit_id, "file locked by another commit");
                    ok = false;
                    break;
                }
                Some(_) => {
                    // Already prepared for this commit (retried query); the
                    // net count must stay at +1.
                    continue;
                }
                None => {
                    if !self.source_path(file).exists() {
                        info!(node = %self.node_id, file = %file, commit = %commit_id,
                              "file missing");
                        ok = false;
                        break;
                    }
                    if let Err(e) = self.log.log(file, &commit_id, SourceFileStatus::Prepared) {
                        error!(node = %self.node_id, file = %file, error = %e,
                               "failed to log prepare");
                        ok = false;
                        break;
                    }
                    self.locks.insert(file.clone(), commit_id.clone());
                }
            }
        }

        if !ok {
            self.release_locks(&commit_id, &files);
        }

        info!(node = %self.node_id, commit = %commit_id, vote = ok, "voting");
        Some(CommitMessage::vote(commit_id, &self.node_id, msg.sender, ok))
    }

    /// Phase II decision. Commit deletes each named file and logs
    /// `committed` whether or not the lock is still in the table, so a
    /// retry after a crash still converges; deny releases like an abort.
    fn handle_decision(&self, msg: CommitMessage) -> Option<CommitMessage> {
        let commit_id = msg.file_name.clone();
        let files = msg.files.clone().unwrap_or_default();

        match msg.agreement {
            Some(true) => {
                for file in &files {
                    if let Err(e) = self.consume_file(file, &commit_id) {
                        error!(node = %self.node_id, file = %file, error = %e,
                               "failed to commit file; awaiting resend");
                        return None;
                    }
                }
                info!(node = %self.node_id, commit = %commit_id, "commit applied");
            }
            Some(false) => {
                self.release_locks(&commit_id, &files);
                info!(node = %self.node_id, commit = %commit_id, "commit denied");
            }
            None => {
                warn!(node = %self.node_id, commit = %commit_id,
                      "dropping decision without agreement flag");
                return None;
            }
        }

        Some(CommitMessage::ack(commit_id, &self.node_id, msg.sender))
    }

    /// Phase II abort: release every lock this commit holds.
    fn handle_abort(&self, msg: CommitMessage) -> Option<CommitMessage> {
        let commit_id = msg.file_name.clone();
        let files = msg.files.clone().unwrap_or_default();
        self.release_locks(&commit_id, &files);
        info!(node = %self.node_id, commit = %commit_id, "commit aborted");
        Some(CommitMessage::ack(commit_id, &self.node_id, msg.sender))
    }

    /// Delete a committed file, make the deletion durable, then log it.
    /// Deleting an already-deleted file is a no-op, which is what makes
    /// Phase II retries idempotent.
    fn consume_file(&self, file: &str, commit_id: &str) -> io::Result<()> {
        let path = self.source_path(file);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    fsync_dir(parent)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.log.log(file, commit_id, SourceFileStatus::Committed)?;
        self.locks
            .remove_if(file, |_, holder| holder == commit_id);
        Ok(())
    }

    /// Release every listed file currently locked by `commit_id`.
    fn release_locks(&self, commit_id: &str, files: &[String]) {
        for file in files {
            let held = self
                .locks
                .get(file)
                .map(|holder| *holder == commit_id)
                .unwrap_or(false);
            if !held {
                continue;
            }
            if let Err(e) = self.log.log(file, commit_id, SourceFileStatus::Aborted) {
                error!(node = %self.node_id, file = %file, error = %e,
                       "failed to log release");
                continue;
            }
            self.locks.remove(file);
        }
    }

    /// Commit currently holding a tentative lock on `file`, if any.
    pub fn lock_holder(&self, file: &str) -> Option<CommitId> {
        self.locks.get(file).map(|c| c.value().clone())
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn source_path(&self, file: &str) -> PathBuf {
        self.work_dir.join(file)
    }
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}
