//! Two-Phase Commit coordinator
//!
//! Drives each commit through Phase I (query/vote) and Phase II
//! (decide/ack). One driver task per commit owns the state machine; the
//! message router dispatches inbound votes and acks to the owning commit's
//! queues by composite file name.
//!
//! Durability contract: every phase marker reaches disk before any message
//! that depends on it is sent, and the composite image reaches disk before
//! the `Phase Two: yes` marker does.

use crate::commit_log::CommitLogWriter;
use crate::message::{CommitMessage, MessageType};
use crate::network::{MessageHandler, Network};
use crate::types::{CommitId, CommitPhase, Decision, NodeId, SourceRef};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Phase I vote window.
pub const PHASE_ONE_TIMEOUT: Duration = Duration::from_secs(6);
/// Phase II per-wait ack window; expiry triggers a resend.
pub const PHASE_TWO_TIMEOUT: Duration = Duration::from_secs(6);

/// Name of the commit log directory under the working directory.
pub const LOG_DIR: &str = "log";

/// Recovery gate poll interval.
pub(crate) const RECOVERY_POLL: Duration = Duration::from_millis(50);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Vote window for Phase I; silence past it is a no
    pub phase_one_timeout: Duration,
    /// Ack window for Phase II; expiry resends the decision
    pub phase_two_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            phase_one_timeout: PHASE_ONE_TIMEOUT,
            phase_two_timeout: PHASE_TWO_TIMEOUT,
        }
    }
}

/// Where a driver picks up the state machine. Fresh commits run the whole
/// protocol; recovered ones skip what the log proves already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStart {
    /// New commit: Phase I, persist, Phase II
    Full,
    /// Log holds `Phase Two: <decision>`: rebroadcast it and collect acks
    PhaseTwoRecover(Decision),
    /// Log holds only `Phase One`: no participant saw a decision, so abort
    /// is safe; any partial composite is deleted first
    PhaseOneAbort,
}

/// Router endpoints and observable state for one in-flight commit.
pub(crate) struct CommitHandle {
    vote_tx: mpsc::UnboundedSender<CommitMessage>,
    ack_tx: mpsc::UnboundedSender<CommitMessage>,
    phase: Mutex<CommitPhase>,
}

/// The coordinator: commit table, router, and driver factory.
pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    pub(crate) network: Arc<Network>,
    pub(crate) work_dir: PathBuf,
    pub(crate) commits: DashMap<CommitId, CommitHandle>,
    pub(crate) recovered: AtomicBool,
}

impl Coordinator {
    pub fn new(
        network: Arc<Network>,
        work_dir: impl Into<PathBuf>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Coordinator {
            config,
            network,
            work_dir: work_dir.into(),
            commits: DashMap::new(),
            recovered: AtomicBool::new(false),
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join(LOG_DIR)
    }

    /// Number of commits currently in flight.
    pub fn in_flight(&self) -> usize {
        self.commits.len()
    }

    /// Current phase of a live commit, if one owns `file_name`.
    pub fn commit_phase(&self, file_name: &str) -> Option<CommitPhase> {
        self.commits.get(file_name).map(|h| *h.phase.lock())
    }

    pub(crate) fn set_phase(&self, file_name: &str, phase: CommitPhase) {
        if let Some(handle) = self.commits.get(file_name) {
            *handle.phase.lock() = phase;
        }
    }

    /// Inbound message handler for the network listener: pure routing.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let coordinator = Arc::clone(self);
        Arc::new(move |msg| {
            coordinator.route(msg);
            None
        })
    }

    /// Dispatch an inbound message to the owning commit's queue. Unknown
    /// file names can only come from a commit already DONE or from corrupt
    /// traffic; both are dropped with a diagnostic.
    pub fn route(&self, msg: CommitMessage) {
        let Some(handle) = self.commits.get(&msg.file_name) else {
            warn!(commit = %msg.file_name, msg_type = ?msg.msg_type,
                  "dropping message for unknown commit");
            return;
        };
        let file_name = msg.file_name.clone();
        let result = match msg.msg_type {
            MessageType::CommitAgreement => handle.vote_tx.send(msg),
            MessageType::CommitAck => handle.ack_tx.send(msg),
            _ => {
                warn!(commit = %file_name, msg_type = ?msg.msg_type,
                      "dropping unexpected message type");
                return;
            }
        };
        // A dropped receiver means the driver already finished its phase;
        // late votes and duplicate acks land here.
        if result.is_err() {
            warn!(commit = %file_name, "dropping message for finished phase");
        }
    }

    /// Start a commit for `file_name` assembled from `sources`
    /// (`<node_id>:<source_file>` each). No failure return: invalid input
    /// is diagnosed and refused. Success is observable as `file_name`
    /// appearing on disk.
    pub async fn start_commit(self: &Arc<Self>, file_name: &str, image: Vec<u8>, sources: &[String]) {
        while !self.recovered.load(Ordering::Acquire) {
            tokio::time::sleep(RECOVERY_POLL).await;
        }
        if let Err(e) = self.try_start_commit(file_name, image, sources) {
            error!(commit = %file_name, error = %e, "refusing commit");
        }
    }

    fn try_start_commit(
        self: &Arc<Self>,
        file_name: &str,
        image: Vec<u8>,
        sources: &[String],
    ) -> Result<(), String> {
        if self.commits.contains_key(file_name) {
            return Err("a live commit already owns this file name".to_string());
        }

        let sources = sources
            .iter()
            .map(|s| s.parse::<SourceRef>())
            .collect::<Result<Vec<_>, _>>()?;
        if sources.is_empty() {
            return Err("commit has no sources".to_string());
        }

        let log = CommitLogWriter::open(&self.log_dir(), file_name)
            .map_err(|e| format!("failed to open commit log: {}", e))?;
        log.log_header(file_name, &sources)
            .map_err(|e| format!("failed to log commit header: {}", e))?;
        log.log_phase_one()
            .map_err(|e| format!("failed to log Phase One: {}", e))?;

        info!(commit = %file_name, sources = sources.len(), "starting commit");
        self.spawn_driver(file_name, &sources, Some(image), log, DriverStart::Full);
        Ok(())
    }

    /// Register a commit in the router and spawn its driver task.
    pub(crate) fn spawn_driver(
        self: &Arc<Self>,
        file_name: &str,
        sources: &[SourceRef],
        image: Option<Vec<u8>>,
        log: CommitLogWriter,
        start: DriverStart,
    ) -> JoinHandle<()> {
        let (vote_tx, vote_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let phase = match start {
            DriverStart::Full => CommitPhase::Init,
            DriverStart::PhaseTwoRecover(decision) => CommitPhase::PhaseTwo(decision),
            DriverStart::PhaseOneAbort => CommitPhase::PhaseOne,
        };
        self.commits.insert(
            file_name.to_string(),
            CommitHandle {
                vote_tx,
                ack_tx,
                phase: Mutex::new(phase),
            },
        );

        let driver = CommitDriver {
            coordinator: Arc::clone(self),
            file_name: file_name.to_string(),
            per_node_files: group_by_node(sources),
            image,
            log,
            vote_rx,
            ack_rx,
        };
        tokio::spawn(driver.run(start))
    }
}

/// Per-node contribution lists, derived from the ordered source sequence.
pub(crate) fn group_by_node(sources: &[SourceRef]) -> HashMap<NodeId, Vec<String>> {
    let mut per_node: HashMap<NodeId, Vec<String>> = HashMap::new();
    for source in sources {
        per_node
            .entry(source.node.clone())
            .or_default()
            .push(source.file.clone());
    }
    per_node
}

/// One commit's driver task: owns the queues' receive side and the log.
struct CommitDriver {
    coordinator: Arc<Coordinator>,
    file_name: CommitId,
    per_node_files: HashMap<NodeId, Vec<String>>,
    image: Option<Vec<u8>>,
    log: CommitLogWriter,
    vote_rx: mpsc::UnboundedReceiver<CommitMessage>,
    ack_rx: mpsc::UnboundedReceiver<CommitMessage>,
}

impl CommitDriver {
    async fn run(mut self, start: DriverStart) {
        let result = match start {
            DriverStart::Full => self.run_full().await,
            DriverStart::PhaseTwoRecover(decision) => self.run_phase_two_recover(decision).await,
            DriverStart::PhaseOneAbort => self.run_phase_one_abort().await,
        };
        match result {
            // The next startup's recovery pass finishes what a write
            // failure interrupted; the record leaves the table either way.
            Err(e) => error!(commit = %self.file_name, error = %e, "commit driver failed"),
            Ok(()) => info!(commit = %self.file_name, "commit done"),
        }
        self.coordinator.commits.remove(&self.file_name);
    }

    async fn run_full(&mut self) -> io::Result<()> {
        self.coordinator
            .set_phase(&self.file_name, CommitPhase::PhaseOne);
        let decision = self.run_phase_one().await;
        info!(commit = %self.file_name, decision = %decision, "phase one complete");

        if decision == Decision::Yes {
            self.write_composite()?;
        }
        self.log.log_phase_two(decision)?;
        self.coordinator
            .set_phase(&self.file_name, CommitPhase::PhaseTwo(decision));

        self.run_phase_two(decision).await;
        self.coordinator.set_phase(&self.file_name, CommitPhase::Done);
        self.log.log_done()
    }

    async fn run_phase_two_recover(&mut self, decision: Decision) -> io::Result<()> {
        info!(commit = %self.file_name, decision = %decision, "recovering phase two");
        self.run_phase_two(decision).await;
        self.log.log_done()
    }

    async fn run_phase_one_abort(&mut self) -> io::Result<()> {
        info!(commit = %self.file_name, "aborting commit interrupted in phase one");
        self.remove_partial_composite()?;
        self.run_phase_two(Decision::Abort).await;
        self.log.log_phase_two(Decision::Abort)?;
        self.log.log_done()
    }

    /// Phase I: query every distinct participant, then aggregate votes.
    /// Silence past the window is a no; the cumulative wall clock since the
    /// phase began bounds the whole exchange.
    async fn run_phase_one(&mut self) -> Decision {
        for (node, files) in &self.per_node_files {
            let image = self.image.clone().unwrap_or_default();
            let query = CommitMessage::query(
                &self.file_name,
                self.coordinator.network.local_id(),
                node,
                files.clone(),
                image,
            );
            self.send_and_route(node.clone(), query);
        }

        let deadline = Instant::now() + self.coordinator.config.phase_one_timeout;
        let mut approvals: HashSet<NodeId> = HashSet::new();
        let mut denials: HashSet<NodeId> = HashSet::new();
        let total = self.per_node_files.len();

        while approvals.len() + denials.len() < total {
            let now = Instant::now();
            if now >= deadline {
                return Decision::Abort;
            }
            let wait = (deadline - now).min(self.coordinator.config.phase_one_timeout);

            let msg = match tokio::time::timeout(wait, self.vote_rx.recv()).await {
                Ok(Some(msg)) => msg,
                // Timeout, or the channel somehow closed: silence is no.
                _ => return Decision::Abort,
            };

            if !self.per_node_files.contains_key(&msg.sender) {
                warn!(commit = %self.file_name, sender = %msg.sender,
                      "dropping vote from non-participant");
                continue;
            }
            if approvals.contains(&msg.sender) || denials.contains(&msg.sender) {
                continue;
            }
            match msg.agreement {
                Some(true) => {
                    approvals.insert(msg.sender);
                }
                Some(false) => {
                    denials.insert(msg.sender);
                }
                None => {
                    warn!(commit = %self.file_name, sender = %msg.sender,
                          "dropping vote without agreement flag");
                }
            }
        }

        if denials.is_empty() {
            Decision::Yes
        } else {
            Decision::No
        }
    }

    /// Phase II: broadcast the decision, collect acks, resend to the
    /// missing subset on every window expiry. The decision never changes
    /// across retries; a permanently silent participant pins the commit.
    async fn run_phase_two(&mut self, decision: Decision) {
        let mut pending: HashSet<NodeId> = self.per_node_files.keys().cloned().collect();

        loop {
            for node in &pending {
                let files = self.per_node_files.get(node).cloned().unwrap_or_default();
                let msg = CommitMessage::decision(
                    &self.file_name,
                    self.coordinator.network.local_id(),
                    node,
                    files,
                    decision,
                );
                self.send_and_route(node.clone(), msg);
            }

            loop {
                if pending.is_empty() {
                    return;
                }
                match tokio::time::timeout(
                    self.coordinator.config.phase_two_timeout,
                    self.ack_rx.recv(),
                )
                .await
                {
                    Ok(Some(msg)) => {
                        pending.remove(&msg.sender);
                    }
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            warn!(commit = %self.file_name, missing = ?pending, "resending decision");
        }
    }

    /// Send a request to one participant; its reply (vote or ack) goes back
    /// through the router like any other inbound message.
    fn send_and_route(&self, node: NodeId, msg: CommitMessage) {
        let coordinator = Arc::clone(&self.coordinator);
        let commit = self.file_name.clone();
        tokio::spawn(async move {
            match coordinator.network.request(&node, msg).await {
                Ok(Some(reply)) => coordinator.route(reply),
                Ok(None) => {}
                Err(e) => {
                    warn!(commit = %commit, node = %node, error = %e, "request failed");
                }
            }
        });
    }

    /// Persist the composite. Runs strictly before the `Phase Two: yes`
    /// marker; a crash in between leaves a partial file that recovery
    /// deletes.
    fn write_composite(&self) -> io::Result<()> {
        let path = self.coordinator.work_dir.join(&self.file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let image = self.image.as_deref().unwrap_or_default();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(image)?;
        file.sync_all()?;
        info!(commit = %self.file_name, bytes = image.len(), "composite written");
        Ok(())
    }

    fn remove_partial_composite(&self) -> io::Result<()> {
        let path = self.coordinator.work_dir.join(&self.file_name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(commit = %self.file_name, "removed partial composite");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
