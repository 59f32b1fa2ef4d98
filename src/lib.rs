//! Mosaic - distributed collage commit engine
//!
//! Atomically assembles a composite image from files contributed by remote
//! participant nodes, using Two-Phase Commit. Every contributor approves
//! before the composite is persisted; a successful commit consumes the
//! contributed files, and any refusal or timeout aborts the whole attempt.
//!
//! # Architecture
//!
//! - Durable Log Layer: append-only text logs with an fsync barrier after
//!   every state change (coordinator per-commit log, participant lock log)
//! - Protocol Layer: the five-message 2PC envelope, bincode on the wire
//! - Network Layer: async TCP with Tokio, replies on the requesting stream
//! - Coordinator: commit table, driver task per commit, message router,
//!   crash recovery from the log directory
//! - Participant: per-file lock table, reactive handlers, net-count replay

pub mod commit_log;
pub mod coordinator;
pub mod lock_log;
pub mod message;
pub mod network;
pub mod participant;
pub mod recovery;
pub mod types;

pub use types::{CommitId, CommitPhase, Decision, NodeId, SourceFileStatus, SourceRef};

pub use message::{CommitMessage, MessageType};

pub use commit_log::{CommitLogReplay, CommitLogWriter};
pub use lock_log::{LockLogReplay, LockLogWriter};

pub use network::{MessageHandler, Network, NetworkConfig};

pub use coordinator::{
    Coordinator, CoordinatorConfig, DriverStart, PHASE_ONE_TIMEOUT, PHASE_TWO_TIMEOUT,
};
pub use recovery::RecoveryAction;

pub use participant::{ApprovalPolicy, AutoApprove, Participant};
