//! Core type definitions for the Mosaic commit engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Node identifier (participant or coordinator name)
pub type NodeId = String;

/// A commit is globally identified by its composite file name.
pub type CommitId = String;

/// One contributed source file: which node owns it and its file name there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub node: NodeId,
    pub file: String,
}

impl SourceRef {
    pub fn new(node: impl Into<NodeId>, file: impl Into<String>) -> Self {
        SourceRef {
            node: node.into(),
            file: file.into(),
        }
    }
}

impl FromStr for SourceRef {
    type Err = String;

    /// Parses the `<node_id>:<source_file>` form used by `start_commit` callers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((node, file)) if !node.is_empty() && !file.is_empty() => {
                Ok(SourceRef::new(node, file))
            }
            _ => Err(format!("malformed source reference: {:?}", s)),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.file)
    }
}

/// Phase I outcome broadcast in Phase II.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Every participant approved
    Yes,
    /// At least one participant refused
    No,
    /// Vote window expired with participants missing
    Abort,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Yes => "yes",
            Decision::No => "no",
            Decision::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Decision::Yes),
            "no" => Ok(Decision::No),
            "abort" => Ok(Decision::Abort),
            other => Err(format!("unknown decision: {:?}", other)),
        }
    }
}

/// Coordinator-side lifecycle of one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPhase {
    /// Record created, nothing sent yet
    Init,
    /// Queries out, collecting votes
    PhaseOne,
    /// Decision broadcast, collecting acks
    PhaseTwo(Decision),
    /// All acks in, DONE logged
    Done,
}

/// Participant-side durable status of one `(source_file, commit)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFileStatus {
    /// Tentatively locked for a commit
    Prepared,
    /// Released without being consumed
    Aborted,
    /// Deleted in service of a successful commit
    Committed,
}

impl fmt::Display for SourceFileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceFileStatus::Prepared => "PREPARED",
            SourceFileStatus::Aborted => "ABORTED",
            SourceFileStatus::Committed => "COMMITTED",
        };
        f.write_str(s)
    }
}

impl FromStr for SourceFileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARED" => Ok(SourceFileStatus::Prepared),
            "ABORTED" => Ok(SourceFileStatus::Aborted),
            "COMMITTED" => Ok(SourceFileStatus::Committed),
            other => Err(format!("unknown source file status: {:?}", other)),
        }
    }
}
