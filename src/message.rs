//! Protocol message envelope
//!
//! Every byte exchanged between coordinator and participants is one
//! `CommitMessage`, serialized with bincode. The variant order of
//! `MessageType` is wire format: peers on the same wire must agree on the
//! integer ordering, so new variants go at the end.

use crate::types::{Decision, NodeId};
use serde::{Deserialize, Serialize};

/// Protocol message types, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Coordinator -> participant: Phase I query carrying the composite
    /// image and this node's contribution list
    CommitQuery,
    /// Participant -> coordinator: Phase I vote
    CommitAgreement,
    /// Coordinator -> participant: Phase II decision (commit or deny)
    CommitMsg,
    /// Participant -> coordinator: Phase II acknowledgment
    CommitAck,
    /// Coordinator -> participant: Phase II abort
    CommitAbort,
}

/// The wire envelope. `file_name` doubles as the commit identifier and is
/// how inbound traffic is routed to the owning commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    pub msg_type: MessageType,
    pub file_name: String,
    pub sender: NodeId,
    pub receiver: NodeId,
    pub agreement: Option<bool>,
    pub image: Option<Vec<u8>>,
    pub files: Option<Vec<String>>,
}

impl CommitMessage {
    /// Phase I query to one participant.
    pub fn query(
        file_name: impl Into<String>,
        sender: impl Into<NodeId>,
        receiver: impl Into<NodeId>,
        files: Vec<String>,
        image: Vec<u8>,
    ) -> Self {
        CommitMessage {
            msg_type: MessageType::CommitQuery,
            file_name: file_name.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            agreement: None,
            image: Some(image),
            files: Some(files),
        }
    }

    /// Phase I vote back to the coordinator.
    pub fn vote(
        file_name: impl Into<String>,
        sender: impl Into<NodeId>,
        receiver: impl Into<NodeId>,
        agreement: bool,
    ) -> Self {
        CommitMessage {
            msg_type: MessageType::CommitAgreement,
            file_name: file_name.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            agreement: Some(agreement),
            image: None,
            files: None,
        }
    }

    /// Phase II decision to one participant. `yes` and `no` travel as
    /// `CommitMsg` with the agreement flag; `abort` is its own type.
    pub fn decision(
        file_name: impl Into<String>,
        sender: impl Into<NodeId>,
        receiver: impl Into<NodeId>,
        files: Vec<String>,
        decision: Decision,
    ) -> Self {
        let (msg_type, agreement) = match decision {
            Decision::Yes => (MessageType::CommitMsg, Some(true)),
            Decision::No => (MessageType::CommitMsg, Some(false)),
            Decision::Abort => (MessageType::CommitAbort, None),
        };
        CommitMessage {
            msg_type,
            file_name: file_name.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            agreement,
            image: None,
            files: Some(files),
        }
    }

    /// Phase II acknowledgment back to the coordinator.
    pub fn ack(
        file_name: impl Into<String>,
        sender: impl Into<NodeId>,
        receiver: impl Into<NodeId>,
    ) -> Self {
        CommitMessage {
            msg_type: MessageType::CommitAck,
            file_name: file_name.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            agreement: None,
            image: None,
            files: None,
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("serialization error: {}", e))
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| format!("deserialization error: {}", e))
    }
}
