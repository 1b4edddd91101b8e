//! Control-plane messages exchanged between group members.

use cohort_core::{Id, SharedObjectDescriptor, TransactionId};
use serde::{Deserialize, Serialize};

/// Messages exchanged between containers of one group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Ask the receiver, acting as rendezvous, to admit the sender.
    JoinRequest,
    /// Join succeeded; `members` is the full membership including the joiner.
    JoinAccepted { group: Id, members: Vec<Id> },
    JoinRejected { reason: String },
    /// Sent by the rendezvous to existing members when someone joined.
    MemberJoined { member: Id },
    /// The sender is leaving the group.
    Leave,
    /// Install `descriptor` as a pending object and reply.
    Create {
        txn: TransactionId,
        descriptor: SharedObjectDescriptor,
    },
    /// Outcome of a `Create`; `failure` is `None` on success.
    CreateReply {
        txn: TransactionId,
        object_id: Id,
        failure: Option<String>,
    },
    Commit { txn: TransactionId, object_id: Id },
    /// Compensating removal of a pending object.
    Abort { txn: TransactionId, object_id: Id },
    /// Install an already committed object (late joiners).
    Replicate { descriptor: SharedObjectDescriptor },
    Remove { object_id: Id },
}

impl GroupMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GroupMessage::JoinRequest => "join-request",
            GroupMessage::JoinAccepted { .. } => "join-accepted",
            GroupMessage::JoinRejected { .. } => "join-rejected",
            GroupMessage::MemberJoined { .. } => "member-joined",
            GroupMessage::Leave => "leave",
            GroupMessage::Create { .. } => "create",
            GroupMessage::CreateReply { .. } => "create-reply",
            GroupMessage::Commit { .. } => "commit",
            GroupMessage::Abort { .. } => "abort",
            GroupMessage::Replicate { .. } => "replicate",
            GroupMessage::Remove { .. } => "remove",
        }
    }
}
