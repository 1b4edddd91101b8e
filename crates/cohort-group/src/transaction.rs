//! Replication transactions for shared-object creation.
//!
//! The [`ReplicationEngine`] is a synchronous state machine. It plays both
//! roles of the protocol: as initiator it drives its own transactions
//! through `Preparing -> Broadcast -> Committed | Aborted | TimedOut`, and
//! as member it installs, activates or discards objects on request. Side
//! effects on other members are queued as [`EngineAction`]s which the
//! owning container drains and performs.
//!
//! Policy:
//! - the target set is the membership snapshot taken at `begin`
//! - commit requires an acknowledgement from every target
//! - the first failure reply aborts (fail-fast); the deadline times out
//! - on abort, every target that did not refuse is told to discard its
//!   pending copy
//! - replies for unknown or finished transactions are dropped

use crate::message::GroupMessage;
use cohort_core::{
    AbortSignal, CohortError, EntryState, Id, Result, SharedObjectDescriptor,
    SharedObjectDirectory, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest timeout a transaction is armed with; larger values are clamped.
pub const MAX_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(86_400 * 365);

/// State of a replication transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Preparing,
    Broadcast,
    Committed,
    Aborted,
    TimedOut,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::TimedOut
        )
    }
}

/// Published status of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionStatus {
    pub state: TransactionState,
    /// Present once the transaction ended in `Aborted` or `TimedOut`.
    pub abort: Option<AbortSignal>,
}

/// Caller-side handle of a replication transaction.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: TransactionId,
    object_id: Id,
    status: watch::Receiver<TransactionStatus>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn object_id(&self) -> &Id {
        &self.object_id
    }

    /// Current state without waiting.
    pub fn state(&self) -> TransactionState {
        self.status.borrow().state
    }

    /// Wait until the transaction reaches a terminal state.
    ///
    /// Returns `Ok(())` on commit and the [`AbortSignal`] otherwise. Calling
    /// it again after the outcome is known yields the same outcome.
    pub async fn wait_to_commit(&self) -> std::result::Result<(), AbortSignal> {
        let mut status = self.status.clone();
        let outcome = match status.wait_for(|s| s.state.is_terminal()).await {
            Ok(current) => current.clone(),
            Err(_) => {
                return Err(AbortSignal::refused(
                    self.object_id.clone(),
                    "container shut down before the transaction finished",
                ))
            }
        };
        match outcome.abort {
            None => Ok(()),
            Some(signal) => Err(signal),
        }
    }
}

/// Side effects requested by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineAction {
    Send { to: Id, message: GroupMessage },
    /// Call [`ReplicationEngine::on_deadline`] for `txn` at `deadline`.
    ArmDeadline {
        txn: TransactionId,
        deadline: Instant,
    },
    ObjectAdded { object_id: Id },
    ObjectRemoved { object_id: Id },
    Resolved {
        txn: TransactionId,
        object_id: Id,
        state: TransactionState,
    },
}

struct ReplicationTransaction {
    object_id: Id,
    state: TransactionState,
    deadline: Instant,
    timeout: Duration,
    targets: BTreeSet<Id>,
    acknowledged: BTreeSet<Id>,
    failed: BTreeSet<Id>,
    /// Members that joined after `begin`; never targeted.
    late_joiners: BTreeSet<Id>,
    status: watch::Sender<TransactionStatus>,
}

impl ReplicationTransaction {
    fn publish(&mut self, state: TransactionState, abort: Option<AbortSignal>) {
        self.state = state;
        self.status.send_replace(TransactionStatus { state, abort });
    }

    fn awaiting(&self, member: &Id) -> bool {
        self.targets.contains(member)
            && !self.acknowledged.contains(member)
            && !self.failed.contains(member)
    }
}

/// Drives replication transactions for one container.
pub struct ReplicationEngine {
    local_id: Id,
    directory: Arc<SharedObjectDirectory>,
    transactions: HashMap<TransactionId, ReplicationTransaction>,
    actions: VecDeque<EngineAction>,
}

impl ReplicationEngine {
    pub fn new(directory: Arc<SharedObjectDirectory>) -> Self {
        Self {
            local_id: directory.local_id().clone(),
            directory,
            transactions: HashMap::new(),
            actions: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    /// Number of transactions that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.transactions.len()
    }

    /// Start replicating `descriptor` to `members`.
    ///
    /// The object is installed locally first; a local duplicate fails the
    /// call before anything is sent. `timeout` is clamped to
    /// [`MAX_TRANSACTION_TIMEOUT`].
    pub fn begin(
        &mut self,
        descriptor: SharedObjectDescriptor,
        members: &[Id],
        timeout: Duration,
        now: Instant,
    ) -> Result<Transaction> {
        let id = TransactionId::new();
        let object_id = descriptor.object_id.clone();
        let timeout = timeout.min(MAX_TRANSACTION_TIMEOUT);
        let deadline = now.checked_add(timeout).ok_or_else(|| {
            CohortError::Abort(AbortSignal::refused(
                object_id.clone(),
                "transaction deadline out of range",
            ))
        })?;

        self.directory
            .install(&descriptor, self.local_id.clone(), EntryState::Pending(id))?;

        let (status, receiver) = watch::channel(TransactionStatus {
            state: TransactionState::Preparing,
            abort: None,
        });
        let targets: BTreeSet<Id> = members
            .iter()
            .filter(|m| *m != &self.local_id)
            .cloned()
            .collect();
        let mut txn = ReplicationTransaction {
            object_id: object_id.clone(),
            state: TransactionState::Preparing,
            deadline,
            timeout,
            targets,
            acknowledged: BTreeSet::new(),
            failed: BTreeSet::new(),
            late_joiners: BTreeSet::new(),
            status,
        };

        info!(%id, object = %object_id, targets = txn.targets.len(), "replication started");
        for target in &txn.targets {
            self.actions.push_back(EngineAction::Send {
                to: target.clone(),
                message: GroupMessage::Create {
                    txn: id,
                    descriptor: descriptor.clone(),
                },
            });
        }
        txn.publish(TransactionState::Broadcast, None);

        let handle = Transaction {
            id,
            object_id,
            status: receiver,
        };

        if txn.targets.is_empty() {
            self.transactions.insert(id, txn);
            self.commit(id);
        } else {
            self.actions.push_back(EngineAction::ArmDeadline {
                txn: id,
                deadline: txn.deadline,
            });
            self.transactions.insert(id, txn);
        }
        Ok(handle)
    }

    /// A target answered a `Create`.
    pub fn on_reply(
        &mut self,
        from: &Id,
        txn_id: TransactionId,
        object_id: &Id,
        failure: Option<String>,
    ) {
        let Some(txn) = self.transactions.get_mut(&txn_id) else {
            debug!(%txn_id, %from, "discarding reply for finished transaction");
            return;
        };
        if &txn.object_id != object_id || !txn.awaiting(from) {
            debug!(%txn_id, %from, "discarding unexpected reply");
            return;
        }

        match failure {
            Some(cause) => {
                txn.failed.insert(from.clone());
                let signal =
                    AbortSignal::refused(object_id.clone(), format!("{} refused: {}", from, cause));
                self.abort(txn_id, TransactionState::Aborted, signal);
            }
            None => {
                txn.acknowledged.insert(from.clone());
                if txn.acknowledged.len() == txn.targets.len() {
                    self.commit(txn_id);
                }
            }
        }
    }

    /// The deadline timer of `txn_id` fired.
    pub fn on_deadline(&mut self, txn_id: TransactionId, now: Instant) {
        let Some(txn) = self.transactions.get(&txn_id) else {
            return;
        };
        if now < txn.deadline {
            return;
        }
        let timeout_ms = u64::try_from(txn.timeout.as_millis()).unwrap_or(u64::MAX);
        let signal = AbortSignal::timed_out(txn.object_id.clone(), timeout_ms);
        self.abort(txn_id, TransactionState::TimedOut, signal);
    }

    /// `member` left or its channel closed. Counts as a failure reply for
    /// every transaction still waiting on it.
    pub fn on_member_lost(&mut self, member: &Id) {
        let waiting: Vec<(TransactionId, Id)> = self
            .transactions
            .iter_mut()
            .filter_map(|(id, txn)| {
                txn.late_joiners.remove(member);
                txn.awaiting(member).then(|| (*id, txn.object_id.clone()))
            })
            .collect();

        for (txn_id, object_id) in waiting {
            if let Some(txn) = self.transactions.get_mut(&txn_id) {
                txn.failed.insert(member.clone());
            }
            let signal =
                AbortSignal::refused(object_id, format!("member {} left the group", member));
            self.abort(txn_id, TransactionState::Aborted, signal);
        }
    }

    /// `member` joined after some transactions began.
    pub fn on_member_joined(&mut self, member: &Id) {
        for txn in self.transactions.values_mut() {
            if !txn.targets.contains(member) {
                txn.late_joiners.insert(member.clone());
            }
        }
    }

    /// Abort every in-flight transaction, e.g. when leaving the group.
    pub fn abort_all(&mut self, cause: &str) {
        let ids: Vec<(TransactionId, Id)> = self
            .transactions
            .iter()
            .map(|(id, txn)| (*id, txn.object_id.clone()))
            .collect();
        for (txn_id, object_id) in ids {
            self.abort(
                txn_id,
                TransactionState::Aborted,
                AbortSignal::refused(object_id, cause),
            );
        }
    }

    /// Member side: the initiator asks us to install `descriptor`.
    pub fn on_create(
        &mut self,
        from: &Id,
        txn: TransactionId,
        descriptor: &SharedObjectDescriptor,
    ) {
        let failure = match self
            .directory
            .install(descriptor, from.clone(), EntryState::Pending(txn))
        {
            Ok(_) => None,
            Err(e) => {
                warn!(%txn, object = %descriptor.object_id, error = %e, "refusing replica");
                Some(e.to_string())
            }
        };
        self.actions.push_back(EngineAction::Send {
            to: from.clone(),
            message: GroupMessage::CreateReply {
                txn,
                object_id: descriptor.object_id.clone(),
                failure,
            },
        });
    }

    /// Member side: the transaction that installed `object_id` committed.
    pub fn on_commit(&mut self, txn: TransactionId, object_id: &Id) {
        if self.directory.activate(object_id, txn) {
            self.actions.push_back(EngineAction::ObjectAdded {
                object_id: object_id.clone(),
            });
        }
    }

    /// Member side: compensating removal for an aborted transaction.
    pub fn on_abort(&mut self, txn: TransactionId, object_id: &Id) {
        if self.directory.discard_pending(object_id, txn).is_some() {
            self.actions.push_back(EngineAction::ObjectRemoved {
                object_id: object_id.clone(),
            });
        }
    }

    /// Member side: install an object committed before we joined.
    pub fn on_replicate(&mut self, from: &Id, descriptor: &SharedObjectDescriptor) {
        match self
            .directory
            .install(descriptor, from.clone(), EntryState::Active)
        {
            Ok(_) => self.actions.push_back(EngineAction::ObjectAdded {
                object_id: descriptor.object_id.clone(),
            }),
            Err(e) => debug!(object = %descriptor.object_id, error = %e, "replica not installed"),
        }
    }

    /// Queue the active objects we originated for a new member.
    pub fn replicate_to(&mut self, member: &Id) {
        for descriptor in self.directory.replicas_originated_by(&self.local_id) {
            self.actions.push_back(EngineAction::Send {
                to: member.clone(),
                message: GroupMessage::Replicate { descriptor },
            });
        }
    }

    /// Queue the orphaned objects we hold for a new member. Only the
    /// rendezvous does this, so the joiner gets each orphan once.
    pub fn replicate_orphans_to(&mut self, member: &Id) {
        for descriptor in self.directory.orphaned_replicas() {
            self.actions.push_back(EngineAction::Send {
                to: member.clone(),
                message: GroupMessage::Replicate { descriptor },
            });
        }
    }

    /// Queue a message behind the engine's own traffic.
    pub fn push_send(&mut self, to: &Id, message: GroupMessage) {
        self.actions.push_back(EngineAction::Send {
            to: to.clone(),
            message,
        });
    }

    pub fn drain_actions(&mut self) -> Vec<EngineAction> {
        self.actions.drain(..).collect()
    }

    fn commit(&mut self, txn_id: TransactionId) {
        let Some(object_id) = self.transactions.get(&txn_id).map(|t| t.object_id.clone()) else {
            return;
        };
        if !self.directory.activate(&object_id, txn_id) {
            // Our pending copy is gone, so no member may keep theirs.
            let signal =
                AbortSignal::refused(object_id, "local pending object vanished before commit");
            self.abort(txn_id, TransactionState::Aborted, signal);
            return;
        }
        let Some(mut txn) = self.transactions.remove(&txn_id) else {
            return;
        };

        for target in &txn.targets {
            self.actions.push_back(EngineAction::Send {
                to: target.clone(),
                message: GroupMessage::Commit {
                    txn: txn_id,
                    object_id: txn.object_id.clone(),
                },
            });
        }
        if !txn.late_joiners.is_empty() {
            if let Ok(object) = self.directory.get(&txn.object_id) {
                let descriptor = object.replica_descriptor();
                for member in &txn.late_joiners {
                    self.actions.push_back(EngineAction::Send {
                        to: member.clone(),
                        message: GroupMessage::Replicate {
                            descriptor: descriptor.clone(),
                        },
                    });
                }
            }
        }

        info!(%txn_id, object = %txn.object_id, "replication committed");
        txn.publish(TransactionState::Committed, None);
        self.actions.push_back(EngineAction::ObjectAdded {
            object_id: txn.object_id.clone(),
        });
        self.actions.push_back(EngineAction::Resolved {
            txn: txn_id,
            object_id: txn.object_id,
            state: TransactionState::Committed,
        });
    }

    fn abort(&mut self, txn_id: TransactionId, state: TransactionState, signal: AbortSignal) {
        let Some(mut txn) = self.transactions.remove(&txn_id) else {
            return;
        };
        self.directory.discard_pending(&txn.object_id, txn_id);

        for target in txn.targets.difference(&txn.failed) {
            self.actions.push_back(EngineAction::Send {
                to: target.clone(),
                message: GroupMessage::Abort {
                    txn: txn_id,
                    object_id: txn.object_id.clone(),
                },
            });
        }

        warn!(%txn_id, object = %txn.object_id, ?state, %signal, "replication aborted");
        txn.publish(state, Some(signal));
        self.actions.push_back(EngineAction::Resolved {
            txn: txn_id,
            object_id: txn.object_id,
            state,
        });
    }
}
