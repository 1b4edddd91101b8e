//! The shared-object container and its control task.
//!
//! Each container owns one background task that handles every incoming
//! group message and every caller request, in order. Callers talk to it
//! over a command channel and never hold its state directly; the only
//! thing they block on is a [`Transaction`] handle.

use crate::config::{ContainerConfig, OrphanPolicy};
use crate::membership::{GroupMembership, MembershipManager};
use crate::message::GroupMessage;
use crate::transaction::{EngineAction, ReplicationEngine, Transaction, TransactionState};
use crate::transport::{NetworkTransport, TransportEvent};
use cohort_core::{
    CohortError, DescriptionRegistry, EntryState, Id, Result, SharedObject,
    SharedObjectDescriptor, SharedObjectDirectory, TransactionId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events emitted by a container.
#[derive(Clone, Debug, PartialEq)]
pub enum ContainerEvent {
    Connected { group: Id },
    Disconnected { group: Id },
    MemberJoined { member: Id },
    MemberLeft { member: Id },
    /// A shared object became active in the local directory.
    ObjectAdded { object_id: Id },
    ObjectRemoved { object_id: Id },
    /// A transaction this container initiated reached a terminal state.
    TransactionResolved {
        txn: TransactionId,
        object_id: Id,
        state: TransactionState,
    },
}

enum Command {
    Connect {
        rendezvous: Id,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelJoin {
        rendezvous: Id,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Create {
        descriptor: SharedObjectDescriptor,
        timeout: Duration,
        reply: oneshot::Sender<Result<Transaction>>,
    },
    Remove {
        object_id: Id,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A group member holding replicated shared objects.
///
/// Must be created inside a tokio runtime. Dropping the container makes
/// its control task leave the group and exit.
///
/// # Example
///
/// ```rust
/// use cohort_group::{ContainerConfig, MemoryHub, SharedObjectContainer};
/// use cohort_core::object::{SharedValueInstantiator, SHARED_VALUE};
/// use cohort_core::{DescriptionRegistry, Id, SharedObjectDescriptor};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let hub = MemoryHub::new();
/// let factories = Arc::new(DescriptionRegistry::new());
/// factories.register(SharedValueInstantiator::description());
///
/// let server = SharedObjectContainer::new(
///     Id::from("server"),
///     Arc::new(hub.transport(Id::from("server")).unwrap()),
///     factories,
///     ContainerConfig::default(),
/// )
/// .unwrap();
/// server.connect(&Id::from("server")).await.unwrap();
///
/// let txn = server
///     .create_shared_object(SharedObjectDescriptor::new(Id::from("o1"), SHARED_VALUE))
///     .await
///     .unwrap();
/// txn.wait_to_commit().await.unwrap();
/// assert!(server.directory().contains(&Id::from("o1")));
/// # });
/// ```
pub struct SharedObjectContainer {
    id: Id,
    config: ContainerConfig,
    membership: Arc<MembershipManager>,
    directory: Arc<SharedObjectDirectory>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ContainerEvent>,
}

impl SharedObjectContainer {
    /// Create a container on `transport` and start its control task.
    ///
    /// Fails if the transport's inbound stream was already taken.
    pub fn new(
        id: Id,
        transport: Arc<dyn NetworkTransport>,
        factories: Arc<DescriptionRegistry<dyn SharedObject>>,
        config: ContainerConfig,
    ) -> Result<Self> {
        let inbound = transport.subscribe().ok_or_else(|| {
            CohortError::Connect(format!(
                "transport of {} is already in use",
                transport.local_id()
            ))
        })?;

        let membership = Arc::new(MembershipManager::new(id.clone()));
        let directory = Arc::new(SharedObjectDirectory::new(id.clone(), factories));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (expiries, expiry_rx) = mpsc::unbounded_channel();

        let task = ControlTask {
            local_id: id.clone(),
            config: config.clone(),
            transport,
            membership: membership.clone(),
            directory: directory.clone(),
            engine: ReplicationEngine::new(directory.clone()),
            events: events.clone(),
            pending_join: None,
            expiries,
            deadlines: HashMap::new(),
        };
        tokio::spawn(task.run(command_rx, inbound, expiry_rx));

        Ok(Self {
            id,
            config,
            membership,
            directory,
            commands,
            events,
        })
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Join the group reachable through `rendezvous`.
    ///
    /// Connecting to the container's own id founds a new group.
    pub async fn connect(&self, rendezvous: &Id) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            rendezvous: rendezvous.clone(),
            reply,
        })?;

        match tokio::time::timeout(self.config.connect_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CohortError::Shutdown),
            Err(_) => {
                let _ = self.command(Command::CancelJoin {
                    rendezvous: rendezvous.clone(),
                });
                Err(CohortError::Connect(format!(
                    "join handshake with {} timed out after {}ms",
                    rendezvous, self.config.connect_timeout_ms
                )))
            }
        }
    }

    /// Leave the group. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Disconnect { reply })?;
        rx.await.map_err(|_| CohortError::Shutdown)
    }

    /// Replicate a new shared object to every current member, using the
    /// configured transaction timeout.
    pub async fn create_shared_object(
        &self,
        descriptor: SharedObjectDescriptor,
    ) -> Result<Transaction> {
        self.create_shared_object_with_timeout(descriptor, self.config.transaction_timeout())
            .await
    }

    pub async fn create_shared_object_with_timeout(
        &self,
        descriptor: SharedObjectDescriptor,
        timeout: Duration,
    ) -> Result<Transaction> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Create {
            descriptor,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| CohortError::Shutdown)?
    }

    /// Remove a shared object locally and tell every member to drop it.
    /// An object whose creation has not committed yet is `NotFound`.
    pub async fn remove_shared_object(&self, object_id: &Id) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Remove {
            object_id: object_id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CohortError::Shutdown)?
    }

    pub fn get_shared_object(&self, object_id: &Id) -> Result<Arc<dyn SharedObject>> {
        self.directory.get(object_id)
    }

    /// Snapshot of the current membership, this container included.
    pub fn get_members(&self) -> Vec<Id> {
        self.membership.members()
    }

    pub fn membership(&self) -> GroupMembership {
        self.membership.snapshot()
    }

    pub fn group_id(&self) -> Option<Id> {
        self.membership.group_id()
    }

    pub fn is_connected(&self) -> bool {
        self.membership.is_connected()
    }

    pub fn directory(&self) -> &Arc<SharedObjectDirectory> {
        &self.directory
    }

    /// Subscribe to container events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CohortError::Shutdown)
    }
}

impl std::fmt::Debug for SharedObjectContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObjectContainer")
            .field("id", &self.id)
            .field("group", &self.membership.group_id())
            .field("objects", &self.directory.len())
            .finish()
    }
}

struct PendingJoin {
    rendezvous: Id,
    reply: oneshot::Sender<Result<()>>,
}

struct ControlTask {
    local_id: Id,
    config: ContainerConfig,
    transport: Arc<dyn NetworkTransport>,
    membership: Arc<MembershipManager>,
    directory: Arc<SharedObjectDirectory>,
    engine: ReplicationEngine,
    events: broadcast::Sender<ContainerEvent>,
    pending_join: Option<PendingJoin>,
    expiries: mpsc::UnboundedSender<TransactionId>,
    /// Armed deadline timers, cancelled once their transaction resolves.
    deadlines: HashMap<TransactionId, JoinHandle<()>>,
}

impl ControlTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut expiries: mpsc::UnboundedReceiver<TransactionId>,
    ) {
        let mut inbound_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.leave_group().await;
                        break;
                    }
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => {
                        inbound_open = false;
                        self.transport_lost().await;
                    }
                },
                Some(txn) = expiries.recv() => {
                    self.engine.on_deadline(txn, Instant::now());
                    self.flush().await;
                }
            }
        }
        for (_, timer) in self.deadlines.drain() {
            timer.abort();
        }
        debug!(container = %self.local_id, "control task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { rendezvous, reply } => self.start_join(rendezvous, reply).await,
            Command::CancelJoin { rendezvous } => {
                if self
                    .pending_join
                    .as_ref()
                    .is_some_and(|p| p.rendezvous == rendezvous)
                {
                    self.pending_join = None;
                    let _ = self.transport.disconnect(&rendezvous).await;
                    debug!(%rendezvous, "join cancelled");
                }
            }
            Command::Disconnect { reply } => {
                self.leave_group().await;
                let _ = reply.send(());
            }
            Command::Create {
                descriptor,
                timeout,
                reply,
            } => {
                let members = self.membership.members();
                let result = self
                    .engine
                    .begin(descriptor, &members, timeout, Instant::now());
                self.flush().await;
                let _ = reply.send(result);
            }
            Command::Remove { object_id, reply } => {
                let result = self.remove_object(&object_id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn start_join(&mut self, rendezvous: Id, reply: oneshot::Sender<Result<()>>) {
        if let Some(group) = self.membership.group_id() {
            let _ = reply.send(Err(CohortError::Connect(format!(
                "already connected to group {}",
                group
            ))));
            return;
        }
        if self.pending_join.is_some() {
            let _ = reply.send(Err(CohortError::Connect(
                "a join is already in progress".to_string(),
            )));
            return;
        }

        if rendezvous == self.local_id {
            self.membership.found_group();
            info!(group = %self.local_id, "founded group");
            self.emit(ContainerEvent::Connected {
                group: self.local_id.clone(),
            });
            let _ = reply.send(Ok(()));
            return;
        }

        let handshake = async {
            self.transport.connect(&rendezvous).await?;
            self.transport
                .send(&rendezvous, GroupMessage::JoinRequest)
                .await
        };
        match handshake.await {
            Ok(()) => {
                debug!(%rendezvous, "join requested");
                self.pending_join = Some(PendingJoin { rendezvous, reply });
            }
            Err(e) => {
                warn!(%rendezvous, error = %e, "rendezvous unreachable");
                let _ = reply.send(Err(CohortError::Connect(e.to_string())));
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { from, message } => self.handle_message(from, message).await,
            TransportEvent::ChannelClosed { peer } => {
                if self
                    .pending_join
                    .as_ref()
                    .is_some_and(|p| p.rendezvous == peer)
                {
                    if let Some(pending) = self.pending_join.take() {
                        let _ = pending.reply.send(Err(CohortError::Connect(format!(
                            "channel to {} closed during join",
                            peer
                        ))));
                    }
                }
                self.member_departed(&peer);
                self.flush().await;
            }
        }
    }

    async fn handle_message(&mut self, from: Id, message: GroupMessage) {
        match message {
            GroupMessage::JoinRequest => self.accept_join(from).await,
            GroupMessage::JoinAccepted { group, members } => {
                self.join_accepted(from, group, members).await
            }
            GroupMessage::JoinRejected { reason } => {
                if self
                    .pending_join
                    .as_ref()
                    .is_some_and(|p| p.rendezvous == from)
                {
                    if let Some(pending) = self.pending_join.take() {
                        warn!(rendezvous = %from, %reason, "join rejected");
                        let _ = self.transport.disconnect(&from).await;
                        let _ = pending.reply.send(Err(CohortError::Connect(reason)));
                    }
                }
            }
            GroupMessage::MemberJoined { member } => {
                if member == self.local_id || !self.membership.is_connected() {
                    return;
                }
                if self.membership.add_member(member.clone()) {
                    if let Err(e) = self.transport.connect(&member).await {
                        warn!(%member, error = %e, "cannot reach new member");
                    }
                    info!(%member, "member joined");
                    self.engine.on_member_joined(&member);
                    self.engine.replicate_to(&member);
                    self.emit(ContainerEvent::MemberJoined { member });
                    self.flush().await;
                }
            }
            GroupMessage::Leave => {
                self.member_departed(&from);
                self.flush().await;
            }
            GroupMessage::Create { txn, descriptor } => {
                self.engine.on_create(&from, txn, &descriptor);
                self.flush().await;
            }
            GroupMessage::CreateReply {
                txn,
                object_id,
                failure,
            } => {
                self.engine.on_reply(&from, txn, &object_id, failure);
                self.flush().await;
            }
            GroupMessage::Commit { txn, object_id } => {
                self.engine.on_commit(txn, &object_id);
                self.flush().await;
            }
            GroupMessage::Abort { txn, object_id } => {
                self.engine.on_abort(txn, &object_id);
                self.flush().await;
            }
            GroupMessage::Replicate { descriptor } => {
                self.engine.on_replicate(&from, &descriptor);
                self.flush().await;
            }
            GroupMessage::Remove { object_id } => match self.directory.remove(&object_id) {
                Ok(_) => self.emit(ContainerEvent::ObjectRemoved { object_id }),
                Err(e) => debug!(%from, error = %e, "ignoring remove"),
            },
        }
    }

    /// Rendezvous side of the join handshake.
    async fn accept_join(&mut self, joiner: Id) {
        let reject = if !self.membership.is_connected() {
            Some("rendezvous is not connected to a group".to_string())
        } else if self.membership.contains(&joiner) {
            Some(format!("{} is already a member", joiner))
        } else {
            None
        };
        if let Some(reason) = reject {
            warn!(%joiner, %reason, "rejecting join");
            if let Err(e) = self
                .transport
                .send(&joiner, GroupMessage::JoinRejected { reason })
                .await
            {
                debug!(%joiner, error = %e, "join rejection not delivered");
            }
            return;
        }

        let Some(group) = self.membership.group_id() else {
            return;
        };
        let existing = self.membership.peers();
        self.membership.add_member(joiner.clone());
        info!(%joiner, %group, "member joined");

        // The joiner must see its membership before any traffic from others.
        self.engine.push_send(
            &joiner,
            GroupMessage::JoinAccepted {
                group,
                members: self.membership.members(),
            },
        );
        for peer in &existing {
            self.engine.push_send(
                peer,
                GroupMessage::MemberJoined {
                    member: joiner.clone(),
                },
            );
        }
        self.engine.on_member_joined(&joiner);
        self.engine.replicate_to(&joiner);
        self.engine.replicate_orphans_to(&joiner);
        self.emit(ContainerEvent::MemberJoined {
            member: joiner.clone(),
        });
        self.flush().await;
    }

    async fn join_accepted(&mut self, from: Id, group: Id, members: Vec<Id>) {
        let expected = self
            .pending_join
            .as_ref()
            .is_some_and(|p| p.rendezvous == from);
        let pending = match self.pending_join.take() {
            Some(pending) if expected => pending,
            other => {
                self.pending_join = other;
                debug!(%from, "unsolicited join acceptance");
                let _ = self.transport.send(&from, GroupMessage::Leave).await;
                let _ = self.transport.disconnect(&from).await;
                return;
            }
        };

        self.membership.join(group.clone(), members);
        for peer in self.membership.peers() {
            if peer == from {
                continue;
            }
            if let Err(e) = self.transport.connect(&peer).await {
                warn!(%peer, error = %e, "cannot reach member");
            }
        }
        info!(%group, members = self.membership.members().len(), "joined group");
        self.emit(ContainerEvent::Connected { group });
        let _ = pending.reply.send(Ok(()));
    }

    fn member_departed(&mut self, member: &Id) {
        if !self.membership.remove_member(member) {
            return;
        }
        info!(%member, "member left");
        self.engine.on_member_lost(member);

        for object_id in self.directory.mark_orphaned(member) {
            let discard = match self.directory.info(&object_id).map(|i| i.state) {
                // The creator is gone; its transaction can never resolve.
                Some(EntryState::Pending(txn)) => {
                    self.directory.discard_pending(&object_id, txn).is_some()
                }
                Some(EntryState::Active) if self.config.orphan_policy == OrphanPolicy::Remove => {
                    self.directory.remove(&object_id).is_ok()
                }
                _ => false,
            };
            if discard {
                debug!(object = %object_id, origin = %member, "dropped orphaned object");
                self.emit(ContainerEvent::ObjectRemoved { object_id });
            }
        }
        self.emit(ContainerEvent::MemberLeft {
            member: member.clone(),
        });
    }

    /// Once out of the group no initiator can resolve our pending copies.
    fn discard_foreign_pending(&self) {
        for object_id in self.directory.discard_foreign_pending() {
            self.emit(ContainerEvent::ObjectRemoved { object_id });
        }
    }

    async fn remove_object(&mut self, object_id: &Id) -> Result<()> {
        self.directory.remove(object_id)?;
        self.emit(ContainerEvent::ObjectRemoved {
            object_id: object_id.clone(),
        });
        for peer in self.membership.peers() {
            self.engine.push_send(
                &peer,
                GroupMessage::Remove {
                    object_id: object_id.clone(),
                },
            );
        }
        self.flush().await;
        Ok(())
    }

    async fn leave_group(&mut self) {
        if let Some(pending) = self.pending_join.take() {
            let _ = self.transport.disconnect(&pending.rendezvous).await;
            let _ = pending
                .reply
                .send(Err(CohortError::Connect("container disconnected".to_string())));
        }
        let Some(group) = self.membership.group_id() else {
            return;
        };

        self.engine.abort_all("container left the group");
        self.flush().await;
        self.discard_foreign_pending();

        for peer in self.membership.clear() {
            if let Err(e) = self.transport.send(&peer, GroupMessage::Leave).await {
                debug!(%peer, error = %e, "leave not delivered");
            }
            let _ = self.transport.disconnect(&peer).await;
        }
        info!(%group, "left group");
        self.emit(ContainerEvent::Disconnected { group });
    }

    async fn transport_lost(&mut self) {
        warn!(container = %self.local_id, "transport closed");
        if let Some(pending) = self.pending_join.take() {
            let _ = pending
                .reply
                .send(Err(CohortError::Connect("transport closed".to_string())));
        }
        self.engine.abort_all("transport closed");
        self.flush().await;
        self.discard_foreign_pending();
        let group = self.membership.group_id();
        self.membership.clear();
        if let Some(group) = group {
            self.emit(ContainerEvent::Disconnected { group });
        }
    }

    /// Perform every queued engine action. Peers that cannot be reached
    /// are treated as departed, which may queue further actions.
    async fn flush(&mut self) {
        loop {
            let actions = self.engine.drain_actions();
            if actions.is_empty() {
                return;
            }

            let mut unreachable = Vec::new();
            for action in actions {
                match action {
                    EngineAction::Send { to, message } => {
                        let kind = message.kind();
                        if let Err(e) = self.transport.send(&to, message).await {
                            warn!(peer = %to, kind, error = %e, "send failed");
                            if self.membership.contains(&to) {
                                unreachable.push(to);
                            }
                        }
                    }
                    EngineAction::ArmDeadline { txn, deadline } => {
                        let expiries = self.expiries.clone();
                        let timer = tokio::spawn(async move {
                            tokio::time::sleep_until(deadline).await;
                            let _ = expiries.send(txn);
                        });
                        self.deadlines.insert(txn, timer);
                    }
                    EngineAction::ObjectAdded { object_id } => {
                        self.emit(ContainerEvent::ObjectAdded { object_id })
                    }
                    EngineAction::ObjectRemoved { object_id } => {
                        self.emit(ContainerEvent::ObjectRemoved { object_id })
                    }
                    EngineAction::Resolved {
                        txn,
                        object_id,
                        state,
                    } => {
                        if let Some(timer) = self.deadlines.remove(&txn) {
                            timer.abort();
                        }
                        self.emit(ContainerEvent::TransactionResolved {
                            txn,
                            object_id,
                            state,
                        })
                    }
                }
            }

            for peer in unreachable {
                self.member_departed(&peer);
            }
        }
    }

    fn emit(&self, event: ContainerEvent) {
        let _ = self.events.send(event);
    }
}
