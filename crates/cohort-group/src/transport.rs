//! Transport abstractions for group control traffic.
//!
//! A transport gives a container reliable, ordered, duplicate-free channels
//! to each peer it is linked with. A lost channel surfaces as
//! [`TransportEvent::ChannelClosed`].

use crate::message::GroupMessage;
use async_trait::async_trait;
use cohort_core::Id;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Network error type.
#[derive(Clone, Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(Id),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Disconnected")]
    Disconnected,
}

/// Something that happened on a transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message { from: Id, message: GroupMessage },
    ChannelClosed { peer: Id },
}

/// Abstract transport trait.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    fn local_id(&self) -> &Id;

    /// Open a channel to a peer.
    async fn connect(&self, peer: &Id) -> Result<(), NetworkError>;

    /// Close the channel to a peer. The peer observes `ChannelClosed`.
    async fn disconnect(&self, peer: &Id) -> Result<(), NetworkError>;

    async fn send(&self, peer: &Id, message: GroupMessage) -> Result<(), NetworkError>;

    async fn connected_peers(&self) -> Vec<Id>;

    /// Take the inbound event stream. Only the first call gets it.
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

struct Endpoint {
    tx: mpsc::UnboundedSender<TransportEvent>,
    links: HashSet<Id>,
    muted: bool,
}

/// In-process switchboard connecting [`MemoryTransport`]s.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: RwLock<HashMap<Id, Endpoint>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint. Identifiers are unique per hub.
    pub fn transport(self: &Arc<Self>, local_id: Id) -> Result<MemoryTransport, NetworkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&local_id) {
            return Err(NetworkError::ConnectionFailed(format!(
                "endpoint {} already attached",
                local_id
            )));
        }
        endpoints.insert(
            local_id.clone(),
            Endpoint {
                tx,
                links: HashSet::new(),
                muted: false,
            },
        );

        Ok(MemoryTransport {
            local_id,
            hub: self.clone(),
            inbound: Mutex::new(Some(rx)),
        })
    }

    /// Silently drop all traffic addressed to `id`, as if it hung.
    pub fn mute(&self, id: &Id) {
        if let Some(endpoint) = self.endpoints.write().get_mut(id) {
            endpoint.muted = true;
        }
    }

    pub fn unmute(&self, id: &Id) {
        if let Some(endpoint) = self.endpoints.write().get_mut(id) {
            endpoint.muted = false;
        }
    }

    /// Remove an endpoint abruptly; every linked peer sees its channel close.
    pub fn detach(&self, id: &Id) {
        let mut endpoints = self.endpoints.write();
        let Some(endpoint) = endpoints.remove(id) else {
            return;
        };
        debug!(endpoint = %id, "detaching endpoint");
        for peer in endpoint.links {
            if let Some(other) = endpoints.get_mut(&peer) {
                other.links.remove(id);
                let _ = other.tx.send(TransportEvent::ChannelClosed { peer: id.clone() });
            }
        }
    }

    /// Ids of every attached endpoint.
    pub fn endpoints(&self) -> Vec<Id> {
        let mut ids: Vec<_> = self.endpoints.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn link(&self, a: &Id, b: &Id) -> Result<(), NetworkError> {
        let mut endpoints = self.endpoints.write();
        if !endpoints.contains_key(b) {
            return Err(NetworkError::PeerNotFound(b.clone()));
        }
        if let Some(endpoint) = endpoints.get_mut(a) {
            endpoint.links.insert(b.clone());
        }
        if let Some(endpoint) = endpoints.get_mut(b) {
            endpoint.links.insert(a.clone());
        }
        Ok(())
    }

    fn unlink(&self, a: &Id, b: &Id) {
        let mut endpoints = self.endpoints.write();
        if let Some(endpoint) = endpoints.get_mut(a) {
            endpoint.links.remove(b);
        }
        if let Some(endpoint) = endpoints.get_mut(b) {
            if endpoint.links.remove(a) {
                let _ = endpoint.tx.send(TransportEvent::ChannelClosed { peer: a.clone() });
            }
        }
    }

    fn deliver(&self, from: &Id, to: &Id, message: GroupMessage) -> Result<(), NetworkError> {
        let endpoints = self.endpoints.read();
        let linked = endpoints
            .get(from)
            .map(|e| e.links.contains(to))
            .unwrap_or(false);
        let target = match endpoints.get(to) {
            Some(target) if linked => target,
            _ => return Err(NetworkError::PeerNotFound(to.clone())),
        };
        if target.muted {
            return Ok(());
        }
        target
            .tx
            .send(TransportEvent::Message {
                from: from.clone(),
                message,
            })
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn links_of(&self, id: &Id) -> Vec<Id> {
        self.endpoints
            .read()
            .get(id)
            .map(|e| e.links.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// In-memory transport for testing and simulation.
pub struct MemoryTransport {
    local_id: Id,
    hub: Arc<MemoryHub>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    fn local_id(&self) -> &Id {
        &self.local_id
    }

    async fn connect(&self, peer: &Id) -> Result<(), NetworkError> {
        self.hub.link(&self.local_id, peer)
    }

    async fn disconnect(&self, peer: &Id) -> Result<(), NetworkError> {
        self.hub.unlink(&self.local_id, peer);
        Ok(())
    }

    async fn send(&self, peer: &Id, message: GroupMessage) -> Result<(), NetworkError> {
        self.hub.deliver(&self.local_id, peer, message)
    }

    async fn connected_peers(&self) -> Vec<Id> {
        self.hub.links_of(&self.local_id)
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inbound.lock().take()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.detach(&self.local_id);
    }
}
