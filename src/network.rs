use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::TransportError;

/// Opaque transport-level identifier of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Vec<u8>);

impl PeerId {
    pub fn random() -> Self {
        PeerId(rand::random::<[u8; 16]>().to_vec())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Bytes received from a peer.
#[derive(Debug, Clone)]
pub struct Data {
    pub peer_id: PeerId,
    pub payload: Vec<u8>,
}

/// Transport the management layer sends and receives frames through.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Sends `data` to `peer`, or to every connected peer when `peer` is `None`.
    async fn send_data(&self, data: Vec<u8>, peer: Option<&PeerId>) -> Result<(), TransportError>;

    /// Waits for the next frame; `None` once the transport has shut down.
    async fn receive_data(&self) -> Option<Data>;

    /// Receives the new number of connected peers whenever it changes.
    fn subscribe_connection_changes(&self) -> broadcast::Receiver<usize>;

    fn connection_count(&self) -> usize;
}

struct Endpoint {
    inbox: mpsc::UnboundedSender<Data>,
    connections: broadcast::Sender<usize>,
}

/// In-process hub connecting any number of [`MemoryConnection`]s.
///
/// Every connection sees every other one; there is no loss or reordering per sender.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the hub under a random peer id.
    pub fn connect(&self) -> MemoryConnection {
        self.connect_as(PeerId::random())
    }

    pub fn connect_as(&self, peer_id: PeerId) -> MemoryConnection {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (connections_tx, _) = broadcast::channel(16);
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                peer_id.clone(),
                Endpoint {
                    inbox: inbox_tx,
                    connections: connections_tx.clone(),
                },
            );
        debug!(peer = %peer_id, "peer joined memory network");
        self.announce_counts();
        MemoryConnection {
            peer_id,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            connections: connections_tx,
        }
    }

    fn announce_counts(&self) {
        let endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let others = endpoints.len().saturating_sub(1);
        for endpoint in endpoints.values() {
            // nobody listening is fine
            let _ = endpoint.connections.send(others);
        }
    }

    fn leave(&self, peer_id: &PeerId) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
        debug!(peer = %peer_id, "peer left memory network");
        self.announce_counts();
    }

    pub fn peer_count(&self) -> usize {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// One peer's attachment to a [`MemoryNetwork`]; leaves the hub when dropped.
pub struct MemoryConnection {
    peer_id: PeerId,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Data>>,
    connections: broadcast::Sender<usize>,
}

impl MemoryConnection {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Next frame if one is already queued.
    pub fn try_receive(&self) -> Option<Data> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.network.leave(&self.peer_id);
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnection {
    async fn send_data(&self, data: Vec<u8>, peer: Option<&PeerId>) -> Result<(), TransportError> {
        let endpoints = self
            .network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let frame = |payload: Vec<u8>| Data {
            peer_id: self.peer_id.clone(),
            payload,
        };
        match peer {
            Some(peer) => {
                let endpoint = endpoints
                    .get(peer)
                    .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
                endpoint.inbox.send(frame(data)).map_err(|_| TransportError::Closed)
            }
            None => {
                for (peer_id, endpoint) in endpoints.iter() {
                    if *peer_id != self.peer_id {
                        let _ = endpoint.inbox.send(frame(data.clone()));
                    }
                }
                Ok(())
            }
        }
    }

    async fn receive_data(&self) -> Option<Data> {
        self.inbox.lock().await.recv().await
    }

    fn subscribe_connection_changes(&self) -> broadcast::Receiver<usize> {
        self.connections.subscribe()
    }

    fn connection_count(&self) -> usize {
        self.network.peer_count().saturating_sub(1)
    }
}
