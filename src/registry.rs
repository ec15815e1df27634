//! The set of connected websocket clients.
//!
//! Each client is represented by a [`ClientHandle`], which is the sending half
//! of a bounded queue drained by that client's write task.
//! Broadcasting puts one message into every queue concurrently, each send bounded by a timeout.

use std::{collections::HashMap, fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    RwLock,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{actions::OutboundEnvelope, error::SendFailure};

/// How many outgoing messages may be queued for a single client.
pub const CLIENT_QUEUE_DEPTH: usize = 64;

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ClientId(Uuid);

impl ClientId {
    /// A new unique id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reduce log verbosity
        let id = self.0.simple().to_string();
        write!(f, "{}", &id[..8])
    }
}

/// A reference to one connected client.
///
/// Cloning is cheap, all clones deliver to the same client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    sender: mpsc::Sender<String>,
    evicted: CancellationToken,
}

impl ClientHandle {
    /// Create a handle for a client at `addr`.
    /// Messages are delivered to the returned receiver.
    pub fn new(addr: SocketAddr) -> (Self, mpsc::Receiver<String>) {
        Self::with_queue_depth(addr, CLIENT_QUEUE_DEPTH)
    }

    /// Create a handle with a specific queue depth.
    pub fn with_queue_depth(addr: SocketAddr, depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(depth.max(1));

        (
            Self {
                id: ClientId::new(),
                addr,
                sender,
                evicted: CancellationToken::new(),
            },
            receiver,
        )
    }

    /// The id of this client.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The remote address of this client.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Cancelled when the registry drops this client after a failed send.
    /// The client's session should end when this fires.
    pub fn evicted(&self) -> CancellationToken {
        self.evicted.clone()
    }

    /// Queue a message for this client, waiting at most `timeout` for room.
    pub async fn send(&self, message: String, timeout: Duration) -> Result<(), SendFailure> {
        self.sender
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendFailure::TimedOut(self.id),
                SendTimeoutError::Closed(_) => SendFailure::Closed(self.id),
            })
    }
}

impl Display for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Thread safe set of connected clients.
///
/// Cloning is cheap, all clones share the same set.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    send_timeout: Duration,
}

impl ClientRegistry {
    /// An empty registry.
    /// A broadcast waits at most `send_timeout` on any single client.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: Arc::default(),
            send_timeout,
        }
    }

    /// Register a client.
    /// Adding an already registered client does nothing.
    pub async fn add(&self, handle: ClientHandle) {
        let mut clients = self.clients.write().await;

        let id = handle.id;
        if clients.contains_key(&id) {
            debug!(%id, "Client already registered");
            return;
        }

        info!(client = %handle, "Client registered");
        clients.insert(id, handle);
    }

    /// Deregister a client.
    /// Returns true if the client was registered.
    pub async fn remove(&self, id: ClientId) -> bool {
        match self.clients.write().await.remove(&id) {
            Some(handle) => {
                info!(client = %handle, "Client deregistered");
                true
            }
            None => false,
        }
    }

    /// Is this client registered?
    pub async fn contains(&self, id: ClientId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// The number of registered clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// True if no clients are registered.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Deregister everyone.
    /// Dropping the handles ends the clients' write tasks.
    pub async fn clear(&self) {
        let mut clients = self.clients.write().await;
        if !clients.is_empty() {
            info!("Deregistering {} client(s)", clients.len());
        }
        clients.clear();
    }

    /// Send the envelope to every registered client.
    ///
    /// Sends happen concurrently and failures are isolated per client.
    /// Clients which could not be reached are deregistered afterwards.
    ///
    /// Returns the number of clients the envelope was delivered to.
    pub async fn broadcast(&self, envelope: &OutboundEnvelope) -> usize {
        let message = match envelope.to_json() {
            Ok(message) => message,
            Err(e) => {
                error!(?e, %envelope, "Could not serialize envelope");
                return 0;
            }
        };

        // Snapshot, so no lock is held while waiting on slow clients.
        let targets = self
            .clients
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        if targets.is_empty() {
            trace!("No clients to broadcast to");
            return 0;
        }

        let results = join_all(
            targets
                .iter()
                .map(|client| client.send(message.clone(), self.send_timeout)),
        )
        .await;

        let mut delivered = 0;
        let mut failed = vec![];

        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    warn!(%failure, "Broadcast to client failed");
                    failed.push(failure.client());
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.clients.write().await;
            for id in failed {
                if let Some(handle) = clients.remove(&id) {
                    info!(client = %handle, "Client deregistered after failed send");
                    handle.evicted.cancel();
                }
            }
        }

        trace!("Broadcasted to {delivered}/{} client(s)", targets.len());

        delivered
    }
}
