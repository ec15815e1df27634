use std::{fmt::Display, sync::Arc};

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    actions::Command,
    error::DecodeError,
    registry::{ClientHandle, ClientId, ClientRegistry},
    serial::{error::LinkError, link::TransportLink},
};

/// Where a router is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPhase {
    /// The connection is up but not registered yet.
    Accepted,

    /// Registered and routing messages.
    Active,

    /// Deregistered. Nothing more happens.
    Closed,
}

impl Display for RouterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterPhase::Accepted => write!(f, "accepted"),
            RouterPhase::Active => write!(f, "active"),
            RouterPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Why a client message did not reach the device.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The message was not a command.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The device could not be written to.
    #[error("Command `{command}` not sent: {source}")]
    Link {
        /// The command which was not sent.
        command: Command,

        /// Why.
        source: LinkError,
    },
}

/// Routes messages from one client to the device.
#[derive(Debug)]
pub struct InboundRouter {
    client: ClientId,
    link: Arc<TransportLink>,
    registry: ClientRegistry,
    evicted: CancellationToken,
    phase: RouterPhase,
}

impl InboundRouter {
    /// Register a newly accepted client and start routing for it.
    pub async fn accept(
        handle: ClientHandle,
        link: Arc<TransportLink>,
        registry: ClientRegistry,
    ) -> Self {
        let mut router = Self {
            client: handle.id(),
            evicted: handle.evicted(),
            link,
            registry,
            phase: RouterPhase::Accepted,
        };

        router.registry.add(handle).await;
        router.phase = RouterPhase::Active;
        debug!(client = %router.client, phase = %router.phase, "Router started");

        router
    }

    /// The client this router serves.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// See [`RouterPhase`].
    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    /// Handle one client message.
    ///
    /// Problems are logged and returned, they never end the session.
    pub async fn route(&self, payload: &str) -> Result<Command, RouteError> {
        trace!(%payload, "Client message");

        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(%e, "Invalid message from client");
                return Err(e.into());
            }
        };

        if command.name.is_empty() {
            debug!("Command has no name, forwarding anyway");
        }

        match self.link.write_line(&command).await {
            Ok(()) => {
                info!(%command, "Sent to device");
                Ok(command)
            }
            Err(source) => {
                if source.is_not_connected() {
                    warn!(%command, "Device not connected, command not sent");
                } else {
                    warn!(%command, %source, "Could not send command to device");
                }
                Err(RouteError::Link { command, source })
            }
        }
    }

    /// Route messages from `receiver` until the client leaves, the registry evicts it,
    /// or `shutdown` is cancelled.
    ///
    /// Messages are handled one at a time, in order.
    /// The client is deregistered when this returns.
    pub async fn run<S>(mut self, mut receiver: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Bridge shutting down");
                    break;
                }
                _ = self.evicted.cancelled() => {
                    info!(client = %self.client, "Client evicted, ending session");
                    break;
                }
                message = receiver.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = self.route(&text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = self.route(&String::from_utf8_lossy(&bytes)).await;
                }
                Some(Ok(Message::Ping(_))) => {
                    debug!("socket ping");
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("socket pong");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("client closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(?e, "Client connection error");
                    break;
                }
                None => {
                    debug!("client stream ended");
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn close(&mut self) {
        if self.phase == RouterPhase::Closed {
            return;
        }

        self.registry.remove(self.client).await;
        self.phase = RouterPhase::Closed;

        info!(client = %self.client, "Client disconnected");
    }
}
