use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    actions::OutboundEnvelope,
    config::PumpConfig,
    registry::ClientRegistry,
    serial::{error::LinkError, link::TransportLink, TelemetryLine},
};

/// What a single pump iteration did.
#[derive(Debug)]
pub enum PumpStep {
    /// No device, or nothing to read.
    Idle,

    /// A line was read and broadcast.
    Delivered {
        /// The line.
        line: TelemetryLine,

        /// How many clients got it.
        clients: usize,
    },

    /// Reading failed.
    /// If the device closed its stream, the link has been disconnected.
    Failed(LinkError),
}

/// Moves lines from the device to every client.
#[derive(Debug)]
pub struct OutboundPump {
    link: Arc<TransportLink>,
    registry: ClientRegistry,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl OutboundPump {
    /// Create a pump between `link` and `registry`.
    pub fn new(link: Arc<TransportLink>, registry: ClientRegistry, config: &PumpConfig) -> Self {
        Self {
            link,
            registry,
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
        }
    }

    /// Do one iteration: read at most one line, and broadcast it.
    pub async fn step(&self) -> PumpStep {
        if !self.link.is_connected() {
            return PumpStep::Idle;
        }

        match self.link.try_read_line() {
            Ok(Some(line)) => {
                debug!(%line, "From device");

                let clients = self
                    .registry
                    .broadcast(&OutboundEnvelope::serial(line.clone()))
                    .await;

                PumpStep::Delivered { line, clients }
            }
            Ok(None) => PumpStep::Idle,
            Err(e) if e.is_closed() => {
                warn!("Device is gone, releasing it");
                self.link.disconnect().await;
                PumpStep::Failed(e)
            }
            Err(e) => PumpStep::Failed(e),
        }
    }

    /// Pump until cancelled.
    ///
    /// Lines are drained back to back. When idle the pump sleeps for the poll interval,
    /// after a read error it backs off before polling again.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval = ?self.poll_interval,
            error_backoff = ?self.error_backoff,
            "Pump started"
        );

        loop {
            let pause = match self.step().await {
                PumpStep::Delivered { .. } => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                PumpStep::Idle => self.poll_interval,
                PumpStep::Failed(e) => {
                    warn!(%e, "Device read error, backing off for {:?}", self.error_backoff);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Pump stopped");
    }
}
