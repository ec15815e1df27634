//! Owns every part of a running bridge: the link, the clients, the pump and the websocket server.

use std::{
    future::Future,
    net::{SocketAddr, TcpListener},
    sync::Arc,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::{Config, ReconnectPolicy},
    detect,
    error::Error,
    mock::MockDevice,
    pump::OutboundPump,
    registry::ClientRegistry,
    serial::{
        error::LinkError,
        link::{LinkState, TransportLink},
    },
    server::{self, BridgeState},
};

/// Name the loopback mock is attached as.
pub const MOCK_DEVICE_NAME: &str = "mock-loopback";

/// A bridge which is set up and listening, but not yet serving.
#[derive(Debug)]
pub struct Bridge {
    config: Config,
    link: Arc<TransportLink>,
    registry: ClientRegistry,
    listener: TcpListener,
    local_addr: SocketAddr,
    serial_port: Option<String>,
}

impl Bridge {
    /// Set up the bridge from `config`.
    ///
    /// A device which cannot be opened is logged, and the bridge starts without one.
    /// A websocket address which cannot be bound is an error.
    pub async fn start(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let link = Arc::new(
            TransportLink::new(config.write_timeout()).with_read_retry(config.pump.error_backoff()),
        );
        let serial_port = open_device(&config, &link).await;

        let mut bridge = Self::with_link(config, link)?;
        bridge.serial_port = serial_port;

        Ok(bridge)
    }

    /// Set up the bridge around an existing link.
    ///
    /// The device is left as is, so a link with an attached [`MockDevice`] works.
    pub fn with_link(config: Config, link: Arc<TransportLink>) -> Result<Self, Error> {
        config.validate()?;

        let listener = server::bind(&config.ws_addr())?;
        let local_addr = listener.local_addr().map_err(|e| Error::Bind {
            addr: config.ws_addr(),
            problem: e.to_string(),
        })?;

        info!("listening on {}", local_addr);

        Ok(Self {
            registry: ClientRegistry::new(config.send_timeout()),
            config,
            link,
            listener,
            local_addr,
            serial_port: None,
        })
    }

    /// Where websocket clients connect.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The device link.
    pub fn link(&self) -> Arc<TransportLink> {
        self.link.clone()
    }

    /// The connected clients.
    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    async fn log_status(&self) {
        let device = self.link.device_name().await;

        info!(
            websocket = %format!("ws://{}", self.local_addr),
            device = device.as_deref().unwrap_or("none"),
            link = %self.link.state(),
            reconnect_attempts = self.config.reconnect.attempts,
            "Bridge running"
        );

        if device.is_none() {
            warn!("No device, clients can connect but commands will not reach anything");
        }
    }

    /// Serve clients until `shutdown` is cancelled or the server fails.
    ///
    /// On the way out every client is dropped and the device is closed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        self.log_status().await;

        let shutdown = shutdown.child_token();

        let pump = OutboundPump::new(self.link.clone(), self.registry.clone(), &self.config.pump);
        let pump_handle = tokio::spawn(pump.run(shutdown.clone()).instrument(info_span!("Pump")));

        let reconnect_handle = self.spawn_reconnect(shutdown.clone());

        let state = BridgeState {
            link: self.link.clone(),
            registry: self.registry.clone(),
            shutdown: shutdown.clone(),
        };
        let app = server::app(state, &self.config);

        let served = server::serve(self.listener, app, shutdown.clone()).await;
        if let Err(e) = &served {
            error!(%e, "Websocket server failed");
        }

        // Whatever stopped the server stops the rest too
        shutdown.cancel();

        if let Err(e) = pump_handle.await {
            warn!(?e, "Pump task did not finish cleanly");
        }
        if let Some(handle) = reconnect_handle {
            if let Err(e) = handle.await {
                warn!(?e, "Reconnect task did not finish cleanly");
            }
        }

        self.registry.clear().await;
        self.link.disconnect().await;

        info!("Bridge stopped");

        served
    }

    fn spawn_reconnect(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let port = self.serial_port.clone()?;

        if !self.config.reconnect.is_enabled() {
            debug!("Reconnecting is disabled");
            return None;
        }

        let link = self.link.clone();
        let baud = self.config.baud_rate;
        let connect = {
            let port = port.clone();
            move || {
                let link = link.clone();
                let port = port.clone();
                async move { link.connect(&port, baud).await }
            }
        };

        Some(tokio::spawn(
            reconnect(
                self.link.clone(),
                port,
                connect,
                self.config.reconnect.clone(),
                shutdown,
            )
            .instrument(info_span!("Reconnect")),
        ))
    }
}

/// Attach the device the config asks for.
///
/// Returns the serial port in use (or attempted), if any.
async fn open_device(config: &Config, link: &TransportLink) -> Option<String> {
    if config.mock {
        let (device, stream) = MockDevice::pair();
        // Lives until the link closes its end
        let _loopback = device.spawn_loopback();
        link.attach(MOCK_DEVICE_NAME, stream).await;

        return None;
    }

    let port = match &config.port {
        Some(port) => port.clone(),
        None => {
            info!("No serial port given, auto-detecting");
            let Some(port) = detect::detect_port(&config.detect) else {
                warn!("No device found, continuing without one");
                return None;
            };
            port
        }
    };

    if let Err(e) = link.connect(&port, config.baud_rate).await {
        warn!(%e, "Could not open the device, continuing without one");
    }

    Some(port)
}

/// Run `connect` again whenever the link goes down.
///
/// Each outage gets `policy.attempts` tries. If they all fail this gives up for good.
pub(crate) async fn reconnect<C, F>(
    link: Arc<TransportLink>,
    port: String,
    mut connect: C,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
) where
    C: FnMut() -> F,
    F: Future<Output = Result<(), LinkError>>,
{
    let mut state = link.subscribe();

    loop {
        while *state.borrow_and_update() == LinkState::Connected {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        info!(%port, attempts = policy.attempts, "Link is down, reconnecting");

        let mut reconnected = false;
        for attempt in 1..=policy.attempts {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(policy.delay()) => {}
            }

            match connect().await {
                Ok(()) => {
                    info!(%port, attempt, "Reconnected");
                    reconnected = true;
                    break;
                }
                Err(e) => warn!(%e, attempt, "Reconnect failed"),
            }
        }

        if !reconnected {
            error!(%port, "Giving up on the device");
            return;
        }
    }
}
