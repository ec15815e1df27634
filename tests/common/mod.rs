#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use serial_bridge::{
    actions::OutboundEnvelope,
    config::{Config, PumpConfig},
    error::Error,
    mock::MockDevice,
    registry::ClientRegistry,
    serial::link::TransportLink,
    supervisor::Bridge,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A bridge running in the background, optionally with a mock device attached.
pub struct TestBridge {
    pub addr: SocketAddr,
    pub link: Arc<TransportLink>,
    pub registry: ClientRegistry,
    pub device: Option<MockDevice>,
    pub shutdown: CancellationToken,
    pub running: JoinHandle<Result<(), Error>>,
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        ws_port: 0,
        pump: PumpConfig {
            poll_interval_ms: 1,
            error_backoff_ms: 50,
        },
        ..Default::default()
    }
}

async fn start(with_device: bool) -> Result<TestBridge> {
    let config = test_config();
    let link = Arc::new(
        TransportLink::new(config.write_timeout()).with_read_retry(config.pump.error_backoff()),
    );

    let device = if with_device {
        let (device, stream) = MockDevice::pair();
        link.attach("test-device", stream).await;
        Some(device)
    } else {
        None
    };

    let bridge = Bridge::with_link(config, link.clone())?;
    let addr = bridge.local_addr();
    let registry = bridge.registry();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(bridge.run(shutdown.clone()));

    info!("Bridge on {addr}");

    Ok(TestBridge {
        addr,
        link,
        registry,
        device,
        shutdown,
        running,
    })
}

/// A bridge with a mock device.
pub async fn start_with_device() -> Result<TestBridge> {
    start(true).await
}

/// A bridge without any device.
pub async fn start_without_device() -> Result<TestBridge> {
    start(false).await
}

impl TestBridge {
    pub fn device(&mut self) -> &mut MockDevice {
        self.device
            .as_mut()
            .expect("This bridge was started with a device")
    }

    pub async fn connect(&self) -> Result<Client> {
        let (stream, http_response) =
            tokio_tungstenite::connect_async(format!("ws://{}/", self.addr)).await?;

        assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

        Ok(stream)
    }

    /// Clients are registered shortly after the upgrade, so wait for it.
    pub async fn wait_for_clients(&self, n: usize) -> Result<()> {
        timeout(Duration::from_secs(5), async {
            while self.registry.len().await != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        Ok(())
    }

    /// A plain HTTP GET, returning the body.
    pub async fn get(&self, path: &str) -> Result<String> {
        let mut stream = TcpStream::connect(self.addr).await?;

        let request = format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        stream.write_all(request.as_bytes()).await?;

        let mut response = String::new();
        timeout(Duration::from_secs(5), stream.read_to_string(&mut response)).await??;

        let (head, body) = response
            .split_once("\r\n\r\n")
            .ok_or_else(|| color_eyre::eyre::eyre!("No HTTP body in {response:?}"))?;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");

        Ok(body.to_owned())
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        timeout(Duration::from_secs(5), self.running).await???;

        Ok(())
    }
}

pub async fn send(client: &mut Client, text: &str) -> Result<()> {
    client.send(tungstenite::Message::Text(text.into())).await?;

    Ok(())
}

pub async fn receive(client: &mut Client) -> Result<OutboundEnvelope> {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

        match message {
            tungstenite::Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => return Err(color_eyre::eyre::eyre!("Unexpected message: {other:?}")),
        }
    }
}

/// Nothing arrives within a short while.
pub async fn assert_silent(client: &mut Client) {
    assert!(
        timeout(Duration::from_millis(100), client.next())
            .await
            .is_err(),
        "Expected nothing to arrive"
    );
}

/// Wait for the server to end the session.
pub async fn closed(client: &mut Client) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await?;

    Ok(())
}

/// The next line written to the device, with a timeout.
pub async fn device_line(device: &mut MockDevice) -> Result<String> {
    timeout(Duration::from_secs(5), device.next_line())
        .await??
        .ok_or_else(|| color_eyre::eyre::eyre!("Device closed"))
}
