use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
};

use axum::{response::IntoResponse, routing::get, Extension, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    error::Error,
    registry::ClientRegistry,
    serial::link::{LinkState, TransportLink},
    websocket,
};

/// What every connection handler needs to reach.
#[derive(Debug, Clone)]
pub(crate) struct BridgeState {
    pub(crate) link: Arc<TransportLink>,
    pub(crate) registry: ClientRegistry,
    pub(crate) shutdown: CancellationToken,
}

/// The answer to `GET /status`.
#[derive(Debug, Serialize)]
struct Status {
    device: Option<String>,
    link: LinkState,
    clients: usize,
}

/// Websocket clients upgrade on `/`, or `/client`.
pub(crate) fn app(state: BridgeState, config: &Config) -> Router {
    Router::new()
        .route("/", get(websocket::ws_handler))
        .route("/client", get(websocket::ws_handler))
        .route("/status", get(show_status))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket needs to be able to reach the link and the other clients
                .layer(Extension(state))
                // The bridge config should be known to the web server
                .layer(Extension(config.clone())),
        )
}

/// Listen on `addr`, given as `host:port`.
pub(crate) fn bind(addr: &str) -> Result<TcpListener, Error> {
    let bind_error = |e: std::io::Error| Error::Bind {
        addr: addr.into(),
        problem: e.to_string(),
    };

    let listener = TcpListener::bind(addr).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;

    Ok(listener)
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub(crate) async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    axum::Server::from_tcp(listener)
        .map_err(|e| Error::Server(e.to_string()))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Server(e.to_string()))
}

async fn show_status(Extension(state): Extension<BridgeState>) -> impl IntoResponse {
    Json(Status {
        device: state.link.device_name().await,
        link: state.link.state(),
        clients: state.registry.len().await,
    })
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    config
        .serialize_pretty()
        .unwrap_or_else(|e| format!("{e}\n"))
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Bridge v{}\n", env!("CARGO_PKG_VERSION"))
}
