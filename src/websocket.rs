use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{sink::Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::{registry::ClientHandle, router::InboundRouter, server::BridgeState};

/// How long a leaving client's write task gets to say goodbye.
const WRITE_GRACE: Duration = Duration::from_millis(250);

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(state): Extension<BridgeState>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    } else {
        info!("`{addr}` connected");
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Client", %addr);

        handle_websocket(socket, addr, state).instrument(span)
    })
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    receiver: mpsc::Receiver<String>,
) {
    let mut messages = ReceiverStream::new(receiver);

    while let Some(message) = messages.next().await {
        if sender.send(Message::Text(message)).await.is_err() {
            debug!("client disconnected");
            return;
        }
        trace!("Message flushed");
    }

    // The registry let go of this client
    if sender.send(Message::Close(None)).await.is_err() {
        debug!("client gone before close");
    }
}

pub(crate) async fn handle_websocket(websocket: WebSocket, addr: SocketAddr, state: BridgeState) {
    let (stream_sender, stream_receiver) = websocket.split();
    let (handle, outbox) = ClientHandle::new(addr);

    let router = InboundRouter::accept(handle, state.link.clone(), state.registry.clone()).await;

    let mut write_handle = tokio::spawn(
        write(stream_sender, outbox).instrument(info_span!("Write")),
    );

    router
        .run(stream_receiver, state.shutdown.clone())
        .instrument(info_span!("Read"))
        .await;

    // The router deregistered the client, so the write task runs dry.
    match tokio::time::timeout(WRITE_GRACE, &mut write_handle).await {
        Ok(_) => debug!("Write task joined"),
        Err(_) => {
            debug!("Aborting write task");
            // This ensures the underlying TCP connection gets closed,
            // which signals the client that the session is over.
            write_handle.abort();
        }
    }
}
