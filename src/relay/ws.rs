//! Axum WebSocket transport for runner connections.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, future};
use tracing::{error, info};

use super::bridge::QueueBridge;
use super::session::InboundFrame;

impl From<Message> for InboundFrame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
            Message::Binary(data) => InboundFrame::Binary(data),
            Message::Ping(_) | Message::Pong(_) => InboundFrame::Control,
            Message::Close(_) => InboundFrame::Close,
        }
    }
}

/// Drive an upgraded runner socket through the bridge until it closes.
pub async fn serve_runner_socket(socket: WebSocket, runner_id: String, bridge: Arc<QueueBridge>) {
    info!(runner_id = %runner_id, "Runner websocket connected");

    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));
    let frames = stream.map(|message| message.map(InboundFrame::from));

    if let Err(e) = bridge.serve_connection(&runner_id, sink, frames).await {
        error!(runner_id = %runner_id, error = %e, "Failed to attach runner to work queues");
    }

    info!(runner_id = %runner_id, "Runner websocket closed");
}
