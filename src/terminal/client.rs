//! Stream endpoint pumps.
//!
//! One read pump and one write pump per connected client. The read pump
//! enforces the liveness deadline and frame size cap and dispatches frames
//! to the hub; the write pump drains the send queue, coalescing queued
//! frames, and emits protocol pings.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::auth::Principal;

use super::hub::Hub;
use super::messages::ClientFrame;
use super::registry::{ClientHandle, ClientId};

/// Time allowed to write a message to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next message from the peer; each received
/// message (pongs included) extends the deadline.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping period; must be less than `PONG_WAIT`.
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum frame size accepted from the peer.
const MAX_MESSAGE_SIZE: usize = 512;

/// Capacity of the per-client send queue.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Upgrade an authenticated request to a terminal stream.
pub async fn serve_ws(
    hub: Arc<Hub>,
    principal: Principal,
    tab_id: String,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_connection(hub, socket, principal, tab_id))
}

async fn handle_connection(hub: Arc<Hub>, socket: WebSocket, principal: Principal, tab_id: String) {
    let (sender, receiver) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_CAPACITY);
    let client_id = hub
        .register(ClientHandle {
            principal,
            tab_id: tab_id.clone(),
            sender,
        })
        .await;
    info!("terminal stream open: client {client_id}, tab {tab_id}");

    let (ws_sink, ws_stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(ws_sink, receiver));

    read_pump(&hub, client_id, ws_stream).await;
    hub.unregister(client_id).await;

    // The reducer drops the queue sender on unregister and the forwarder
    // releases its clone once the PTY closes; give the write pump a moment
    // to drain and emit the close frame.
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!("terminal stream closed: client {client_id}");
}

async fn read_pump(hub: &Arc<Hub>, client_id: ClientId, mut stream: SplitStream<WebSocket>) {
    loop {
        let message = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                warn!("read deadline exceeded for client {client_id}");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!("websocket error for client {client_id}: {err}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => dispatch_frame(hub, client_id, text.as_str()).await,
            Message::Pong(_) | Message::Ping(_) => {
                // Liveness traffic; receiving it extended the deadline.
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!("ignoring binary frame from client {client_id}");
            }
        }
    }
}

async fn dispatch_frame(hub: &Arc<Hub>, client_id: ClientId, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::PtyInput { input }) => {
            if let Err(err) = hub.handle_pty_input(client_id, &input).await {
                warn!("failed to handle pty input for client {client_id}: {err}");
            }
        }
        Ok(ClientFrame::Resize { rows, cols }) => {
            if let Err(err) = hub.handle_resize(client_id, rows, cols).await {
                warn!("failed to handle resize for client {client_id}: {err}");
            }
        }
        Err(err) => {
            warn!("dropping unrecognized frame from client {client_id}: {err}");
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Vec<u8>>,
) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_PERIOD,
        PING_PERIOD,
    );

    loop {
        tokio::select! {
            received = queue.recv() => {
                let Some(first) = received else {
                    // The hub closed the queue.
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };

                // Coalesce everything already queued into one stream write.
                let mut payload = first;
                while let Ok(next) = queue.try_recv() {
                    payload.push(b'\n');
                    payload.extend_from_slice(&next);
                }

                let text = String::from_utf8_lossy(&payload).into_owned();
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Ping(Default::default()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        }
    }
}
