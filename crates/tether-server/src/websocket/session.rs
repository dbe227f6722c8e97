//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tether_core::ConnectionId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthRejection, Principal};

use super::registry::ConnectionRegistry;
use super::router::EventRouter;
use super::transport::{ChannelTransport, InboundFrames, Outbound, ReceivedFrame};

/// How long the writer gets to flush after disconnect.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[async_trait]
impl InboundFrames for SplitStream<WebSocket> {
    async fn receive_text(&mut self) -> Option<ReceivedFrame> {
        loop {
            match self.next().await? {
                Ok(Message::Text(text)) => return Some(ReceivedFrame::Text(text.to_string())),
                // Some clients send JSON as binary frames
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(ReceivedFrame::Text(text.to_string())),
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Ok(Message::Ping(_) | Message::Pong(_)) => return Some(ReceivedFrame::Liveness),
                Ok(Message::Close(_)) => return Some(ReceivedFrame::Close),
                Err(e) => {
                    debug!(error = %e, "websocket read error");
                    return None;
                }
            }
        }
    }
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection (identity and optional session)
/// 2. Sends `connection_established`
/// 3. Drains the outbound queue into the socket from a writer task
/// 4. Dispatches inbound text frames through the router
/// 5. Disconnects on close, read error, registry disconnect or shutdown
#[instrument(skip_all, fields(identity = %principal.identity))]
pub async fn run_ws_session(
    socket: WebSocket,
    principal: Principal,
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
    outbound_buffer: usize,
    shutdown: CancellationToken,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (transport, out_rx) = ChannelTransport::new(outbound_buffer);

    let id = match registry
        .connect(Arc::new(transport), principal.identity, principal.session)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "connection handshake failed");
            return;
        }
    };
    let Some(connection) = registry.handle(&id) else {
        return;
    };
    let closed = connection.closed_token();
    drop(connection);

    let started = Instant::now();
    let writer = tokio::spawn(write_loop(ws_tx, out_rx, closed.clone()));
    let abort = writer.abort_handle();

    let _ = router.connection_established(&id).await;
    read_loop(ws_rx, &id, &registry, &router, &closed, &shutdown).await;

    registry.disconnect(&id);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        abort.abort();
    }
    info!(conn_id = %id, "client disconnected");
}

/// Read frames until the peer leaves, the registry drops the connection or
/// the server shuts down.
///
/// Application requests run as tasks beside the loop so liveness frames keep
/// being read while a slow handler works. They are abandoned when the
/// connection closes or the loop ends.
pub(crate) async fn read_loop<I: InboundFrames>(
    mut frames: I,
    id: &ConnectionId,
    registry: &ConnectionRegistry,
    router: &Arc<EventRouter>,
    closed: &CancellationToken,
    shutdown: &CancellationToken,
) {
    let mut in_flight = JoinSet::new();
    loop {
        let frame = tokio::select! {
            frame = frames.receive_text() => frame,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            () = closed.cancelled() => {
                debug!(conn_id = %id, "connection closed by registry");
                break;
            }
            () = shutdown.cancelled() => {
                debug!(conn_id = %id, "server shutting down");
                break;
            }
        };

        match frame {
            Some(ReceivedFrame::Text(text)) => {
                counter!("ws_messages_received_total").increment(1);
                let _ = registry.record_liveness_ack(id);
                if let Some(forwarded) = router.handle_inbound(id, &text).await {
                    let router = Arc::clone(router);
                    let closed = closed.clone();
                    let _ = in_flight.spawn(async move {
                        tokio::select! {
                            () = router.forward(forwarded) => {}
                            () = closed.cancelled() => {
                                debug!("request abandoned, connection closed");
                            }
                        }
                    });
                }
            }
            Some(ReceivedFrame::Liveness) => {
                let _ = registry.record_liveness_ack(id);
            }
            Some(ReceivedFrame::Close) => {
                info!(conn_id = %id, "client sent close frame");
                break;
            }
            None => break,
        }
    }

    if !in_flight.is_empty() {
        debug!(conn_id = %id, pending = in_flight.len(), "abandoning in-flight requests");
        in_flight.abort_all();
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text.to_string().into()),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    None => break,
                };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            () = closed.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Close a socket whose handshake was rejected (1008, policy violation).
pub async fn reject(mut socket: WebSocket, rejection: AuthRejection) {
    counter!("ws_auth_rejections_total").increment(1);
    info!(reason = %rejection, "rejecting websocket handshake");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: rejection.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
