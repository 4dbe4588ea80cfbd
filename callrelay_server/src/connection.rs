//! Per-connection lifecycle: accept, read loop, writer task, teardown.
//!
//! Each accepted socket gets three tasks. The read loop decodes frames and
//! feeds the router, one message at a time. The writer drains the
//! connection's outbound queue and is the only task touching the socket sink.
//! The liveness driver probes the client and trips the close signal when it
//! goes silent. Whatever ends the connection, [`Teardown`] runs the cleanup
//! exactly once.

use crate::error::ClientRequestError;
use crate::handler::{MessageRouter, REASON_DISCONNECTED};
use crate::liveness;
use crate::protocol::{ClientMessage, PeerId};
use crate::server::AppState;
use crate::state::{ClientRegistry, Frame, Outbox};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the writer waits for the close handshake to go out
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Runs the connection's cleanup when dropped, including on panic
struct Teardown {
    router: MessageRouter,
    peer_id: PeerId,
    closer: CancellationToken,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        // Hangs up any call, unregisters, closes the outbox and broadcasts.
        // A second invocation finds nothing to remove.
        self.router.disconnect(self.peer_id, REASON_DISCONNECTED);
        self.closer.cancel();
    }
}

/// Serve one upgraded WebSocket until it closes
pub async fn handle_connection(socket: WebSocket, app: AppState) {
    let peer_id = PeerId::new();
    let closer = app.shutdown.child_token();
    let (outbox, outbound) = Outbox::new(peer_id, app.outbox_capacity, closer.clone());

    app.router.connect(outbox.clone());
    let teardown = Teardown {
        router: app.router.clone(),
        peer_id,
        closer: closer.clone(),
    };

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(peer_id, sink, outbound, closer.clone()));
    let prober = tokio::spawn(liveness::drive(
        peer_id,
        app.state.clients.clone(),
        outbox,
        app.liveness,
    ));

    match read_loop(peer_id, stream, &app.router, &app.state.clients, &closer).await {
        Ok(()) => info!(%peer_id, "connection closed by relay"),
        Err(ClientRequestError::Close) => info!(%peer_id, "client closed connection"),
        Err(e) => warn!(%peer_id, error = %e, "connection failed"),
    }

    drop(teardown);
    if let Err(e) = writer.await {
        error!(%peer_id, error = %e, "writer task failed");
    }
    if let Err(e) = prober.await {
        error!(%peer_id, error = %e, "liveness task failed");
    }
}

/// Read frames until the client leaves, the transport fails, or the close
/// signal fires. `Ok(())` means the relay chose to close.
async fn read_loop(
    peer_id: PeerId,
    mut stream: SplitStream<WebSocket>,
    router: &MessageRouter,
    clients: &ClientRegistry,
    closer: &CancellationToken,
) -> Result<(), ClientRequestError> {
    loop {
        let frame = tokio::select! {
            _ = closer.cancelled() => return Ok(()),
            frame = stream.next() => frame,
        };
        let frame = frame.ok_or(ClientRequestError::Close)??;
        clients.touch(&peer_id);

        match parse_frame(frame) {
            Ok(Some(message)) => {
                debug!(%peer_id, ?message, "received message");
                router.handle(peer_id, message);
            }
            Ok(None) => {}
            Err(ClientRequestError::Close) => return Err(ClientRequestError::Close),
            Err(e) => {
                warn!(%peer_id, error = %e, "undecodable frame");
                router.handle_malformed(peer_id);
            }
        }
    }
}

/// Decode one transport frame. Control frames yield `Ok(None)`.
pub fn parse_frame(frame: Message) -> Result<Option<ClientMessage>, ClientRequestError> {
    match frame {
        Message::Text(text) => Ok(Some(text.as_str().parse()?)),
        Message::Binary(_) => Err(ClientRequestError::UnsupportedType),
        Message::Ping(_) | Message::Pong(_) => Ok(None),
        Message::Close(_) => Err(ClientRequestError::Close),
    }
}

/// Drain the outbound queue into the socket
async fn write_loop(
    peer_id: PeerId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    closer: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let message = match frame {
            Frame::Probe => Message::Ping(Bytes::new()),
            Frame::Message(message) => match message.to_json() {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    error!(%peer_id, error = %e, "failed to serialize message");
                    continue;
                }
            },
        };

        let sent = tokio::select! {
            _ = closer.cancelled() => break,
            sent = sink.send(message) => sent,
        };
        if let Err(e) = sent {
            warn!(%peer_id, error = %e, "write failed");
            closer.cancel();
            break;
        }
    }

    match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer_id, error = %e, "socket already closed"),
        Err(_) => debug!(%peer_id, "close handshake timed out"),
    }
}
