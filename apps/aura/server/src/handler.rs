//! Per-connection task: registers the socket, feeds inbound envelopes to
//! the router and cleans up on the way out.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use aura_core::Envelope;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{broker::Broker, registry::PoolKind};

/// How long the writer gets to flush and send a close frame.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Reading,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Registered, Reading)
                | (Registered, Closing)
                | (Reading, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    StreamEnded,
    ReadError,
    ProtocolViolation,
    Evicted,
}

struct Lifecycle {
    pool: PoolKind,
    state: ConnectionState,
}

impl Lifecycle {
    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(pool = %self.pool, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

pub async fn handle_socket(
    socket: WebSocket,
    broker: Arc<Broker>,
    pool: PoolKind,
    remote_addr: SocketAddr,
) {
    let mut lifecycle = Lifecycle {
        pool,
        state: ConnectionState::Connecting,
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    let attachment = broker.attach(pool, remote_addr.to_string());
    let tag = attachment.tag;
    let handle = attachment.handle;
    let mut outbound = attachment.outbound;
    lifecycle.advance(ConnectionState::Registered);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let writer_tag = tag.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        let _ = ws_tx.close().await;
        debug!(tag = %writer_tag, "writer task finished");
    });

    lifecycle.advance(ConnectionState::Reading);
    let reason = loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            _ = handle.evicted() => break CloseReason::Evicted,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(pool = %pool, tag = %tag, error = %err, "websocket read error");
                break CloseReason::ReadError;
            }
            None => break CloseReason::StreamEnded,
        };

        let decoded = match message {
            Message::Text(text) => Envelope::decode(text.as_bytes()),
            Message::Binary(bytes) => Envelope::decode(&bytes),
            Message::Close(frame) => {
                debug!(
                    pool = %pool,
                    tag = %tag,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "peer closed websocket"
                );
                break CloseReason::PeerClosed;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(pool = %pool, tag = %tag, error = %err, "closing on malformed envelope");
                break CloseReason::ProtocolViolation;
            }
        };

        // Client tags are always the registry's, whatever the client sent.
        let envelope = match pool {
            PoolKind::Clients => envelope.with_tag(tag.clone()),
            PoolKind::Providers => envelope,
        };
        let action = envelope.action;
        let outcome = broker.dispatch(pool, &tag, envelope);
        debug!(pool = %pool, tag = %tag, action = %action, outcome = ?outcome, "routed");
    };

    lifecycle.advance(ConnectionState::Closing);
    broker.detach(pool, &tag);
    let _ = stop_tx.send(());
    if tokio::time::timeout(WRITER_CLOSE_GRACE, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    drop(handle);
    lifecycle.advance(ConnectionState::Closed);

    info!(
        pool = %pool,
        tag = %tag,
        remote_addr = %remote_addr,
        reason = ?reason,
        "connection closed"
    );
}
