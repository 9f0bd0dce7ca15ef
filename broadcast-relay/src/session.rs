//! Per-connection lifecycle on the server.
//!
//! ```text
//! Accepted -> Handshaking -> Active -> Closing -> Closed
//!                  |                      ^
//!                  +----------------------+   (peer left before naming itself)
//! ```
//!
//! Reads happen here; writes go through the connection's outbound queue and
//! are performed by [`drain_outbound`], so a socket only ever has one writer.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Message, broadcast},
    registry::{ConnectionHandle, ConnectionId, Registry, SessionInfo},
    wire::{Framing, PayloadReader, display_text, write_payload},
};

pub fn guest_name(peer: SocketAddr) -> String {
    format!("Guest_{}", peer.port())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Handshaking,
    Active { name: String },
    Closing { name: Option<String> },
    Closed,
}

pub(crate) struct Session<R> {
    id: ConnectionId,
    peer: SocketAddr,
    reader: PayloadReader<R>,
    handle: ConnectionHandle,
    registry: Arc<Registry>,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    /// `handle` must already be registered under `id`.
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        reader: PayloadReader<R>,
        handle: ConnectionHandle,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            id,
            peer,
            reader,
            handle,
            registry,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state = SessionState::Handshaking;
        loop {
            state = match state {
                SessionState::Handshaking => self.handshake().await,
                SessionState::Active { name } => self.relay(name).await,
                SessionState::Closing { name } => self.close(name),
                SessionState::Closed => break,
            };
        }
    }

    async fn handshake(&mut self) -> SessionState {
        let payload = select! {
            _ = self.handle.closed() => return SessionState::Closing { name: None },
            read = self.reader.read_payload() => read,
        };

        let raw = match payload {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(id = %self.id, peer = %self.peer, "disconnected before sending a name");
                return SessionState::Closing { name: None };
            }
            Err(err) => {
                warn!(id = %self.id, peer = %self.peer, error = ?err, "handshake read failed");
                return SessionState::Closing { name: None };
            }
        };

        let trimmed = String::from_utf8_lossy(&raw).trim().to_string();
        let name = if trimmed.is_empty() {
            guest_name(self.peer)
        } else {
            trimmed
        };

        if !self
            .registry
            .set_info(self.id, SessionInfo::new(self.peer, name.clone()))
        {
            debug!(id = %self.id, %name, "connection dropped during handshake");
            return SessionState::Closing { name: None };
        }

        info!(id = %self.id, peer = %self.peer, %name, "client joined");
        broadcast(&self.registry, &Message::joined(&name), Some(self.id));
        SessionState::Active { name }
    }

    async fn relay(&mut self, name: String) -> SessionState {
        loop {
            let payload = select! {
                _ = self.handle.closed() => {
                    debug!(id = %self.id, %name, "connection closed by relay");
                    break;
                }
                read = self.reader.read_payload() => read,
            };

            match payload {
                Ok(Some(payload)) if payload.is_empty() => continue,
                Ok(Some(payload)) => {
                    debug!(id = %self.id, %name, text = %display_text(&payload), "relaying message");
                    broadcast(
                        &self.registry,
                        &Message::from_user(name.as_str(), payload),
                        Some(self.id),
                    );
                }
                Ok(None) => {
                    debug!(id = %self.id, %name, "peer closed the connection");
                    break;
                }
                Err(err) => {
                    warn!(id = %self.id, %name, error = ?err, "read failed, closing session");
                    break;
                }
            }
        }

        SessionState::Closing { name: Some(name) }
    }

    fn close(&mut self, name: Option<String>) -> SessionState {
        self.registry.remove(self.id);
        self.handle.close();

        match name {
            Some(name) => {
                info!(
                    id = %self.id,
                    peer = %self.peer,
                    %name,
                    roster = ?self.registry.names(),
                    "client left"
                );
                broadcast(&self.registry, &Message::left(&name), None);
            }
            None => debug!(id = %self.id, peer = %self.peer, "connection closed before joining"),
        }

        SessionState::Closed
    }
}

/// Writes queued payloads to the socket until the connection is closed.
///
/// A failed write closes the connection so the owning session and any later
/// broadcast notice it. Closing the connection abandons a write that is
/// blocked on a peer that stopped reading.
pub(crate) async fn drain_outbound<W>(
    mut writer: W,
    framing: Framing,
    mut outbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let payload = select! {
            biased;
            _ = closed.cancelled() => break,
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let written = select! {
            biased;
            _ = closed.cancelled() => {
                debug!(%id, "connection closed with a write in flight");
                break;
            }
            written = write_payload(&mut writer, framing, &payload) => written,
        };
        if let Err(err) = written {
            debug!(%id, error = ?err, "write failed, closing connection");
            break;
        }
    }

    closed.cancel();
    outbound.close();
    if let Err(err) = writer.shutdown().await {
        debug!(%id, error = ?err, "failed to shut down write half");
    }
}
