//! WebSocket front end of the [`Hub`].
//!
//! ```text
//! ws://host/<room>  ──JOIN──▶  Hub::join  ──WELCOME──▶  client
//!                   ──*────▶  Hub::handle ──fan-out──▶  other members
//! ```
//!
//! Each connection gets a reader loop and a writer task fed by the bounded
//! channel registered with the hub. The room comes from the first path
//! segment; only a bare path defers to the room named in `JOIN`.

use crate::config::ServerConfig;
use crate::error::{ProtocolError, Result, SyncError};
use crate::hub::Hub;
use crate::protocol::Message;
use coderoom_core::RoomId;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, error, info, warn};

pub struct SyncServer {
    hub: Arc<Hub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new(config)),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Bind the configured address and serve.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.hub.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener. A failed `accept`
    /// is logged and retried; only the caller can stop the server.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Sync server listening");
        let sweeper = tokio::spawn(sweep_loop(
            self.hub.clone(),
            Duration::from_millis(self.hub.config().sweep_interval_ms.max(1)),
        ));
        let _guard = AbortOnDrop(sweeper);
        self.accept_loop(|| listener.accept().boxed()).await
    }

    async fn accept_loop<'a, F>(&self, mut accept: F) -> Result<()>
    where
        F: FnMut() -> BoxFuture<'a, io::Result<(TcpStream, SocketAddr)>>,
    {
        loop {
            let (stream, addr) = match accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            };
            debug!(%addr, "New TCP connection");
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(hub, stream, addr).await {
                    warn!(%addr, error = %err, "Connection ended with error");
                }
            });
        }
    }
}

/// Pause after a failed `accept`, e.g. while out of file descriptors.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn sweep_loop(hub: Arc<Hub>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let expired = hub.sweep();
        if expired > 0 {
            debug!(expired, "Swept stale presence entries");
        }
    }
}

async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        },
    )
    .await
    .map_err(|err| SyncError::Transport(err.to_string()))?;
    let (mut sink, mut frames) = ws.split();

    let join_timeout = Duration::from_millis(hub.config().join_timeout_ms);
    let first = tokio::time::timeout(join_timeout, async {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Frame::Close(_)) => return Ok(None),
                Ok(frame) => match decode_frame(&frame) {
                    Some(Ok(join @ Message::Join { .. })) => return Ok(Some(join)),
                    Some(Ok(other)) => {
                        warn!(%addr, kind = other.kind(), "Message before JOIN dropped")
                    }
                    Some(Err(err)) => warn!(%addr, error = %err, "Dropping malformed frame"),
                    None => {}
                },
                Err(err) => return Err(SyncError::Transport(err.to_string())),
            }
        }
        Ok(None)
    })
    .await;
    let (requested_room, replica_id, state_vector) = match first {
        Ok(Ok(Some(Message::Join {
            room,
            replica_id,
            state_vector,
        }))) => (room, replica_id, state_vector),
        Ok(Ok(_)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            warn!(%addr, "No JOIN received in time, closing");
            let _ = sink.send(Frame::Close(None)).await;
            return Ok(());
        }
    };

    let room = resolve_room(&path, requested_room);
    let (tx, mut rx) = mpsc::channel(hub.config().channel_capacity.max(1));
    let joined = match hub.join(&room, replica_id, state_vector, tx) {
        Ok(joined) => joined,
        Err(err) => {
            let _ = sink.send(Frame::Close(None)).await;
            return Err(err);
        }
    };
    debug!(%addr, room = %room, connection = %joined.connection_id, "WebSocket joined room");

    let writer_room = room.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.encode() {
                Ok(text) => {
                    if sink.send(Frame::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!(room = %writer_room, error = %err, "Failed to encode message"),
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Close(_)) => break,
            Ok(frame) => match decode_frame(&frame) {
                Some(Ok(message)) => hub.handle(&room, &joined.connection_id, message),
                Some(Err(err)) => {
                    warn!(room = %room, connection = %joined.connection_id, error = %err, "Dropping malformed frame")
                }
                None => {}
            },
            Err(err) => {
                debug!(room = %room, connection = %joined.connection_id, error = %err, "WebSocket read failed");
                break;
            }
        }
    }
    hub.leave(&room, &joined.connection_id);
    Ok(())
}

/// The path names the room; a bare path falls back to the room in `JOIN`.
fn resolve_room(path: &str, requested: RoomId) -> RoomId {
    let from_path = RoomId::from_path(path);
    if from_path.as_str() != RoomId::DEFAULT || requested.as_str().is_empty() {
        return from_path;
    }
    requested
}

/// Decode a data frame; control frames yield `None`.
pub(crate) fn decode_frame(frame: &Frame) -> Option<std::result::Result<Message, ProtocolError>> {
    match frame {
        Frame::Text(text) => Some(Message::decode(text.as_str())),
        Frame::Binary(bytes) => Some(
            std::str::from_utf8(bytes)
                .map_err(|err| ProtocolError::Malformed(err.to_string()))
                .and_then(Message::decode),
        ),
        _ => None,
    }
}
