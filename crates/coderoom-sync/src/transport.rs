//! Ways for a [`Session`](crate::Session) to reach a hub.

use crate::error::{Result, SyncError};
use crate::hub::Hub;
use crate::protocol::Message;
use crate::server::decode_frame;
use async_trait::async_trait;
use coderoom_core::RoomId;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, error, warn};

/// One live link. The hub side is gone once `incoming` yields `None`.
pub struct Connection {
    pub outgoing: mpsc::Sender<Message>,
    pub incoming: mpsc::Receiver<Message>,
}

/// Opens links to a room. Each call returns a fresh link; the first
/// message sent on it must be `JOIN`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// In-process link to a [`Hub`], severable for tests and demos. Clones
/// share the online flag, the severing switch and the loss counter.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    room: RoomId,
    capacity: usize,
    online: Arc<AtomicBool>,
    kill: broadcast::Sender<()>,
    /// Client `UPDATE`s still to be lost on the way to the hub.
    lose_updates: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<Hub>, room: RoomId) -> Self {
        let (kill, _) = broadcast::channel(1);
        let capacity = hub.config().channel_capacity.max(1);
        Self {
            hub,
            room,
            capacity,
            online: Arc::new(AtomicBool::new(true)),
            kill,
            lose_updates: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse (or allow again) new links.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Drop every link opened so far, as a network failure would.
    pub fn sever(&self) {
        let _ = self.kill.send(());
    }

    /// Silently lose the next `count` `UPDATE`s sent towards the hub while
    /// the link stays up.
    pub fn lose_next_updates(&self, count: usize) {
        self.lose_updates.store(count, Ordering::SeqCst);
    }

    fn should_lose(&self, message: &Message) -> bool {
        matches!(message, Message::Update { .. })
            && self
                .lose_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Connection> {
        if !self.is_online() {
            return Err(SyncError::Transport(format!("{} is offline", self.describe())));
        }
        let (outgoing, mut from_client) = mpsc::channel::<Message>(self.capacity);
        let (to_client, incoming) = mpsc::channel(self.capacity);
        let mut kill = self.kill.subscribe();
        let link = self.clone();
        let hub = self.hub.clone();
        let room = self.room.clone();

        tokio::spawn(async move {
            let joined = loop {
                tokio::select! {
                    _ = kill.recv() => return,
                    message = from_client.recv() => match message {
                        Some(Message::Join { replica_id, state_vector, .. }) => {
                            match hub.join(&room, replica_id, state_vector, to_client.clone()) {
                                Ok(joined) => break joined,
                                Err(err) => {
                                    warn!(room = %room, error = %err, "In-memory join refused");
                                    return;
                                }
                            }
                        }
                        Some(other) => warn!(room = %room, kind = other.kind(), "Message before JOIN dropped"),
                        None => return,
                    },
                }
            };
            drop(to_client);

            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        debug!(room = %room, connection = %joined.connection_id, "In-memory link severed");
                        break;
                    }
                    message = from_client.recv() => match message {
                        Some(message) if link.should_lose(&message) => {
                            debug!(room = %room, connection = %joined.connection_id, "In-memory link lost an update");
                        }
                        Some(message) => hub.handle(&room, &joined.connection_id, message),
                        None => break,
                    },
                }
            }
            hub.leave(&room, &joined.connection_id);
        });

        Ok(Connection { outgoing, incoming })
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.room)
    }
}

/// Link to a [`SyncServer`](crate::SyncServer) over WebSocket text frames.
pub struct WebSocketTransport {
    url: String,
    capacity: usize,
}

impl WebSocketTransport {
    /// `url` names the room in its path, e.g. `ws://127.0.0.1:1234/pairing`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: 256,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        let (mut sink, mut frames) = ws.split();
        let (outgoing, mut to_server) = mpsc::channel::<Message>(self.capacity);
        let (to_client, incoming) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            while let Some(message) = to_server.recv().await {
                match message.encode() {
                    Ok(text) => {
                        if sink.send(Frame::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => error!(error = %err, "Failed to encode message"),
                }
            }
            let _ = sink.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Frame::Close(_)) => break,
                    Ok(frame) => match decode_frame(&frame) {
                        Some(Ok(message)) => {
                            if to_client.send(message).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => warn!(url = %url, error = %err, "Dropping malformed frame"),
                        None => {}
                    },
                    Err(err) => {
                        debug!(url = %url, error = %err, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Connection { outgoing, incoming })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderoom_core::ReplicaId;

    #[tokio::test]
    async fn test_memory_link_joins_and_severs() {
        let hub = Arc::new(Hub::default());
        let room = RoomId::new("r");
        let transport = MemoryTransport::new(hub.clone(), room.clone());

        let mut link = transport.connect().await.unwrap();
        link.outgoing
            .send(Message::Join {
                room: room.clone(),
                replica_id: Some(ReplicaId::new("alice")),
                state_vector: None,
            })
            .await
            .unwrap();
        match link.incoming.recv().await {
            Some(Message::Welcome { replica_id, .. }) => assert_eq!(replica_id, ReplicaId::new("alice")),
            other => panic!("expected welcome, got {other:?}"),
        }
        link.outgoing.send(Message::Ping).await.unwrap();
        assert_eq!(link.incoming.recv().await, Some(Message::Pong));

        transport.sever();
        assert_eq!(link.incoming.recv().await, None);
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_transport_refuses() {
        let transport = MemoryTransport::new(Arc::new(Hub::default()), RoomId::new("r"));
        transport.set_online(false);
        assert!(matches!(transport.connect().await, Err(SyncError::Transport(_))));
        transport.set_online(true);
        tokio_test::assert_ok!(transport.connect().await);
    }
}
