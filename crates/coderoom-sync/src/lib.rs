//! # Coderoom Sync
//!
//! Keeps replicas of a room's document and presence in step.
//!
//! - [`Hub`]: per-room server state (document replica, presence relay,
//!   members) with fan-out to connections
//! - [`SyncServer`]: WebSocket front end of the hub
//! - [`Transport`]: how a client reaches a hub ([`MemoryTransport`],
//!   [`WebSocketTransport`])
//! - [`Session`]: a client replica with reconnect, resync and an offline
//!   outbox
//! - [`EditorBinding`]: turns editor gestures into edits and throttled
//!   cursor updates
//!
//! ```rust,ignore
//! use coderoom_core::RoomId;
//! use coderoom_doc::LocalEdit;
//! use coderoom_sync::{Session, WebSocketTransport};
//!
//! let transport = WebSocketTransport::new("ws://127.0.0.1:1234/pairing");
//! let session = Session::new(RoomId::new("pairing"), transport);
//! session.connect().await?;
//! session.edit(LocalEdit::Insert { position: 0, text: "hello".into() });
//! ```

pub mod binding;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use binding::{remote_cursors, EditorBinding, EditorEvent, RateLimiter, RemoteCursor};
pub use config::{
    ClientConfig, ClientConfigBuilder, Preferences, ServerConfig, SyncConfig, SyncConfigBuilder,
};
pub use error::{ProtocolError, Result, SyncError};
pub use hub::{Hub, Joined};
pub use protocol::Message;
pub use server::SyncServer;
pub use session::{Session, SessionEvent, SessionState};
pub use transport::{Connection, MemoryTransport, Transport, WebSocketTransport};
