//! Error types for room synchronization.

use coderoom_doc::DocError;
use thiserror::Error;

/// A frame that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// The initial connection could not be established.
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Room {0} is full")]
    RoomFull(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
