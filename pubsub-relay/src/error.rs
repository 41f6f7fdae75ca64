use std::{str::Utf8Error, time::Duration};

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Reasons a connection fails classification. None of these touch the registry.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake message is empty")]
    Empty,
    #[error("handshake message carries no channel name")]
    MissingChannel,
    #[error("unknown role discriminator {0:#04x}")]
    UnknownRole(u8),
    #[error("channel name is not valid UTF-8")]
    InvalidChannelName(#[source] Utf8Error),
    #[error("expected a data frame for the handshake, got {0}")]
    UnexpectedFrame(&'static str),
    #[error("no handshake received within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before handshake")]
    Closed,
    #[error("transport failed during handshake")]
    Transport(#[from] WsError),
}

/// Why a message could not be queued on a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Backpressure,
}

/// Terminal outcome of one connection's lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket upgrade failed")]
    Upgrade(#[source] WsError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("transport error")]
    Transport(#[from] WsError),
    #[error("no liveness activity within {0:?}")]
    Timeout(Duration),
    #[error("failed to queue outbound message")]
    Send(#[from] SendError),
}
