//! Per-connection send and close primitives.
//!
//! A [`ConnectionHandle`] is the only way other components talk to a
//! connection. It never touches the socket: messages go through a bounded
//! queue drained by the connection's single writer task ([`run_writer`]), so
//! sends are serialized, and closing is a cancellation that the writer and the
//! connection's read loop both observe.

use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures_util::{Sink, SinkExt};
use tokio::{select, sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SendError;

/// Upper bound on how long the writer waits to flush a close frame.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Lifecycle ended normally, usually because the peer went away.
    Normal,
    /// First message did not classify the connection.
    HandshakeRejected,
    /// Liveness deadline passed without activity.
    Expired,
    /// Outbound queue overflowed during fan-out.
    Overloaded,
    /// Socket read or write failed.
    TransportFailed,
    /// Broker is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn close_code(self) -> CloseCode {
        match self {
            CloseReason::Normal => CloseCode::Normal,
            CloseReason::HandshakeRejected => CloseCode::Invalid,
            CloseReason::Expired | CloseReason::TransportFailed => CloseCode::Error,
            CloseReason::Overloaded => CloseCode::Again,
            CloseReason::Shutdown => CloseCode::Away,
        }
    }

    fn description(self) -> &'static str {
        match self {
            CloseReason::Normal => "",
            CloseReason::HandshakeRejected => "invalid handshake",
            CloseReason::Expired => "liveness timeout",
            CloseReason::Overloaded => "subscriber too slow",
            CloseReason::TransportFailed => "transport error",
            CloseReason::Shutdown => "broker shutting down",
        }
    }

    pub fn close_frame(self) -> CloseFrame {
        CloseFrame {
            code: self.close_code(),
            reason: self.description().into(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    closed: CancellationToken,
    reason: OnceLock<CloseReason>,
}

/// Cloneable, non-owning handle to one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    shared: Arc<Shared>,
}

/// Receiving end of a connection's outbound queue, consumed by [`run_writer`].
#[derive(Debug)]
pub struct Outbound {
    pub(crate) queue: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Creates a handle whose close signal is `closed`. Passing a child token
    /// lets a parent (the broker) close every connection at once.
    pub fn new(id: ConnectionId, capacity: usize, closed: CancellationToken) -> (Self, Outbound) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            closed,
            reason: OnceLock::new(),
        });

        let handle = Self {
            id,
            outbound,
            shared: Arc::clone(&shared),
        };
        (handle, Outbound { queue, shared })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues one message without waiting. Fails instead of blocking when the
    /// connection is closed or its queue is full.
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        self.outbound.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Idempotent; the first reason recorded wins, and a connection already
    /// closed by its parent keeps reading as [`CloseReason::Shutdown`].
    pub fn close(&self, reason: CloseReason) {
        if !self.shared.closed.is_cancelled() {
            let _ = self.shared.reason.set(reason);
        }
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        closing_reason(&self.shared)
    }

    /// Resolves once the connection has been closed by anyone.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

fn closing_reason(shared: &Shared) -> Option<CloseReason> {
    if !shared.closed.is_cancelled() {
        return None;
    }
    // A cancelled token with no recorded reason was cancelled by its parent.
    Some(shared.reason.get().copied().unwrap_or(CloseReason::Shutdown))
}

/// Drains the outbound queue into the socket until the connection closes, then
/// sends a close frame carrying the close reason.
pub async fn run_writer<S>(mut sink: S, mut outbound: Outbound) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let closed = outbound.shared.closed.clone();

    loop {
        select! {
            biased;
            _ = closed.cancelled() => break,
            next = outbound.queue.recv() => {
                let Some(message) = next else { break };
                select! {
                    sent = sink.send(message) => {
                        if let Err(err) = sent {
                            let _ = outbound.shared.reason.set(CloseReason::TransportFailed);
                            closed.cancel();
                            return Err(err);
                        }
                    }
                    _ = closed.cancelled() => break,
                }
            }
        }
    }

    let reason = closing_reason(&outbound.shared).unwrap_or(CloseReason::Normal);
    match timeout(CLOSE_GRACE, sink.send(Message::Close(Some(reason.close_frame())))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(?err, "close frame not delivered"),
        Err(_) => debug!("timed out delivering close frame"),
    }
    Ok(())
}
