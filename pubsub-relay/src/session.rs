//! One accepted connection, from WebSocket upgrade to teardown.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, trace};

use crate::{
    broker::BrokerState,
    connection::{CLOSE_GRACE, CloseReason, ConnectionHandle, ConnectionId, run_writer},
    error::{HandshakeError, SessionError},
    liveness::{LivenessEvent, LivenessMonitor},
    protocol::{self, Handshake, Role, Route},
    registry::ChannelRegistry,
};

/// Unregisters the connection when dropped, whichever way the session ends.
struct Registration<'a> {
    registry: &'a ChannelRegistry,
    channel: &'a str,
    id: ConnectionId,
}

impl<'a> Registration<'a> {
    fn new(
        registry: &'a ChannelRegistry,
        handshake: &'a Handshake,
        connection: &ConnectionHandle,
    ) -> Self {
        registry.register(&handshake.channel, connection, handshake.role);
        Self {
            registry,
            channel: &handshake.channel,
            id: connection.id(),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.channel, self.id);
    }
}

/// Runs the whole lifecycle of one transport connection.
pub(crate) async fn handle_connection<S>(
    stream: S,
    id: ConnectionId,
    state: Arc<BrokerState>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (socket, route) = accept(stream, &state).await?;
    let (mut sink, mut inbound) = socket.split();

    let path_routed = matches!(route, Route::Direct(_));
    let handshake = match route {
        Route::Direct(handshake) => handshake,
        _ => match read_handshake(&mut inbound, &state).await {
            Ok(handshake) => handshake,
            Err(err) => {
                let reason = if state.shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::HandshakeRejected
                };
                reject(&mut sink, reason).await;
                return Err(err.into());
            }
        },
    };
    debug!(conn = %id, channel = %handshake.channel, role = %handshake.role, "classified");

    let (handle, outbound) = ConnectionHandle::new(
        id,
        state.config.outbound_capacity,
        state.shutdown.child_token(),
    );
    let writer = tokio::spawn(run_writer(sink, outbound));

    let result = {
        let _registration = Registration::new(&state.registry, &handshake, &handle);
        relay(&handshake, &handle, &mut inbound, &state, path_routed).await
    };

    handle.close(match &result {
        Ok(()) => CloseReason::Normal,
        Err(SessionError::Timeout(_)) => CloseReason::Expired,
        Err(SessionError::Send(_)) => CloseReason::Overloaded,
        Err(_) => CloseReason::TransportFailed,
    });
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(conn = %id, ?err, "writer stopped with error"),
        Err(err) => debug!(conn = %id, ?err, "writer task failed"),
    }

    result
}

/// WebSocket upgrade, bounded like the handshake: a peer that never finishes
/// it is dropped after the eviction timeout or at shutdown.
async fn accept<S>(stream: S, state: &BrokerState) -> Result<(WebSocketStream<S>, Route), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path_routing = state.config.path_routing;
    let limit = state.config.eviction_timeout();
    let mut route = Route::FirstMessage;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if !path_routing {
            return Ok(response);
        }
        match protocol::parse_route(request.uri().path()) {
            Route::NotFound => {
                let mut not_found = ErrorResponse::new(Some("404 Not Found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
            parsed => {
                route = parsed;
                Ok(response)
            }
        }
    };

    let socket = {
        let upgrade = tokio_tungstenite::accept_hdr_async(stream, callback);
        select! {
            upgraded = timeout(limit, upgrade) => match upgraded {
                Ok(socket) => socket.map_err(SessionError::Upgrade)?,
                Err(_) => return Err(HandshakeError::Timeout(limit).into()),
            },
            _ = state.shutdown.cancelled() => return Err(HandshakeError::Closed.into()),
        }
    };
    Ok((socket, route))
}

/// Reads the one message that classifies the connection. The wait is bounded
/// by the eviction timeout, and broker shutdown aborts it.
async fn read_handshake<St>(inbound: &mut St, state: &BrokerState) -> Result<Handshake, HandshakeError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let limit = state.config.eviction_timeout();
    let first = select! {
        first = timeout(limit, inbound.next()) => first,
        _ = state.shutdown.cancelled() => return Err(HandshakeError::Closed),
    };

    match first {
        Err(_) => Err(HandshakeError::Timeout(limit)),
        Ok(None) => Err(HandshakeError::Closed),
        Ok(Some(Err(err))) => Err(HandshakeError::Transport(err)),
        Ok(Some(Ok(message))) => Handshake::from_message(&message),
    }
}

/// Best-effort close after a failed handshake; nothing else is sent.
async fn reject<Si>(sink: &mut Si, reason: CloseReason)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let frame = reason.close_frame();
    if let Ok(Err(err)) = timeout(CLOSE_GRACE, sink.send(Message::Close(Some(frame)))).await {
        trace!(?err, "rejection close frame not delivered");
    }
}

/// Post-handshake loop: advertise the liveness base, then relay (publisher) or
/// idle (subscriber) until the peer leaves, the connection is closed by
/// someone else, or the liveness deadline passes.
async fn relay<St>(
    handshake: &Handshake,
    handle: &ConnectionHandle,
    inbound: &mut St,
    state: &BrokerState,
    path_routed: bool,
) -> Result<(), SessionError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let config = &state.config;
    handle.send(protocol::ping_duration_message(
        config.ping_duration,
        path_routed,
    ))?;

    let mut monitor = LivenessMonitor::new(config.ping_duration, config.margin);
    monitor.arm();

    let outcome = loop {
        select! {
            () = handle.closed() => break Ok(()),
            event = monitor.tick() => match event {
                LivenessEvent::ProbeDue => {
                    if let Err(err) = handle.send(Message::Ping(Default::default())) {
                        break Err(err.into());
                    }
                    monitor.probe_sent();
                }
                LivenessEvent::Expired => {
                    info!(conn = %handle.id(), channel = %handshake.channel, "evicting silent connection");
                    break Err(SessionError::Timeout(monitor.timeout()));
                }
            },
            next = inbound.next() => match next {
                None => break Ok(()),
                Some(Err(err)) => break Err(err.into()),
                Some(Ok(message)) => {
                    if !handle_inbound(message, handshake, handle, &mut monitor, &state.registry) {
                        break Ok(());
                    }
                }
            },
        }
    };

    monitor.close();
    outcome
}

/// Returns `false` once the peer has started the closing handshake.
fn handle_inbound(
    message: Message,
    handshake: &Handshake,
    handle: &ConnectionHandle,
    monitor: &mut LivenessMonitor,
    registry: &ChannelRegistry,
) -> bool {
    match message {
        Message::Ping(_) | Message::Pong(_) => monitor.record_activity(),
        Message::Close(frame) => {
            trace!(conn = %handle.id(), ?frame, "peer closed");
            return false;
        }
        Message::Binary(_) | Message::Text(_) => match handshake.role {
            Role::Publisher => {
                monitor.record_activity();
                let report = registry.fanout(&handshake.channel, &message);
                trace!(
                    conn = %handle.id(),
                    channel = %handshake.channel,
                    delivered = report.delivered,
                    failed = report.failed,
                    "relayed"
                );
            }
            Role::Subscriber => {
                trace!(conn = %handle.id(), "ignoring data from subscriber");
            }
        },
        Message::Frame(_) => {}
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::SinkExt;
    use tokio::io::{DuplexStream, duplex};
    use tokio_tungstenite::{client_async, tungstenite::protocol::frame::coding::CloseCode};

    use super::*;
    use crate::config::BrokerConfig;

    type Client = WebSocketStream<DuplexStream>;

    fn state(ping_ms: u64, margin_ms: u64) -> Arc<BrokerState> {
        Arc::new(BrokerState::new(BrokerConfig {
            ping_duration: Duration::from_millis(ping_ms),
            margin: Duration::from_millis(margin_ms),
            ..BrokerConfig::default()
        }))
    }

    async fn open(
        state: &Arc<BrokerState>,
        id: u64,
        path: &str,
    ) -> (Client, tokio::task::JoinHandle<Result<(), SessionError>>) {
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(handle_connection(
            server_io,
            ConnectionId(id),
            Arc::clone(state),
        ));
        let (client, _) = client_async(format!("ws://relay.test{path}"), client_io)
            .await
            .expect("client upgrade");
        (client, server)
    }

    async fn next_data(client: &mut Client) -> Option<Message> {
        while let Some(message) = client.next().await {
            match message.expect("client read") {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return Some(other),
            }
        }
        None
    }

    #[tokio::test]
    async fn subscriber_handshake_registers_and_advertises_base() {
        let state = state(30_000, 5_000);
        let (mut client, _server) = open(&state, 1, "/").await;

        client
            .send(Message::binary(b"\x01room".to_vec()))
            .await
            .expect("send handshake");

        let reply = next_data(&mut client).await.expect("liveness parameter");
        assert_eq!(reply, Message::binary(30_000u64.to_le_bytes().to_vec()));
        assert_eq!(state.registry.subscriber_count("room"), 1);
    }

    #[tokio::test]
    async fn invalid_discriminator_closes_without_reply() {
        let state = state(30_000, 5_000);
        let (mut client, server) = open(&state, 1, "/").await;

        client
            .send(Message::binary(b"\x02x".to_vec()))
            .await
            .expect("send handshake");

        match next_data(&mut client).await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Invalid),
            None => {}
            other => panic!("expected close, got {other:?}"),
        }
        let result = server.await.expect("session task");
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::UnknownRole(0x02)))
        ));
        assert!(!state.registry.contains_channel("x"));
    }

    #[tokio::test]
    async fn path_routed_subscriber_gets_hex_base() {
        let state = state(30_000, 5_000);
        let (mut client, _server) = open(&state, 1, "/room/sub").await;

        let reply = next_data(&mut client).await.expect("liveness parameter");
        assert_eq!(reply, Message::text("7530"));
        assert_eq!(state.registry.subscriber_count("room"), 1);
    }

    #[tokio::test]
    async fn path_with_nested_channel_is_not_found() {
        let state = state(30_000, 5_000);
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(handle_connection(server_io, ConnectionId(1), Arc::clone(&state)));

        let err = client_async("ws://relay.test/a/b/sub", client_io)
            .await
            .expect_err("upgrade must be refused");
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("expected HTTP error, got {other:?}"),
        }
        assert!(matches!(
            server.await.expect("session task"),
            Err(SessionError::Upgrade(_))
        ));
        assert_eq!(state.registry.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscriber_is_evicted_and_unregistered() {
        let state = state(1_000, 500);
        let (mut client, server) = open(&state, 1, "/").await;
        client
            .send(Message::binary(b"\x01idle".to_vec()))
            .await
            .expect("send handshake");
        next_data(&mut client).await.expect("liveness parameter");
        assert_eq!(state.registry.subscriber_count("idle"), 1);

        // The client stops reading, so the broker's probe is never answered.
        let result = server.await.expect("session task");
        assert!(matches!(result, Err(SessionError::Timeout(limit)) if limit == Duration::from_millis(1_500)));
        assert!(!state.registry.contains_channel("idle"));
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_subscriber_survives_with_zero_margin() {
        let state = state(1_000, 0);
        let (mut client, server) = open(&state, 1, "/").await;
        client
            .send(Message::binary(b"\x01room".to_vec()))
            .await
            .expect("send handshake");
        next_data(&mut client).await.expect("liveness parameter");

        // Reading answers every ping while several timeouts' worth of time passes.
        assert!(timeout(Duration::from_secs(5), next_data(&mut client)).await.is_err());
        assert_eq!(state.registry.subscriber_count("room"), 1);
        assert!(!server.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upgrade_is_dropped_after_eviction_timeout() {
        let state = state(100, 100);
        // Held open but never written to.
        let (_client_io, server_io) = duplex(64 * 1024);
        let start = tokio::time::Instant::now();

        let result = handle_connection(server_io, ConnectionId(1), Arc::clone(&state)).await;

        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::Timeout(limit)))
                if limit == Duration::from_millis(200)
        ));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(state.registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_a_pending_upgrade() {
        let state = state(30_000, 5_000);
        let (_client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(handle_connection(server_io, ConnectionId(1), Arc::clone(&state)));

        state.shutdown.cancel();

        assert!(matches!(
            server.await.expect("session task"),
            Err(SessionError::Handshake(HandshakeError::Closed))
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_established_sessions() {
        let state = state(30_000, 5_000);
        let (mut client, server) = open(&state, 1, "/room/pub").await;
        next_data(&mut client).await.expect("liveness parameter");
        assert_eq!(state.registry.publisher_count("room"), 1);

        state.shutdown.cancel();

        assert!(server.await.expect("session task").is_ok());
        match next_data(&mut client).await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!state.registry.contains_channel("room"));
    }
}
