use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::BrokerConfig,
    connection::ConnectionId,
    error::SessionError,
    registry::ChannelRegistry,
    session::handle_connection,
};

/// How long shutdown waits for open connections to send their close frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener, config: BrokerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, mostly useful for inspecting channel membership.
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until `shutdown` resolves, then closes every open
    /// connection and waits briefly for them to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        drop(listener);
        handle_shutdown(&state).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn handle_shutdown(state: &BrokerState) {
    info!(
        connections = state.tasks.len(),
        channels = state.registry.channel_count(),
        "broker shutting down"
    );
    state.shutdown.cancel();
    state.tasks.close();
    if timeout(SHUTDOWN_GRACE, state.tasks.wait()).await.is_err() {
        warn!(
            remaining = state.tasks.len(),
            "connections still open after shutdown grace period"
        );
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, state: &Arc<BrokerState>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to disable nagle");
    }

    let id = state.next_id();
    debug!(conn = %id, %peer, "accepted");
    let task_state = Arc::clone(state);
    state.tasks.spawn(async move {
        let result = handle_connection(stream, id, task_state).await;
        log_session_end(id, peer, result);
    });
}

fn log_session_end(id: ConnectionId, peer: SocketAddr, result: Result<(), SessionError>) {
    match result {
        Ok(()) => debug!(conn = %id, %peer, "connection closed"),
        Err(SessionError::Timeout(limit)) => {
            info!(conn = %id, %peer, ?limit, "connection evicted after liveness timeout")
        }
        Err(err @ (SessionError::Handshake(_) | SessionError::Upgrade(_))) => {
            debug!(conn = %id, %peer, error = %err, "connection rejected")
        }
        Err(err) => warn!(conn = %id, %peer, error = ?err, "connection closed with error"),
    }
}

/// State shared by the accept loop and every connection task.
#[derive(Debug)]
pub(crate) struct BrokerState {
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) config: BrokerConfig,
    /// Parent of every connection's close token.
    pub(crate) shutdown: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

impl BrokerState {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new()),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
