use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::CloseFrame},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{self, Handshake, Role},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reads stdin line by line and publishes every non-empty line to the channel.
pub async fn publish(args: ClientArgs) -> Result<()> {
    let (socket, base) = join(&args, Role::Publisher).await?;
    let (mut sink, mut inbound) = socket.split();
    write_stdout(&format!("*** publishing to {} (type lines, ctrl-d to finish)", args.channel))
        .await?;
    debug!(?base, "liveness base");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        select! {
            // A cancelled read_line leaves its partial line in `input`.
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let line = input.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
                input.clear();
                if line.is_empty() {
                    continue;
                }
                sink.send(Message::binary(line))
                    .await
                    .context("failed to publish message")?;
            }
            // Keeps pings answered and notices the broker going away.
            next = inbound.next() => match next {
                Some(Ok(Message::Close(frame))) => return server_closed(frame).await,
                None => return server_closed(None).await,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("connection to broker failed"),
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    if let Err(error) = sink.send(Message::Close(None)).await {
        warn!(?error, "failed to close connection cleanly");
    }
    Ok(())
}

/// Prints every payload published to the channel, one line per message.
pub async fn subscribe(args: ClientArgs) -> Result<()> {
    let (mut socket, base) = join(&args, Role::Subscriber).await?;
    write_stdout(&format!("*** subscribed to {}", args.channel)).await?;

    let silence = silence_timeout(base);
    loop {
        let next = select! {
            next = timeout(silence, socket.next()) => next,
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                if let Err(error) = socket.close(None).await {
                    warn!(?error, "failed to close connection cleanly");
                }
                return Ok(());
            }
        };

        match next {
            Err(_) => bail!("no traffic from broker for {silence:?}"),
            Ok(None) => return server_closed(None).await,
            Ok(Some(Err(err))) => return Err(err).context("connection to broker failed"),
            Ok(Some(Ok(message))) => match message {
                Message::Binary(payload) => {
                    write_stdout(&String::from_utf8_lossy(&payload)).await?;
                }
                Message::Text(payload) => write_stdout(payload.as_str()).await?,
                Message::Close(frame) => return server_closed(frame).await,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            },
        }
    }
}

/// A subscriber waits one and a half probe intervals before giving up.
fn silence_timeout(base: Duration) -> Duration {
    base * 3 / 2
}

/// Connects, sends the classification message, and waits for the liveness base.
async fn join(args: &ClientArgs, role: Role) -> Result<(Socket, Duration)> {
    let (mut socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    socket
        .send(Handshake::new(role, args.channel.as_str()).to_message())
        .await
        .context("failed to send handshake")?;

    loop {
        let message = socket
            .next()
            .await
            .ok_or_else(|| anyhow!("broker closed the connection during the handshake"))?
            .context("failed to read liveness parameter")?;
        match message {
            Message::Binary(bytes) => {
                return protocol::decode_ping_duration(&bytes)
                    .map(|base| (socket, base))
                    .ok_or_else(|| anyhow!("malformed liveness parameter ({} bytes)", bytes.len()));
            }
            Message::Text(text) => {
                let millis = u64::from_str_radix(text.as_str(), 16)
                    .with_context(|| format!("malformed liveness parameter {:?}", text.as_str()))?;
                return Ok((socket, Duration::from_millis(millis)));
            }
            Message::Close(frame) => {
                bail!("broker rejected the handshake{}", describe(frame.as_ref()))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

async fn server_closed(frame: Option<CloseFrame>) -> Result<()> {
    write_stdout(&format!("*** server closed the connection{}", describe(frame.as_ref()))).await?;
    Ok(())
}

fn describe(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => format!(": {}", frame.reason.as_str()),
        _ => String::new(),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
