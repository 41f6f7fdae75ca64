use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use pubsub_relay::{
    broker::Broker,
    cli::{BrokerArgs, Cli, Command},
    client,
    config::BrokerConfig,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Command::Broker(BrokerArgs {
        threads: Some(threads),
        ..
    }) = &cli.command
    {
        builder.worker_threads(*threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Broker(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let broker = Broker::new(listener, BrokerConfig::from(&args));
            let addr = broker.local_addr()?;
            info!("broker listening on {}", addr);
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Publish(args) => client::publish(args).await?,
        Command::Subscribe(args) => client::subscribe(args).await?,
    }

    Ok(())
}
