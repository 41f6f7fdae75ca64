use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket publishers and subscribers.
    Broker(BrokerArgs),
    /// Publish each line read from stdin to a channel.
    Publish(ClientArgs),
    /// Print every message published to a channel.
    Subscribe(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "PUBSUB_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Base liveness duration in milliseconds, advertised to every client.
    #[arg(
        long,
        env = "PUBSUB_PING_DURATION_MS",
        default_value_t = 30_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ping_duration_ms: u64,

    /// Extra milliseconds of silence tolerated before a connection is evicted.
    #[arg(long, env = "PUBSUB_MARGIN_MS", default_value_t = 5_000)]
    pub margin_ms: u64,

    /// Outbound messages a subscriber may have pending before it is dropped.
    #[arg(
        long,
        env = "PUBSUB_OUTBOUND_CAPACITY",
        default_value_t = 1024,
        value_parser = parse_positive
    )]
    pub outbound_capacity: usize,

    /// Runtime worker threads. Defaults to one per CPU core.
    #[arg(long, env = "PUBSUB_THREADS", value_parser = parse_positive)]
    pub threads: Option<usize>,

    /// Only accept the first-message handshake, ignoring `/<channel>/pub|sub` paths.
    #[arg(long, env = "PUBSUB_NO_PATH_ROUTING")]
    pub no_path_routing: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Channel to publish to or subscribe to.
    #[arg(long)]
    pub channel: String,

    /// WebSocket URL of the broker.
    #[arg(long, env = "PUBSUB_SERVER", default_value = "ws://127.0.0.1:8080/")]
    pub server: String,
}

fn parse_positive(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("value must be at least 1".to_string()),
        Ok(value) => Ok(value),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use std::time::Duration;

    #[test]
    fn broker_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["pubsub-relay", "broker"]).expect("parse");
        let Command::Broker(args) = cli.command else {
            panic!("expected broker command");
        };
        assert_eq!(BrokerConfig::from(&args), BrokerConfig::default());
        assert_eq!(args.threads, None);
    }

    #[test]
    fn broker_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "pubsub-relay",
            "broker",
            "--ping-duration-ms",
            "250",
            "--margin-ms",
            "0",
            "--outbound-capacity",
            "4",
            "--no-path-routing",
        ])
        .expect("parse");
        let Command::Broker(args) = cli.command else {
            panic!("expected broker command");
        };

        let config = BrokerConfig::from(&args);
        assert_eq!(config.ping_duration, Duration::from_millis(250));
        assert_eq!(config.eviction_timeout(), Duration::from_millis(250));
        assert_eq!(config.outbound_capacity, 4);
        assert!(!config.path_routing);
    }

    #[test]
    fn zero_durations_and_capacities_are_rejected() {
        assert!(Cli::try_parse_from(["pubsub-relay", "broker", "--ping-duration-ms", "0"]).is_err());
        assert!(Cli::try_parse_from(["pubsub-relay", "broker", "--outbound-capacity", "0"]).is_err());
        assert!(Cli::try_parse_from(["pubsub-relay", "broker", "--threads", "0"]).is_err());
    }

    #[test]
    fn clients_require_a_channel() {
        assert!(Cli::try_parse_from(["pubsub-relay", "subscribe"]).is_err());
        let cli = Cli::try_parse_from(["pubsub-relay", "publish", "--channel", "room"])
            .expect("parse");
        let Command::Publish(args) = cli.command else {
            panic!("expected publish command");
        };
        assert_eq!(args.channel, "room");
    }
}
