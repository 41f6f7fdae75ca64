use std::time::Duration;

use crate::cli::BrokerArgs;

pub const DEFAULT_PING_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_MARGIN: Duration = Duration::from_secs(5);
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Runtime settings for a [`crate::broker::Broker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Advertised to clients and used as the probe interval. Must be non-zero.
    pub ping_duration: Duration,
    /// Added to `ping_duration` before a silent connection is evicted.
    pub margin: Duration,
    /// Messages a subscriber may have queued before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// Accept `/<channel>/pub` and `/<channel>/sub` upgrade paths.
    pub path_routing: bool,
}

impl BrokerConfig {
    pub fn eviction_timeout(&self) -> Duration {
        self.ping_duration + self.margin
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ping_duration: DEFAULT_PING_DURATION,
            margin: DEFAULT_MARGIN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            path_routing: true,
        }
    }
}

impl From<&BrokerArgs> for BrokerConfig {
    fn from(args: &BrokerArgs) -> Self {
        Self {
            ping_duration: Duration::from_millis(args.ping_duration_ms),
            margin: Duration::from_millis(args.margin_ms),
            outbound_capacity: args.outbound_capacity,
            path_routing: !args.no_path_routing,
        }
    }
}
