//! Channel name → membership map and the fan-out path.
//!
//! Joins and leaves take the registry-wide write lock, so a channel is only
//! created or dropped while nobody else can be joining it. Fan-out takes the
//! read lock just long enough to find the channel, copies the subscriber set
//! under the channel's own lock, and delivers outside every lock.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::{
    connection::{CloseReason, ConnectionHandle, ConnectionId},
    protocol::Role,
};

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

#[derive(Debug, Default)]
struct Channel {
    members: Mutex<Members>,
}

#[derive(Debug, Default)]
struct Members {
    subscribers: HashMap<ConnectionId, ConnectionHandle>,
    // Publishers only keep the channel alive; they are never fanned to.
    publishers: HashSet<ConnectionId>,
}

impl Members {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.publishers.is_empty()
    }
}

/// Outcome of a single [`ChannelRegistry::fanout`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

impl Channel {
    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.members().subscribers.values().cloned().collect()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Channel>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Channel>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `connection` to `channel`, creating the channel on first use.
    /// Registering the same connection again is a no-op.
    pub fn register(&self, channel: &str, connection: &ConnectionHandle, role: Role) {
        let mut channels = self.write();
        let entry = channels.entry(channel.to_owned()).or_default();
        let mut members = entry.members();

        let id = connection.id();
        match role {
            Role::Subscriber => {
                members
                    .subscribers
                    .entry(id)
                    .or_insert_with(|| connection.clone());
            }
            Role::Publisher => {
                members.publishers.insert(id);
            }
        }
        trace!(conn = %id, channel, %role, "registered");
    }

    /// Removes `connection` from `channel`; absent connections are ignored.
    /// The channel is dropped once it has no members left.
    pub fn unregister(&self, channel: &str, connection: ConnectionId) -> bool {
        let mut channels = self.write();
        let Some(entry) = channels.get(channel) else {
            return false;
        };

        let (removed, now_empty) = {
            let mut members = entry.members();
            let removed_subscriber = members.subscribers.remove(&connection).is_some();
            let removed_publisher = members.publishers.remove(&connection);
            (removed_subscriber || removed_publisher, members.is_empty())
        };

        if now_empty {
            channels.remove(channel);
            trace!(channel, "channel dropped");
        }
        removed
    }

    /// Delivers `payload` once to every subscriber registered when the
    /// snapshot is taken. A subscriber that cannot accept it is closed; the
    /// rest still receive it.
    pub fn fanout(&self, channel: &str, payload: &Message) -> FanoutReport {
        let Some(entry) = self.read().get(channel).cloned() else {
            return FanoutReport::default();
        };

        let mut report = FanoutReport::default();
        for subscriber in entry.snapshot() {
            match subscriber.send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(conn = %subscriber.id(), channel, error = %err, "dropping subscriber");
                    subscriber.close(CloseReason::Overloaded);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.read().contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.read().len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.read()
            .get(channel)
            .map_or(0, |entry| entry.members().subscribers.len())
    }

    pub fn publisher_count(&self, channel: &str) -> usize {
        self.read()
            .get(channel)
            .map_or(0, |entry| entry.members().publishers.len())
    }
}
