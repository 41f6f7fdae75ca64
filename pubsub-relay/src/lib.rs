//! WebSocket publish/subscribe relay.
//!
//! Clients connect over WebSocket and classify themselves with their first
//! message: a role byte (`0x00` publisher, `0x01` subscriber) followed by a
//! UTF-8 channel name. Every data message a publisher sends afterwards is
//! copied to each subscriber of that channel. The broker advertises its
//! liveness base to every client, pings on that interval, and evicts
//! connections that stay silent for longer than base plus a margin.
//!
//! - [`cli`] parses the command-line interface for the broker and the example
//!   clients.
//! - [`config`] holds the broker's runtime settings.
//! - [`broker`] accepts TCP connections and owns shutdown.
//! - [`session`] drives one connection from upgrade to teardown.
//! - [`protocol`] defines the handshake and liveness-parameter encodings.
//! - [`registry`] maps channel names to members and performs fan-out.
//! - [`connection`] is the send/close handle other components use to reach a
//!   connection, plus its writer task.
//! - [`liveness`] is the per-connection probe and eviction timer.
//! - [`client`] implements the `publish` and `subscribe` commands.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod protocol;
pub mod registry;
mod session;
