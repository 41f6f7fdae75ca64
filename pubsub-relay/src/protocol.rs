//! Wire format shared by the broker and the example clients.
//!
//! Revision 2 (the default): the first message on a connection is one role
//! byte followed by the UTF-8 channel name, and the broker answers with the
//! base liveness duration as an 8-byte little-endian millisecond count.
//!
//! Revision 1: the role and channel come from the upgrade path
//! (`/<channel>/pub` or `/<channel>/sub`) and the broker answers with the
//! duration as a lowercase hex text frame.

use std::{fmt, time::Duration};

use tokio_tungstenite::tungstenite::Message;

use crate::error::HandshakeError;

pub const PUBLISHER_DISCRIMINATOR: u8 = 0x00;
pub const SUBSCRIBER_DISCRIMINATOR: u8 = 0x01;

const PUBLISH_SUFFIX: &str = "/pub";
const SUBSCRIBE_SUFFIX: &str = "/sub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            PUBLISHER_DISCRIMINATOR => Some(Role::Publisher),
            SUBSCRIBER_DISCRIMINATOR => Some(Role::Subscriber),
            _ => None,
        }
    }

    pub fn discriminator(self) -> u8 {
        match self {
            Role::Publisher => PUBLISHER_DISCRIMINATOR,
            Role::Subscriber => SUBSCRIBER_DISCRIMINATOR,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Role and channel fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub role: Role,
    pub channel: String,
}

impl Handshake {
    pub fn new(role: Role, channel: impl Into<String>) -> Self {
        Self {
            role,
            channel: channel.into(),
        }
    }

    /// Decodes a revision-2 handshake: role byte, then the channel name as the
    /// rest of the message.
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let (&discriminator, name) = bytes.split_first().ok_or(HandshakeError::Empty)?;
        let role =
            Role::from_discriminator(discriminator).ok_or(HandshakeError::UnknownRole(discriminator))?;
        if name.is_empty() {
            return Err(HandshakeError::MissingChannel);
        }
        let channel = std::str::from_utf8(name).map_err(HandshakeError::InvalidChannelName)?;

        Ok(Self::new(role, channel))
    }

    /// Classifies the first message read from a connection.
    pub fn from_message(message: &Message) -> Result<Self, HandshakeError> {
        match message {
            Message::Binary(data) => Self::parse(data),
            Message::Text(text) => Self::parse(text.as_bytes()),
            Message::Ping(_) => Err(HandshakeError::UnexpectedFrame("ping")),
            Message::Pong(_) => Err(HandshakeError::UnexpectedFrame("pong")),
            Message::Close(_) => Err(HandshakeError::Closed),
            Message::Frame(_) => Err(HandshakeError::UnexpectedFrame("raw frame")),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.channel.len());
        bytes.push(self.role.discriminator());
        bytes.extend_from_slice(self.channel.as_bytes());
        bytes
    }

    pub fn to_message(&self) -> Message {
        Message::binary(self.encode())
    }
}

/// How the upgrade request path classifies a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Role and channel arrive in the first message.
    FirstMessage,
    /// Role and channel were taken from the path; no handshake message follows.
    Direct(Handshake),
    /// Path names a role but not a usable channel.
    NotFound,
}

pub fn parse_route(path: &str) -> Route {
    let (prefix, role) = if let Some(prefix) = path.strip_suffix(PUBLISH_SUFFIX) {
        (prefix, Role::Publisher)
    } else if let Some(prefix) = path.strip_suffix(SUBSCRIBE_SUFFIX) {
        (prefix, Role::Subscriber)
    } else {
        return Route::FirstMessage;
    };

    match prefix.strip_prefix('/') {
        Some(channel) if !channel.is_empty() && !channel.contains('/') => {
            Route::Direct(Handshake::new(role, channel))
        }
        _ => Route::NotFound,
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn encode_ping_duration(duration: Duration) -> [u8; 8] {
    duration_millis(duration).to_le_bytes()
}

/// Parses the broker's revision-2 liveness parameter; `None` unless exactly 8 bytes.
pub fn decode_ping_duration(bytes: &[u8]) -> Option<Duration> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(Duration::from_millis(u64::from_le_bytes(bytes)))
}

pub fn encode_ping_duration_hex(duration: Duration) -> String {
    format!("{:x}", duration_millis(duration))
}

/// Builds the liveness parameter message in the format the route expects.
pub fn ping_duration_message(duration: Duration, path_routed: bool) -> Message {
    if path_routed {
        Message::text(encode_ping_duration_hex(duration))
    } else {
        Message::binary(encode_ping_duration(duration).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_role_discriminators() {
        let publisher = Handshake::parse(b"\x00room").expect("publisher handshake");
        assert_eq!(publisher, Handshake::new(Role::Publisher, "room"));

        let subscriber = Handshake::parse(b"\x01room").expect("subscriber handshake");
        assert_eq!(subscriber, Handshake::new(Role::Subscriber, "room"));
    }

    #[test]
    fn rejects_malformed_handshakes() {
        assert!(matches!(Handshake::parse(b""), Err(HandshakeError::Empty)));
        assert!(matches!(
            Handshake::parse(b"\x01"),
            Err(HandshakeError::MissingChannel)
        ));
        assert!(matches!(
            Handshake::parse(b"\x02x"),
            Err(HandshakeError::UnknownRole(0x02))
        ));
        assert!(matches!(
            Handshake::parse(&[0x01, 0xff, 0xfe]),
            Err(HandshakeError::InvalidChannelName(_))
        ));
    }

    #[test]
    fn channel_names_are_taken_verbatim() {
        let handshake = Handshake::parse("\u{1}Room/Ünïcode lobby".as_bytes()).expect("handshake");
        assert_eq!(handshake.channel, "Room/Ünïcode lobby");
        assert_eq!(handshake.encode(), "\u{1}Room/Ünïcode lobby".as_bytes());
    }

    #[test]
    fn control_frames_do_not_classify() {
        assert!(matches!(
            Handshake::from_message(&Message::Ping(Default::default())),
            Err(HandshakeError::UnexpectedFrame("ping"))
        ));
        assert!(matches!(
            Handshake::from_message(&Message::Close(None)),
            Err(HandshakeError::Closed)
        ));
        assert_eq!(
            Handshake::from_message(&Message::text("\u{0}news")).expect("text handshake"),
            Handshake::new(Role::Publisher, "news")
        );
    }

    #[test]
    fn ping_duration_is_little_endian_millis() {
        let encoded = encode_ping_duration(Duration::from_secs(30));
        assert_eq!(encoded, [0x30, 0x75, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            decode_ping_duration(&encoded),
            Some(Duration::from_millis(30_000))
        );
        assert_eq!(decode_ping_duration(&encoded[..7]), None);
        assert_eq!(encode_ping_duration_hex(Duration::from_secs(30)), "7530");
    }

    #[test]
    fn routes_by_path_suffix() {
        assert_eq!(parse_route("/"), Route::FirstMessage);
        assert_eq!(parse_route("/room"), Route::FirstMessage);
        assert_eq!(
            parse_route("/room/sub"),
            Route::Direct(Handshake::new(Role::Subscriber, "room"))
        );
        assert_eq!(
            parse_route("/room/pub"),
            Route::Direct(Handshake::new(Role::Publisher, "room"))
        );
        assert_eq!(parse_route("/pub"), Route::NotFound);
        assert_eq!(parse_route("//sub"), Route::NotFound);
        assert_eq!(parse_route("/a/b/sub"), Route::NotFound);
    }
}
