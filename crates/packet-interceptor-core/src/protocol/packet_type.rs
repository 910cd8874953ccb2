//! Packet type identifiers.
//!
//! A [`PacketType`] classifies a packet by the protocol phase it belongs to,
//! the side that sends it, and its numeric id within that phase.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol phase a connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Handshaking,
    Status,
    Login,
    Configuration,
    Play,
}

/// The side of the connection that emits a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// Sent by the client, received by the server.
    Client,
    /// Sent by the server towards the client.
    Server,
}

impl Sender {
    /// Whether packets from this side travel server to client.
    #[must_use]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Immutable packet type identifier.
///
/// Equality and hashing consider the protocol phase, sender and numeric id.
/// The legacy id is carried along for reporting only.
#[derive(Debug, Clone, Copy, Eq, Deserialize, Serialize)]
pub struct PacketType {
    pub protocol: Protocol,
    pub sender: Sender,
    pub id: i32,
    #[serde(default)]
    pub legacy_id: Option<i32>,
}

impl PacketType {
    /// Create a packet type without a legacy id.
    #[must_use]
    pub const fn new(protocol: Protocol, sender: Sender, id: i32) -> Self {
        Self {
            protocol,
            sender,
            id,
            legacy_id: None,
        }
    }

    /// Attach the legacy numeric id.
    #[must_use]
    pub const fn with_legacy_id(mut self, legacy_id: i32) -> Self {
        self.legacy_id = Some(legacy_id);
        self
    }

    /// Whether this packet travels from server to client.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.sender.is_server()
    }
}

impl PartialEq for PacketType {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.sender == other.sender && self.id == other.id
    }
}

impl Ord for PacketType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.protocol, self.sender, self.id).cmp(&(other.protocol, other.sender, other.id))
    }
}

impl PartialOrd for PacketType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for PacketType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.sender.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{}/{:#04x}",
            self.protocol,
            self.sender.as_str(),
            self.id
        )
    }
}
