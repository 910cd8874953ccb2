//! Transport collaborator.
//!
//! The pipeline never performs I/O itself. Packets that survive interception
//! are handed back to a [`Connection`], whose own send queue absorbs any
//! backpressure.

use std::fmt;

use crate::error::ConnectionError;
use crate::protocol::Packet;

/// Identity of one client/server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One client/server transport endpoint.
///
/// Both methods are called while the sending queue is locked and must not
/// block.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Deliver a server-sent packet to the client.
    fn send(&self, packet: Packet) -> Result<(), ConnectionError>;

    /// Deliver a client-sent packet to the server as if it had just been read.
    fn receive(&self, packet: Packet) -> Result<(), ConnectionError>;

    /// Route a packet by the direction it travels in.
    fn transmit(&self, packet: Packet) -> Result<(), ConnectionError> {
        if packet.packet_type().is_server() {
            self.send(packet)
        } else {
            self.receive(packet)
        }
    }
}
