//! Opaque packet values.
//!
//! The pipeline never looks inside a payload. Field-level access is the job of
//! the [`PacketCodec`](super::PacketCodec) registered for the packet's type.

use bytes::Bytes;

use super::PacketType;

/// Packet contents as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Encoded packet body.
    Data(Bytes),
    /// An atomic group of sub-packets delivered together.
    Bundle(Vec<Packet>),
}

/// A unit of protocol data flowing between client and server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    payload: Payload,
    /// Adjustment applied by the transport's byte accounting.
    size_delta: i64,
}

impl Packet {
    /// Create a packet carrying an encoded body.
    pub fn new(packet_type: PacketType, body: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: Payload::Data(body.into()),
            size_delta: 0,
        }
    }

    /// Create a bundle packet wrapping `packets`.
    #[must_use]
    pub fn bundle(packet_type: PacketType, packets: Vec<Packet>) -> Self {
        Self {
            packet_type,
            payload: Payload::Bundle(packets),
            size_delta: 0,
        }
    }

    /// Declare a size adjustment for transport byte accounting.
    ///
    /// A negative delta lets a packet be reported smaller than its body, for
    /// example when its bytes were already accounted for elsewhere.
    #[must_use]
    pub fn with_size_delta(mut self, size_delta: i64) -> Self {
        self.size_delta = size_delta;
        self
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Mutable access to the payload.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// The encoded body, or `None` for bundles.
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Data(body) => Some(body),
            Payload::Bundle(_) => None,
        }
    }

    /// Replace the encoded body. Turns a bundle into a plain packet.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.payload = Payload::Data(body.into());
    }

    #[must_use]
    pub fn is_bundle(&self) -> bool {
        matches!(self.payload, Payload::Bundle(_))
    }

    /// Sub-packets of a bundle; empty for plain packets.
    #[must_use]
    pub fn bundled(&self) -> &[Packet] {
        match &self.payload {
            Payload::Bundle(packets) => packets,
            Payload::Data(_) => &[],
        }
    }

    #[must_use]
    pub fn size_delta(&self) -> i64 {
        self.size_delta
    }

    /// Size reported to the transport: body length plus the declared delta,
    /// never below zero.
    #[must_use]
    pub fn accounted_size(&self) -> u64 {
        let raw = match &self.payload {
            Payload::Data(body) => i64::try_from(body.len()).unwrap_or(i64::MAX),
            Payload::Bundle(packets) => packets.iter().fold(0i64, |total, p| {
                total.saturating_add(i64::try_from(p.accounted_size()).unwrap_or(i64::MAX))
            }),
        };
        u64::try_from(raw.saturating_add(self.size_delta)).unwrap_or(0)
    }
}
