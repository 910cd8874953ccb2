//! Packet type registry.
//!
//! Maps packet types to the payload class (shape) that carries them and to the
//! codec able to encode or decode that shape. The registry is populated once at
//! startup and is read-only afterwards, so it is shared as `Arc<PacketRegistry>`.
//!
//! # Usage
//!
//! ```
//! use packet_interceptor_core::protocol::{PacketRegistry, PacketType, Protocol, Sender};
//!
//! let chat = PacketType::new(Protocol::Play, Sender::Server, 0x0f);
//!
//! let mut registry = PacketRegistry::new();
//! registry.register(chat, "ChatMessage");
//!
//! assert_eq!(registry.lookup_class("ChatMessage").unwrap(), chat);
//! assert!(registry.is_known(&chat));
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{InterceptError, Result};

use super::{Packet, PacketType, Payload, Protocol, Sender};

/// Describes one field of a packet shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub type_name: &'static str,
}

/// Encode/decode collaborator for one packet shape.
///
/// The pipeline treats payloads as opaque; implementations of this trait are the
/// only place that understands a packet's wire representation.
pub trait PacketCodec: Send + Sync {
    /// Decode a body into a packet of `packet_type`.
    fn decode(&self, packet_type: PacketType, body: Bytes) -> Result<Packet>;

    /// Encode a packet back into its body.
    fn encode(&self, packet: &Packet) -> Result<Bytes>;

    /// Fields exposed by this shape.
    fn fields(&self) -> &[FieldDescriptor] {
        &[]
    }
}

/// Codec that keeps the body as raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl PacketCodec for RawCodec {
    fn decode(&self, packet_type: PacketType, body: Bytes) -> Result<Packet> {
        Ok(Packet::new(packet_type, body))
    }

    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        match packet.payload() {
            Payload::Data(body) => Ok(body.clone()),
            Payload::Bundle(_) => Err(InterceptError::Codec {
                packet_type: packet.packet_type(),
                message: "bundles have no flat encoding".to_string(),
            }),
        }
    }
}

/// A registered packet shape.
#[derive(Clone)]
struct PacketShape {
    class: String,
    codec: Arc<dyn PacketCodec>,
}

impl fmt::Debug for PacketShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketShape")
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// Bidirectional mapping between packet types and payload classes.
#[derive(Debug, Default)]
pub struct PacketRegistry {
    by_type: HashMap<PacketType, PacketShape>,
    by_class: HashMap<String, PacketType>,
    by_id: HashMap<(Protocol, Sender, i32), PacketType>,
}

impl PacketRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a packet type whose body is kept as raw bytes.
    pub fn register(&mut self, packet_type: PacketType, class: impl Into<String>) {
        self.register_with_codec(packet_type, class, Arc::new(RawCodec));
    }

    /// Register a packet type together with its codec.
    ///
    /// Registering the same type again replaces the previous binding.
    pub fn register_with_codec(
        &mut self,
        packet_type: PacketType,
        class: impl Into<String>,
        codec: Arc<dyn PacketCodec>,
    ) {
        let class = class.into();
        if let Some(previous) = self.by_type.get(&packet_type) {
            // The class may have been rebound to another type since.
            if self.by_class.get(&previous.class) == Some(&packet_type) {
                self.by_class.remove(&previous.class);
            }
        }
        self.by_class.insert(class.clone(), packet_type);
        self.by_id.insert(
            (packet_type.protocol, packet_type.sender, packet_type.id),
            packet_type,
        );
        self.by_type.insert(packet_type, PacketShape { class, codec });
    }

    /// Resolve the packet type bound to a payload class.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPacketClass` if the class was never registered.
    pub fn lookup_class(&self, class: &str) -> Result<PacketType> {
        self.by_class
            .get(class)
            .copied()
            .ok_or_else(|| InterceptError::UnknownPacketClass(class.to_string()))
    }

    /// Resolve a packet type by protocol phase, sender and numeric id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPacketType` if no such type was registered.
    pub fn lookup(&self, protocol: Protocol, sender: Sender, id: i32) -> Result<PacketType> {
        self.by_id
            .get(&(protocol, sender, id))
            .copied()
            .ok_or(InterceptError::UnknownPacketType {
                protocol,
                sender,
                id,
            })
    }

    /// The payload class bound to a packet type.
    #[must_use]
    pub fn class_of(&self, packet_type: &PacketType) -> Option<&str> {
        self.by_type.get(packet_type).map(|shape| shape.class.as_str())
    }

    /// The codec bound to a packet type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownPacketType` if the type was never registered.
    pub fn codec(&self, packet_type: &PacketType) -> Result<Arc<dyn PacketCodec>> {
        self.by_type
            .get(packet_type)
            .map(|shape| Arc::clone(&shape.codec))
            .ok_or(InterceptError::UnknownPacketType {
                protocol: packet_type.protocol,
                sender: packet_type.sender,
                id: packet_type.id,
            })
    }

    /// Decode a body received for `(protocol, sender, id)`.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownPacketType` for unregistered ids, or with the codec's
    /// own error.
    pub fn decode(&self, protocol: Protocol, sender: Sender, id: i32, body: Bytes) -> Result<Packet> {
        let packet_type = self.lookup(protocol, sender, id)?;
        self.codec(&packet_type)?.decode(packet_type, body)
    }

    /// Whether the packet type has been registered.
    #[must_use]
    pub fn is_known(&self, packet_type: &PacketType) -> bool {
        self.by_type.contains_key(packet_type)
    }

    /// All registered types sent by `sender`, in a stable order.
    #[must_use]
    pub fn packet_types(&self, sender: Sender) -> BTreeSet<PacketType> {
        self.by_type
            .keys()
            .filter(|packet_type| packet_type.sender == sender)
            .copied()
            .collect()
    }

    /// Number of registered packet types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
