//! Packet model shared by every pipeline component.
//!
//! This module provides:
//! - [`PacketType`] identifiers (protocol phase, sender, numeric id)
//! - [`Packet`] values with opaque payloads and bundle support
//! - [`PacketRegistry`] binding types to payload classes and codecs

mod packet;
mod packet_type;
mod registry;

pub use packet::{Packet, Payload};
pub use packet_type::{PacketType, Protocol, Sender};
pub use registry::{FieldDescriptor, PacketCodec, PacketRegistry, RawCodec};
