//! Per-traversal packet events.
//!
//! A [`PacketEvent`] is created once per observed packet and threads its state
//! (cancellation, read-only flag, async marker) through both dispatchers.

mod marker;

pub use marker::AsyncMarker;

use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{InterceptError, Result};
use crate::metrics::DropReason;
use crate::pipeline::ProcessingDelay;
use crate::protocol::{Packet, PacketType, Payload, Sender};

/// Mutable record of one packet's trip through the listener chain.
pub struct PacketEvent {
    packet: Packet,
    connection: Arc<dyn Connection>,
    sequence: u64,
    cancelled: bool,
    read_only: bool,
    in_bundle: bool,
    async_marker: Option<AsyncMarker>,
    rejected: Option<InterceptError>,
}

impl PacketEvent {
    /// Create an event for a packet observed on `connection`.
    pub fn new(packet: Packet, connection: Arc<dyn Connection>, sequence: u64) -> Self {
        Self {
            packet,
            connection,
            sequence,
            cancelled: false,
            read_only: false,
            in_bundle: false,
            async_marker: None,
            rejected: None,
        }
    }

    #[must_use]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet.packet_type()
    }

    /// Direction of travel: `Server` for outgoing packets, `Client` for
    /// incoming ones.
    #[must_use]
    pub fn direction(&self) -> Sender {
        self.packet.packet_type().sender
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Ingress sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this packet was unwrapped from a bundle.
    #[must_use]
    pub fn in_bundle(&self) -> bool {
        self.in_bundle
    }

    #[must_use]
    pub fn async_marker(&self) -> Option<&AsyncMarker> {
        self.async_marker.as_ref()
    }

    /// Whether the event is being processed by the async pipeline.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.async_marker.is_some()
    }

    /// Mutable access to the packet.
    ///
    /// # Errors
    ///
    /// `ReadOnlyViolation` while the event is read-only.
    pub fn packet_mut(&mut self) -> Result<&mut Packet> {
        self.ensure_writable("modify packet")?;
        Ok(&mut self.packet)
    }

    /// Replace the packet.
    ///
    /// # Errors
    ///
    /// `ReadOnlyViolation` while the event is read-only, and
    /// `PacketTypeChanged` if the replacement has a different packet type. In
    /// both cases the current packet is kept.
    pub fn set_packet(&mut self, packet: Packet) -> Result<()> {
        self.ensure_writable("replace packet")?;
        let expected = self.packet.packet_type();
        if packet.packet_type() != expected {
            let error = InterceptError::PacketTypeChanged {
                expected,
                actual: packet.packet_type(),
            };
            return Err(self.reject(error));
        }
        self.packet = packet;
        Ok(())
    }

    /// Cancel or un-cancel the packet.
    ///
    /// # Errors
    ///
    /// `ReadOnlyViolation` while the event is read-only.
    pub fn set_cancelled(&mut self, cancelled: bool) -> Result<()> {
        self.ensure_writable("set cancelled")?;
        self.cancelled = cancelled;
        Ok(())
    }

    /// Hold the packet back after the current async listener returns.
    ///
    /// The concurrency permit is released when the callback returns, but the
    /// packet only moves on to the next listener once every handle returned
    /// by this method has been released or dropped. Its sending index is kept,
    /// so packets behind it still wait.
    ///
    /// # Errors
    ///
    /// `NotAsync` if the event is not in the async pipeline.
    pub fn defer(&mut self) -> Result<ProcessingDelay> {
        match self.async_marker.as_ref() {
            Some(marker) => Ok(marker.defer()),
            None => Err(InterceptError::NotAsync {
                packet_type: self.packet.packet_type(),
            }),
        }
    }

    /// Shorthand for `set_cancelled(true)`.
    ///
    /// # Errors
    ///
    /// `ReadOnlyViolation` while the event is read-only.
    pub fn cancel(&mut self) -> Result<()> {
        self.set_cancelled(true)
    }

    fn ensure_writable(&mut self, operation: &'static str) -> Result<()> {
        if self.read_only {
            let error = InterceptError::ReadOnlyViolation {
                operation,
                packet_type: self.packet.packet_type(),
            };
            return Err(self.reject(error));
        }
        Ok(())
    }

    /// Remember the first rejected mutation so it is reported even if the
    /// listener ignores the returned error.
    fn reject(&mut self, error: InterceptError) -> InterceptError {
        self.rejected.get_or_insert_with(|| error.clone());
        error
    }

    pub(crate) fn take_rejected(&mut self) -> Option<InterceptError> {
        self.rejected.take()
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Cancel regardless of the read-only flag.
    pub(crate) fn force_cancel(&mut self) {
        self.cancelled = true;
    }

    pub(crate) fn take_async_marker(&mut self) -> Option<AsyncMarker> {
        self.async_marker.take()
    }

    pub(crate) fn set_async_marker(&mut self, marker: AsyncMarker) {
        self.async_marker = Some(marker);
    }

    /// Reason reported for the sending slot if this event is discarded.
    pub(crate) fn set_drop_reason(&mut self, reason: DropReason) {
        if let Some(marker) = self.async_marker.as_mut() {
            marker.set_drop_reason(reason);
        }
    }

    /// Synthetic event for one sub-packet of this event's bundle.
    pub(crate) fn unbundled(&self, packet: Packet) -> Self {
        Self {
            packet,
            connection: Arc::clone(&self.connection),
            sequence: self.sequence,
            cancelled: false,
            read_only: false,
            in_bundle: true,
            async_marker: None,
            rejected: None,
        }
    }

    /// Take the bundled sub-packets out of the packet, leaving it empty.
    pub(crate) fn take_bundled(&mut self) -> Vec<Packet> {
        match self.packet.payload_mut() {
            Payload::Bundle(packets) => std::mem::take(packets),
            Payload::Data(_) => Vec::new(),
        }
    }

    /// Put reassembled sub-packets back into the bundle.
    pub(crate) fn restore_bundled(&mut self, packets: Vec<Packet>) {
        if let Payload::Bundle(slot) = self.packet.payload_mut() {
            *slot = packets;
        }
    }

    pub(crate) fn into_packet(self) -> Packet {
        self.packet
    }
}

impl fmt::Debug for PacketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketEvent")
            .field("packet_type", &self.packet.packet_type())
            .field("connection", &self.connection.id())
            .field("sequence", &self.sequence)
            .field("cancelled", &self.cancelled)
            .field("read_only", &self.read_only)
            .field("in_bundle", &self.in_bundle)
            .field("async_marker", &self.async_marker)
            .finish_non_exhaustive()
    }
}
