//! Async marker.

use std::time::Instant;

use crate::concurrent::Snapshot;
use crate::listener::ListenerHandle;
use crate::metrics::DropReason;
use crate::pipeline::{DelaySource, ProcessingDelay, SlotTicket};

/// Async-pipeline state carried by a [`PacketEvent`](super::PacketEvent).
///
/// Created when a packet first enters the async pipeline and dropped once the
/// packet is transmitted or discarded. The sending index it holds never
/// changes and is the only ordering key used for transmission.
#[derive(Debug)]
pub struct AsyncMarker {
    ticket: SlotTicket,
    created_at: Instant,
    deadline: Instant,
    chain: Snapshot<ListenerHandle>,
    cursor: usize,
    delay: DelaySource,
}

impl AsyncMarker {
    pub(crate) fn new(
        ticket: SlotTicket,
        chain: Snapshot<ListenerHandle>,
        deadline: Instant,
        delay: DelaySource,
    ) -> Self {
        Self {
            ticket,
            created_at: Instant::now(),
            deadline,
            chain,
            cursor: 0,
            delay,
        }
    }

    #[must_use]
    pub fn sending_index(&self) -> u64 {
        self.ticket.sending_index()
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Outstanding processing delays; the packet waits while this is non-zero.
    #[must_use]
    pub fn processing_delay(&self) -> usize {
        self.delay.pending()
    }

    pub(crate) fn defer(&self) -> ProcessingDelay {
        self.delay.defer(self.sending_index())
    }

    pub(crate) fn delay_source(&self) -> &DelaySource {
        &self.delay
    }

    /// Position of the next listener to consider in the chain.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Async listeners interested in this packet, captured at ingress.
    #[must_use]
    pub fn chain(&self) -> &[ListenerHandle] {
        &self.chain
    }

    /// Move the cursor past the next listener accepted by `accepts` and
    /// return it, or `None` when the chain is exhausted.
    pub(crate) fn advance(
        &mut self,
        mut accepts: impl FnMut(&ListenerHandle) -> bool,
    ) -> Option<ListenerHandle> {
        while let Some(listener) = self.chain.get(self.cursor) {
            self.cursor += 1;
            if accepts(listener) {
                return Some(ListenerHandle::clone(listener));
            }
        }
        None
    }

    pub(crate) fn set_drop_reason(&mut self, reason: DropReason) {
        self.ticket.set_drop_reason(reason);
    }

    pub(crate) fn into_ticket(self) -> SlotTicket {
        self.ticket
    }
}
