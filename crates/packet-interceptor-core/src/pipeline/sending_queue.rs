//! Order-restoring sending queue.
//!
//! Every packet entering the async pipeline takes a slot keyed by its sending
//! index. Slots are released strictly in index order: an unfinished slot at the
//! head holds back every later one until it is processed, cancelled, dropped or
//! expires. Timeout handlers see an expired packet as it entered the pipeline,
//! after the queue lock has been released.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::concurrent::PacketTypeMultiMap;
use crate::config::QueueFullPolicy;
use crate::connection::Connection;
use crate::dispatch::{guard, ErrorReport, ErrorReporter, PIPELINE_OWNER};
use crate::error::{InterceptError, Result};
use crate::event::PacketEvent;
use crate::listener::ListenerHandle;
use crate::metrics::{DropReason, PipelineMetrics};
use crate::protocol::{Packet, PacketType};

enum SlotState {
    Pending,
    Processed(Packet),
    Dropped(DropReason),
}

struct Slot {
    state: SlotState,
    /// The packet as it entered the pipeline.
    original: Packet,
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct QueueState {
    slots: BTreeMap<u64, Slot>,
    closed: bool,
}

/// Sending queue of one connection and direction.
pub(crate) struct SendingQueue {
    connection: Arc<dyn Connection>,
    state: Mutex<QueueState>,
    capacity: Arc<Semaphore>,
    capacity_limit: usize,
    timeout_handlers: Arc<PacketTypeMultiMap<ListenerHandle>>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<PipelineMetrics>,
}

impl SendingQueue {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        capacity: usize,
        timeout_handlers: Arc<PacketTypeMultiMap<ListenerHandle>>,
        reporter: Arc<dyn ErrorReporter>,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            state: Mutex::new(QueueState::default()),
            capacity: Arc::new(Semaphore::new(capacity)),
            capacity_limit: capacity,
            timeout_handlers,
            reporter,
            metrics,
        })
    }

    /// Reserve room for one more in-flight packet.
    ///
    /// # Errors
    ///
    /// `QueueFull` under the drop policy when the queue is at capacity, and
    /// `Shutdown` once the queue has been closed.
    pub(crate) async fn reserve(&self, policy: QueueFullPolicy) -> Result<OwnedSemaphorePermit> {
        match policy {
            QueueFullPolicy::Drop => match Arc::clone(&self.capacity).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(InterceptError::QueueFull {
                    queue: "sending",
                    capacity: self.capacity_limit,
                }),
                Err(TryAcquireError::Closed) => Err(InterceptError::Shutdown),
            },
            QueueFullPolicy::Block => Arc::clone(&self.capacity)
                .acquire_owned()
                .await
                .map_err(|_| InterceptError::Shutdown),
        }
    }

    /// Allocate the next sending index and append a pending slot for it.
    ///
    /// The index is drawn while the queue is locked, so slots are always
    /// appended in index order.
    pub(crate) fn insert(
        self: &Arc<Self>,
        next_index: &AtomicU64,
        original: Packet,
        deadline: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Result<SlotTicket> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(InterceptError::Shutdown);
        }

        let index = next_index.fetch_add(1, Ordering::SeqCst);
        let packet_type = original.packet_type();
        state.slots.insert(
            index,
            Slot {
                state: SlotState::Pending,
                original,
                deadline,
                _permit: permit,
            },
        );
        self.metrics.inc_in_flight();
        trace!(sending_index = index, packet_type = %packet_type, "slot allocated");

        Ok(SlotTicket {
            queue: Arc::clone(self),
            index,
            drop_reason: DropReason::ListenerRemoved,
            settled: false,
        })
    }

    /// Record the outcome of a slot and release whatever is ready.
    fn settle(&self, index: u64, outcome: SlotState) {
        let expired = {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(&index) {
                if matches!(slot.state, SlotState::Pending) {
                    slot.state = outcome;
                }
            } else {
                trace!(sending_index = index, "slot already released");
            }
            self.drain_locked(&mut state)
        };
        self.expire(expired);
    }

    /// Release finished and expired slots from the head of the queue.
    pub(crate) fn drain(&self) {
        let expired = self.drain_locked(&mut self.state.lock());
        self.expire(expired);
    }

    /// Transmit or discard ready head slots. Expired packets are returned
    /// so they can be handled once the lock is gone.
    fn drain_locked(&self, state: &mut QueueState) -> Vec<(u64, Packet)> {
        let now = Instant::now();
        let mut released = 0;
        let mut expired = Vec::new();

        while let Some(entry) = state.slots.first_entry() {
            let head = entry.get();
            if matches!(head.state, SlotState::Pending) && head.deadline > now {
                break;
            }

            let index = *entry.key();
            let Slot {
                state: outcome,
                original,
                _permit: permit,
                ..
            } = entry.remove();
            drop(permit);
            released += 1;

            match outcome {
                SlotState::Processed(packet) => self.transmit(index, packet),
                SlotState::Dropped(DropReason::Timeout) | SlotState::Pending => {
                    expired.push((index, original));
                }
                SlotState::Dropped(reason) => {
                    debug!(
                        sending_index = index,
                        packet_type = %original.packet_type(),
                        reason = reason.as_str(),
                        "packet dropped"
                    );
                    self.metrics.record_drop(reason);
                }
            }
        }

        if released > 0 {
            self.metrics.sub_in_flight(released);
        }
        expired
    }

    fn transmit(&self, index: u64, packet: Packet) {
        trace!(sending_index = index, packet_type = %packet.packet_type(), "transmitting packet");
        let packet_type = packet.packet_type();
        match self.connection.transmit(packet) {
            Ok(()) => self.metrics.record_transmit(),
            Err(e) => {
                debug!(sending_index = index, packet_type = %packet_type, error = %e, "transmit failed");
                self.metrics.record_failure(PIPELINE_OWNER, "connection");
                self.reporter.report(ErrorReport::new(
                    PIPELINE_OWNER,
                    "transmit",
                    InterceptError::Connection(e),
                ));
            }
        }
    }

    fn expire(&self, expired: Vec<(u64, Packet)>) {
        for (index, packet) in expired {
            let packet_type = packet.packet_type();
            debug!(sending_index = index, packet_type = %packet_type, "packet timed out");
            self.notify_timeout(index, packet);
            self.report_timeout(index, packet_type);
        }
    }

    /// Run the timeout handlers of the packet's type. The packet is dropped
    /// whatever they do to the event.
    fn notify_timeout(&self, index: u64, packet: Packet) {
        let handlers = self.timeout_handlers.snapshot(&packet.packet_type());
        if handlers.is_empty() {
            return;
        }

        let mut event = PacketEvent::new(packet, Arc::clone(&self.connection), index);
        for handler in handlers.iter() {
            event.set_read_only(handler.priority().is_monitor());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.listener().on_packet(&mut event)));
            event.set_read_only(false);

            let settled = guard::settle(
                outcome,
                &mut event,
                handler,
                "on_timeout",
                self.reporter.as_ref(),
                &self.metrics,
            );
            // No chain to stop; fatal errors are reported like any other.
            if let Err(e) = settled {
                self.metrics.record_failure(handler.owner(), e.kind());
                self.reporter
                    .report(ErrorReport::new(handler.owner(), "on_timeout", e).with_packet(event.packet()));
            }
        }
    }

    fn report_timeout(&self, index: u64, packet_type: PacketType) {
        self.metrics.record_drop(DropReason::Timeout);
        self.metrics.record_failure(PIPELINE_OWNER, "intercept");
        self.reporter.report(ErrorReport::new(
            PIPELINE_OWNER,
            "timeout",
            InterceptError::TimedOut {
                packet_type,
                sending_index: index,
            },
        ));
    }

    /// Discard every slot and refuse new ones.
    pub(crate) fn close(&self, reason: DropReason) {
        let mut state = self.state.lock();
        state.closed = true;
        self.capacity.close();

        let discarded = std::mem::take(&mut state.slots);
        if discarded.is_empty() {
            return;
        }

        debug!(
            count = discarded.len(),
            reason = reason.as_str(),
            "sending queue closed with packets in flight"
        );
        for _ in 0..discarded.len() {
            self.metrics.record_drop(reason);
        }
        self.metrics.sub_in_flight(discarded.len());
    }

    /// Packets currently held.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().slots.len()
    }
}

impl fmt::Debug for SendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendingQueue")
            .field("connection", &self.connection.id())
            .field("capacity", &self.capacity_limit)
            .finish_non_exhaustive()
    }
}

/// Claim on one sending queue slot.
///
/// A ticket travels with its packet through the listener chain. If it is
/// dropped without being completed, the slot is marked dropped so it can never
/// hold back later packets.
pub struct SlotTicket {
    queue: Arc<SendingQueue>,
    index: u64,
    drop_reason: DropReason,
    settled: bool,
}

impl SlotTicket {
    #[must_use]
    pub fn sending_index(&self) -> u64 {
        self.index
    }

    /// Reason recorded if this ticket is dropped unsettled.
    pub(crate) fn set_drop_reason(&mut self, reason: DropReason) {
        self.drop_reason = reason;
    }

    /// Mark the packet fully processed and eligible for transmission.
    pub(crate) fn complete(mut self, packet: Packet) {
        self.settled = true;
        self.queue.settle(self.index, SlotState::Processed(packet));
    }

    /// Mark the packet cancelled; it is released silently.
    pub(crate) fn cancel(mut self) {
        self.settled = true;
        self.queue
            .settle(self.index, SlotState::Dropped(DropReason::Cancelled));
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.queue
                .settle(self.index, SlotState::Dropped(self.drop_reason));
        }
    }
}

impl fmt::Debug for SlotTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTicket")
            .field("index", &self.index)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}
