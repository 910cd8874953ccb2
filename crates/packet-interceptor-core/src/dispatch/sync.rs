//! Synchronous dispatcher.
//!
//! Runs the synchronous listeners of a packet type, in priority order, on the
//! calling thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::concurrent::PacketTypeMultiMap;
use crate::error::ListenerResult;
use crate::event::PacketEvent;
use crate::listener::{ListenerHandle, ListenerPriority, RegisteredListener};
use crate::metrics::PipelineMetrics;

use super::guard;
use super::ErrorReporter;

/// Invokes synchronous listeners for packet events.
pub struct SyncDispatcher {
    listeners: Arc<PacketTypeMultiMap<ListenerHandle>>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<PipelineMetrics>,
}

impl SyncDispatcher {
    pub fn new(
        listeners: Arc<PacketTypeMultiMap<ListenerHandle>>,
        reporter: Arc<dyn ErrorReporter>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            listeners,
            reporter,
            metrics,
        }
    }

    /// Dispatch `event` to every interested listener.
    ///
    /// With `priority` set, only listeners registered at exactly that priority
    /// run. Cancelled events are only shown to listeners that asked for them.
    /// A bundle is dispatched as a whole first; if it survives, each
    /// sub-packet is dispatched on its own and the cancelled ones are left out
    /// of the reassembled bundle. A bundle that loses every sub-packet is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Only [`ListenerError::Fatal`](crate::error::ListenerError::Fatal) is
    /// returned; every other listener failure is reported and skipped.
    pub fn invoke(&self, event: &mut PacketEvent, priority: Option<ListenerPriority>) -> ListenerResult {
        self.invoke_listeners(event, priority)?;

        if event.packet().is_bundle() && !event.is_cancelled() {
            self.invoke_bundle(event, priority)?;
        }
        Ok(())
    }

    fn invoke_listeners(&self, event: &mut PacketEvent, priority: Option<ListenerPriority>) -> ListenerResult {
        for listener in self.listeners.get(&event.packet_type()) {
            if priority.is_some_and(|p| p != listener.priority()) {
                continue;
            }
            if !listener.accepts(event) {
                trace!(
                    owner = %listener.owner(),
                    packet_type = %event.packet_type(),
                    "skipping listener"
                );
                continue;
            }
            self.call(&listener, event)?;
        }
        Ok(())
    }

    fn call(&self, listener: &RegisteredListener, event: &mut PacketEvent) -> ListenerResult {
        event.set_read_only(listener.priority().is_monitor());

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.listener().on_packet(event)));
        self.metrics
            .record_duration(listener.owner(), started.elapsed().as_secs_f64());

        event.set_read_only(false);
        guard::settle(
            outcome,
            event,
            listener,
            "on_packet",
            self.reporter.as_ref(),
            &self.metrics,
        )
    }

    fn invoke_bundle(&self, event: &mut PacketEvent, priority: Option<ListenerPriority>) -> ListenerResult {
        let parts = event.take_bundled();
        let total = parts.len();
        let mut kept = Vec::with_capacity(total);

        for part in parts {
            let mut child = event.unbundled(part);
            self.invoke(&mut child, priority)?;
            if !child.is_cancelled() {
                kept.push(child.into_packet());
            }
        }

        if kept.is_empty() {
            debug!(
                packet_type = %event.packet_type(),
                sub_packets = total,
                "every bundled packet was cancelled; cancelling bundle"
            );
            event.force_cancel();
        }
        event.restore_bundled(kept);
        Ok(())
    }
}
