//! Processing delays.
//!
//! An async listener may hold a packet back past the end of its callback. The
//! packet keeps its sending index and its sending queue slot, but gives its
//! concurrency permit back; it moves on once every delay is released.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::PipelineShared;

/// Delay counter of one packet in the async pipeline.
#[derive(Clone)]
pub(crate) struct DelaySource {
    pending: Arc<AtomicUsize>,
    pipeline: Weak<PipelineShared>,
}

impl DelaySource {
    pub(crate) fn new(pipeline: Weak<PipelineShared>) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            pipeline,
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn defer(&self, sending_index: u64) -> ProcessingDelay {
        self.pending.fetch_add(1, Ordering::SeqCst);
        ProcessingDelay {
            source: self.clone(),
            sending_index,
        }
    }
}

impl fmt::Debug for DelaySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelaySource")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Claim that keeps a deferred packet from moving down its listener chain.
///
/// Returned by [`PacketEvent::defer`](crate::event::PacketEvent::defer).
/// Releasing or dropping the last claim on a packet hands it to its next
/// listener, or to the sending queue when the chain is done.
#[must_use = "dropping the delay releases the packet immediately"]
pub struct ProcessingDelay {
    source: DelaySource,
    sending_index: u64,
}

impl ProcessingDelay {
    /// Sending index of the packet being held.
    #[must_use]
    pub fn sending_index(&self) -> u64 {
        self.sending_index
    }

    /// Let the packet continue.
    pub fn release(self) {}
}

impl Drop for ProcessingDelay {
    fn drop(&mut self) {
        if self.source.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(pipeline) = self.source.pipeline.upgrade() {
                pipeline.resume(self.sending_index);
            }
        }
    }
}

impl fmt::Debug for ProcessingDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingDelay")
            .field("sending_index", &self.sending_index)
            .field("pending", &self.source.pending())
            .finish()
    }
}
