//! Asynchronous listener pipeline.
//!
//! Packets that have asynchronous listeners are handed to this pipeline after
//! synchronous dispatch. Each packet draws a sending index, takes a slot in the
//! sending queue of its connection and direction, and then travels through its
//! async listener chain one worker at a time. Workers finish out of order; the
//! sending queue puts the packets back in index order before transmission.

mod delay;
mod sending_queue;
mod worker;

pub use delay::ProcessingDelay;
pub use sending_queue::SlotTicket;

pub(crate) use delay::DelaySource;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use crate::concurrent::{PacketTypeMultiMap, Snapshot};
use crate::config::{PipelineConfig, QueueFullPolicy};
use crate::connection::{Connection, ConnectionId};
use crate::dispatch::{ErrorReport, ErrorReporter, PIPELINE_OWNER};
use crate::error::{InterceptError, Result};
use crate::event::{AsyncMarker, PacketEvent};
use crate::listener::{ListenerHandle, ListenerId};
use crate::metrics::{DropReason, PipelineMetrics};
use crate::protocol::Sender;

use self::sending_queue::SendingQueue;

/// Deadline used when the configured timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Callbacks the pipeline uses to reach back into its owner.
#[derive(Default)]
pub struct PipelineHooks {
    /// Listeners told about packets that expire in a sending queue.
    pub timeout_handlers: Arc<PacketTypeMultiMap<ListenerHandle>>,
    /// Called with the id of an async listener whose worker stopped on a
    /// fatal error, after the worker has been removed.
    pub on_listener_failed: Option<Box<dyn Fn(ListenerId) + Send + Sync>>,
}

impl std::fmt::Debug for PipelineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHooks")
            .field("timeout_handlers", &self.timeout_handlers.packet_types().len())
            .field("on_listener_failed", &self.on_listener_failed.is_some())
            .finish()
    }
}

struct WorkerHandle {
    queue: mpsc::Sender<PacketEvent>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared between the pipeline handle, its workers and the sweeper.
///
/// Workers only hold a weak reference, so dropping the last
/// [`AsyncPipeline`] tears everything down.
pub(crate) struct PipelineShared {
    config: PipelineConfig,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<PipelineMetrics>,
    hooks: PipelineHooks,
    runtime: Handle,
    permits: Semaphore,
    shutdown: CancellationToken,
    workers: DashMap<ListenerId, WorkerHandle>,
    sending: DashMap<(ConnectionId, Sender), Arc<SendingQueue>>,
    deferred: DashMap<u64, PacketEvent>,
    next_index: AtomicU64,
}

impl PipelineShared {
    /// Hand `event` to the next async listener in its chain.
    ///
    /// Listeners that no longer accept the event, or that were removed since
    /// the chain was captured, are skipped. Once the chain is exhausted the
    /// packet's slot is completed, or cancelled if a listener cancelled it.
    ///
    /// Returns `false` if the packet was dropped because the next listener's
    /// queue was full.
    async fn forward(&self, mut event: PacketEvent) -> bool {
        loop {
            let Some(mut marker) = event.take_async_marker() else {
                debug!(packet_type = %event.packet_type(), "event without async marker reached the pipeline");
                return true;
            };

            let next = marker.advance(|listener| {
                listener.accepts(&event) && self.workers.contains_key(&listener.id())
            });
            let Some(listener) = next else {
                let ticket = marker.into_ticket();
                if event.is_cancelled() {
                    ticket.cancel();
                } else {
                    ticket.complete(event.into_packet());
                }
                return true;
            };
            event.set_async_marker(marker);

            let Some(queue) = self
                .workers
                .get(&listener.id())
                .map(|worker| worker.queue.clone())
            else {
                continue;
            };

            match self.config.queue_full_policy {
                QueueFullPolicy::Drop => match queue.try_send(event) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(mut rejected)) => {
                        self.report_full(&listener, &rejected);
                        rejected.set_drop_reason(DropReason::QueueFull);
                        return false;
                    }
                    Err(TrySendError::Closed(returned)) => event = returned,
                },
                QueueFullPolicy::Block => match queue.send(event).await {
                    Ok(()) => return true,
                    Err(SendError(returned)) => event = returned,
                },
            }
            trace!(listener = %listener.id(), "listener queue closed, skipping");
        }
    }

    /// Forward `event` unless a listener deferred it, in which case it is
    /// parked until its last delay is released.
    async fn forward_or_hold(self: &Arc<Self>, event: PacketEvent) {
        let held = event
            .async_marker()
            .filter(|marker| marker.processing_delay() > 0)
            .map(|marker| (marker.sending_index(), marker.delay_source().clone()));
        let Some((index, delay)) = held else {
            self.forward(event).await;
            return;
        };

        trace!(sending_index = index, pending = delay.pending(), "packet deferred");
        self.deferred.insert(index, event);
        // The last release may have landed before the insert.
        if delay.pending() == 0 {
            self.resume(index);
        }
    }

    /// Send a parked packet on. Whoever removes it from `deferred` forwards it.
    fn resume(self: &Arc<Self>, sending_index: u64) {
        let Some((_, mut event)) = self.deferred.remove(&sending_index) else {
            return;
        };
        if self.shutdown.is_cancelled() {
            event.set_drop_reason(DropReason::Shutdown);
            return;
        }

        trace!(sending_index, "deferred packet released");
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            shared.forward(event).await;
        });
    }

    /// Drop every parked packet matching `discard` with `reason`.
    fn discard_deferred(&self, reason: DropReason, mut discard: impl FnMut(&PacketEvent) -> bool) {
        self.deferred.retain(|_, event| {
            if discard(event) {
                event.set_drop_reason(reason);
                false
            } else {
                true
            }
        });
    }

    fn report_full(&self, listener: &ListenerHandle, event: &PacketEvent) {
        debug!(
            listener = %listener.id(),
            owner = %listener.owner(),
            packet_type = %event.packet_type(),
            "listener queue full, dropping packet"
        );
        let error = InterceptError::QueueFull {
            queue: "listener",
            capacity: self.config.listener_queue_capacity,
        };
        self.metrics.record_failure(listener.owner(), "intercept");
        self.reporter
            .report(ErrorReport::new(listener.owner(), "enqueue", error).with_packet(event.packet()));
    }

    fn sending_queue(&self, connection: &Arc<dyn Connection>, direction: Sender) -> Arc<SendingQueue> {
        let entry = self
            .sending
            .entry((connection.id(), direction))
            .or_insert_with(|| {
                SendingQueue::new(
                    Arc::clone(connection),
                    self.config.sending_queue_capacity,
                    Arc::clone(&self.hooks.timeout_handlers),
                    Arc::clone(&self.reporter),
                    Arc::clone(&self.metrics),
                )
            });
        Arc::clone(entry.value())
    }

    /// Release expired heads of every sending queue and forget parked
    /// packets that ran out of time.
    fn sweep(&self) {
        let queues: Vec<_> = self.sending.iter().map(|entry| Arc::clone(entry.value())).collect();
        for queue in queues {
            queue.drain();
        }
        self.discard_deferred(DropReason::Timeout, |event| {
            event.async_marker().is_some_and(AsyncMarker::is_expired)
        });
    }
}

impl Drop for PipelineShared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodically drain sending queues so an expired head is dropped even when
/// no other packet settles behind it.
async fn sweep_loop(shared: Weak<PipelineShared>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.sweep();
            }
        }
    }
    trace!("sweeper stopped");
}

/// Handle to the asynchronous pipeline.
pub struct AsyncPipeline {
    shared: Arc<PipelineShared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncPipeline {
    /// Create a pipeline whose workers run on `runtime`.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        reporter: Arc<dyn ErrorReporter>,
        metrics: Arc<PipelineMetrics>,
        hooks: PipelineHooks,
        runtime: Handle,
    ) -> Self {
        let shared = Arc::new(PipelineShared {
            permits: Semaphore::new(config.max_concurrency),
            config,
            reporter,
            metrics,
            hooks,
            runtime,
            shutdown: CancellationToken::new(),
            workers: DashMap::new(),
            sending: DashMap::new(),
            deferred: DashMap::new(),
            next_index: AtomicU64::new(1),
        });

        let sweeper = shared.runtime.spawn(sweep_loop(
            Arc::downgrade(&shared),
            shared.config.sweep_interval(),
            shared.shutdown.clone(),
        ));

        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Start a worker for an asynchronous listener.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` once the pipeline has been shut down.
    pub fn add_listener(&self, listener: ListenerHandle) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(InterceptError::Shutdown);
        }

        let (queue, receiver) = mpsc::channel(self.shared.config.listener_queue_capacity);
        let token = self.shared.shutdown.child_token();
        let task = self.shared.runtime.spawn(worker::run(
            Arc::downgrade(&self.shared),
            Arc::clone(&listener),
            receiver,
            token.clone(),
            self.shared.shutdown.clone(),
        ));

        debug!(listener = %listener.id(), owner = %listener.owner(), "async listener added");
        self.shared
            .workers
            .insert(listener.id(), WorkerHandle { queue, token, task });
        Ok(())
    }

    /// Stop the worker of `id`.
    ///
    /// The worker finishes the callback it is running, if any, and drops
    /// every packet still waiting in its queue. Returns `false` if no worker
    /// was running for `id`.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match self.shared.workers.remove(&id) {
            Some((_, worker)) => {
                worker.token.cancel();
                debug!(listener = %id, "async listener removed");
                true
            }
            None => false,
        }
    }

    /// Submit a packet for asynchronous processing by `chain`.
    ///
    /// Returns the sending index allocated to the packet.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the sending queue of the packet's connection or the
    /// queue of its first listener is full under the drop policy (the packet
    /// is reported and dropped), and `Shutdown` once the pipeline has been
    /// shut down.
    #[instrument(skip_all, fields(packet_type = %event.packet_type(), connection = %event.connection().id()))]
    pub async fn submit(&self, mut event: PacketEvent, chain: Snapshot<ListenerHandle>) -> Result<u64> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(self.refuse(&event, InterceptError::Shutdown));
        }

        let queue = shared.sending_queue(event.connection(), event.direction());
        let permit = match queue.reserve(shared.config.queue_full_policy).await {
            Ok(permit) => permit,
            Err(e) => return Err(self.refuse(&event, e)),
        };

        let now = Instant::now();
        let deadline = now.checked_add(shared.config.timeout()).unwrap_or(now + FAR_FUTURE);
        let ticket = match queue.insert(&shared.next_index, event.packet().clone(), deadline, permit) {
            Ok(ticket) => ticket,
            Err(e) => return Err(self.refuse(&event, e)),
        };

        let index = ticket.sending_index();
        trace!(sending_index = index, listeners = chain.len(), "packet entered async pipeline");
        let delay = DelaySource::new(Arc::downgrade(shared));
        event.set_async_marker(AsyncMarker::new(ticket, chain, deadline, delay));
        if !shared.forward(event).await {
            return Err(InterceptError::QueueFull {
                queue: "listener",
                capacity: shared.config.listener_queue_capacity,
            });
        }
        Ok(index)
    }

    fn refuse(&self, event: &PacketEvent, error: InterceptError) -> InterceptError {
        match &error {
            InterceptError::QueueFull { .. } => {
                debug!(packet_type = %event.packet_type(), "sending queue full, dropping packet");
                self.shared.metrics.record_drop(DropReason::QueueFull);
                self.shared.metrics.record_failure(PIPELINE_OWNER, "intercept");
                self.shared.reporter.report(
                    ErrorReport::new(PIPELINE_OWNER, "enqueue", error.clone()).with_packet(event.packet()),
                );
            }
            _ => self.shared.metrics.record_drop(DropReason::Shutdown),
        }
        error
    }

    /// Drop every packet in flight on `connection`.
    pub fn remove_connection(&self, connection: ConnectionId) {
        for direction in [Sender::Client, Sender::Server] {
            if let Some((_, queue)) = self.shared.sending.remove(&(connection, direction)) {
                queue.close(DropReason::Disconnected);
            }
        }
        self.shared
            .discard_deferred(DropReason::Disconnected, |event| event.connection().id() == connection);
        debug!(connection = %connection, "connection removed from async pipeline");
    }

    /// Release expired packets now instead of waiting for the sweeper.
    pub fn sweep(&self) {
        self.shared.sweep();
    }

    /// Stop every worker and drop all packets in flight.
    ///
    /// Waits for running callbacks to return. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!(
            workers = self.worker_count(),
            in_flight = self.in_flight(),
            "shutting down async pipeline"
        );

        self.shared.shutdown.cancel();
        self.shared.permits.close();

        let keys: Vec<_> = self.shared.sending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, queue)) = self.shared.sending.remove(&key) {
                queue.close(DropReason::Shutdown);
            }
        }
        self.shared.discard_deferred(DropReason::Shutdown, |_| true);

        let ids: Vec<_> = self.shared.workers.iter().map(|entry| *entry.key()).collect();
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, worker)) = self.shared.workers.remove(&id) {
                tasks.push(worker.task);
            }
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            tasks.push(sweeper);
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "pipeline task failed during shutdown");
            }
        }
        info!("async pipeline stopped");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Packets holding a sending queue slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.sending.iter().map(|entry| entry.value().len()).sum()
    }

    /// Packets parked by a processing delay.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.shared.deferred.len()
    }

    /// Number of running async listener workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Whether a worker is running for `id`.
    #[must_use]
    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.shared.workers.contains_key(&id)
    }
}

impl std::fmt::Debug for AsyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("workers", &self.worker_count())
            .field("in_flight", &self.in_flight())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
