//! Interceptor facade.
//!
//! Owns the listener collections, the synchronous dispatcher and the async
//! pipeline, and exposes the registration API used by plugins.
//!
//! # Example
//!
//! ```rust,ignore
//! let interceptor = Interceptor::builder().registry(registry).build()?;
//!
//! let registration = interceptor.register(
//!     ListeningWhitelist::builder().packet_type(CHAT).build(),
//!     Arc::new(ChatFilter::default()),
//! )?;
//!
//! match interceptor.dispatch(connection, packet).await? {
//!     DispatchOutcome::Forward(packet) => connection.transmit(packet)?,
//!     _ => {}
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument};

use crate::concurrent::PacketTypeMultiMap;
use crate::config::InterceptorConfig;
use crate::connection::{Connection, ConnectionId};
use crate::dispatch::{ErrorReport, ErrorReporter, SyncDispatcher, TracingReporter};
use crate::error::{InterceptError, ListenerError, Result};
use crate::event::PacketEvent;
use crate::listener::{ListenerHandle, ListenerId, ListeningWhitelist, PacketListener, RegisteredListener};
use crate::metrics::{DropReason, PipelineMetrics};
use crate::pipeline::{AsyncPipeline, PipelineHooks};
use crate::protocol::{Packet, PacketRegistry, PacketType};

/// What happened to a dispatched packet.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No async listener wants the packet; the caller transmits it.
    Forward(Packet),
    /// A listener cancelled the packet.
    Cancelled,
    /// The packet entered the async pipeline and will be transmitted by it,
    /// in sending index order.
    Queued { sending_index: u64 },
    /// The async pipeline refused the packet; it was reported and dropped.
    Dropped,
}

/// Entry point of the interception pipeline.
pub struct Interceptor {
    config: InterceptorConfig,
    registry: Arc<PacketRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    metrics: Arc<PipelineMetrics>,
    sync_listeners: Arc<PacketTypeMultiMap<ListenerHandle>>,
    async_listeners: PacketTypeMultiMap<ListenerHandle>,
    timeout_handlers: Arc<PacketTypeMultiMap<ListenerHandle>>,
    dispatcher: SyncDispatcher,
    pipeline: AsyncPipeline,
    registrations: DashMap<ListenerId, ListenerHandle>,
    timeout_registrations: DashMap<ListenerId, ListenerHandle>,
    next_listener: AtomicU64,
    next_sequence: AtomicU64,
}

impl Interceptor {
    #[must_use]
    pub fn builder() -> InterceptorBuilder {
        InterceptorBuilder::new()
    }

    /// Register `listener` for the packet types in `whitelist`.
    ///
    /// Types the registry does not know are reported and left out. The
    /// listener runs on the ingress thread unless the whitelist asks for
    /// asynchronous processing, in which case it gets its own worker.
    ///
    /// # Errors
    ///
    /// - `EmptyWhitelist` if no known packet type remains
    /// - `Shutdown` if the interceptor has been shut down
    pub fn register(
        self: &Arc<Self>,
        mut whitelist: ListeningWhitelist,
        listener: Arc<dyn PacketListener>,
    ) -> Result<Registration> {
        if self.pipeline.is_shutdown() {
            return Err(InterceptError::Shutdown);
        }

        let owner = listener.owner().to_string();
        self.retain_known(&owner, "register", &mut whitelist)?;

        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(RegisteredListener::new(id, whitelist, listener));

        if handle.whitelist().is_async() {
            self.pipeline.add_listener(Arc::clone(&handle))?;
            self.async_listeners.put(handle.whitelist(), Arc::clone(&handle));
        } else {
            self.sync_listeners.put(handle.whitelist(), Arc::clone(&handle));
        }
        self.registrations.insert(id, Arc::clone(&handle));

        info!(
            listener = %id,
            owner = %owner,
            priority = %handle.priority(),
            types = handle.whitelist().types().len(),
            asynchronous = handle.whitelist().is_async(),
            "listener registered"
        );

        Ok(Registration {
            id,
            owner,
            interceptor: Arc::downgrade(self),
        })
    }

    /// Register `listener` to be told about packets of the whitelisted types
    /// that expire in the async pipeline.
    ///
    /// The handler's `on_packet` runs once per expired packet, with the packet
    /// as it entered the pipeline. The packet is dropped afterwards whatever
    /// the handler does. Whitelist options other than the priority are
    /// ignored.
    ///
    /// # Errors
    ///
    /// - `EmptyWhitelist` if no known packet type remains
    /// - `Shutdown` if the interceptor has been shut down
    pub fn register_timeout_handler(
        &self,
        mut whitelist: ListeningWhitelist,
        listener: Arc<dyn PacketListener>,
    ) -> Result<ListenerId> {
        if self.pipeline.is_shutdown() {
            return Err(InterceptError::Shutdown);
        }

        let owner = listener.owner().to_string();
        self.retain_known(&owner, "register_timeout_handler", &mut whitelist)?;

        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(RegisteredListener::new(id, whitelist, listener));
        self.timeout_handlers.put(handle.whitelist(), Arc::clone(&handle));
        self.timeout_registrations.insert(id, handle);

        info!(listener = %id, owner = %owner, "timeout handler registered");
        Ok(id)
    }

    /// Remove a timeout handler. Returns `false` if `id` was not one.
    pub fn unregister_timeout_handler(&self, id: ListenerId) -> bool {
        let Some((_, handle)) = self.timeout_registrations.remove(&id) else {
            return false;
        };
        self.timeout_handlers.remove(handle.whitelist(), &handle);
        info!(listener = %id, owner = %handle.owner(), "timeout handler unregistered");
        true
    }

    /// Report and drop the types the registry does not know.
    fn retain_known(
        &self,
        owner: &str,
        operation: &'static str,
        whitelist: &mut ListeningWhitelist,
    ) -> Result<()> {
        for unknown in whitelist.retain_types(|packet_type| self.registry.is_known(packet_type)) {
            self.reporter.report(ErrorReport::new(
                owner,
                operation,
                InterceptError::UnknownPacketType {
                    protocol: unknown.protocol,
                    sender: unknown.sender,
                    id: unknown.id,
                },
            ));
        }
        if whitelist.is_empty() {
            return Err(InterceptError::EmptyWhitelist {
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    /// Remove one registration.
    ///
    /// Returns the packet types no listener intercepts any more, so upstream
    /// filters can stop forwarding them. Packets queued for an async listener
    /// at this point are dropped.
    pub fn unregister(&self, id: ListenerId) -> Vec<PacketType> {
        let Some((_, handle)) = self.registrations.remove(&id) else {
            return Vec::new();
        };

        let emptied = if handle.whitelist().is_async() {
            let emptied = self.async_listeners.remove(handle.whitelist(), &handle);
            self.pipeline.remove_listener(id);
            emptied
        } else {
            self.sync_listeners.remove(handle.whitelist(), &handle)
        };

        let released: Vec<_> = emptied
            .into_iter()
            .filter(|packet_type| !self.is_intercepted(packet_type))
            .collect();
        info!(
            listener = %id,
            owner = %handle.owner(),
            released = released.len(),
            "listener unregistered"
        );
        released
    }

    /// Remove every registration of `owner`. Returns how many were removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let ids: Vec<_> = self
            .registrations
            .iter()
            .filter(|entry| entry.value().owner() == owner)
            .map(|entry| *entry.key())
            .collect();
        for id in &ids {
            self.unregister(*id);
        }
        ids.len()
    }

    /// Run a packet through its listener chain.
    ///
    /// Synchronous listeners always run first, on the calling task. If any
    /// async listener accepts the packet afterwards it enters the async
    /// pipeline and is transmitted from there; otherwise the surviving packet
    /// is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Only a [`ListenerError::Fatal`] raised by a synchronous listener.
    #[instrument(skip_all, fields(connection = %connection.id(), packet_type = %packet.packet_type()))]
    pub async fn dispatch(
        &self,
        connection: Arc<dyn Connection>,
        packet: Packet,
    ) -> std::result::Result<DispatchOutcome, ListenerError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_dispatch(packet.packet_type().sender);

        let mut event = PacketEvent::new(packet, connection, sequence);
        self.dispatcher.invoke(&mut event, None)?;

        let chain = self.async_listeners.snapshot(&event.packet_type());
        if !chain.iter().any(|listener| listener.accepts(&event)) {
            if event.is_cancelled() {
                debug!(sequence, "packet cancelled");
                self.metrics.record_drop(DropReason::Cancelled);
                return Ok(DispatchOutcome::Cancelled);
            }
            return Ok(DispatchOutcome::Forward(event.into_packet()));
        }

        match self.pipeline.submit(event, chain).await {
            Ok(sending_index) => Ok(DispatchOutcome::Queued { sending_index }),
            Err(_) => Ok(DispatchOutcome::Dropped),
        }
    }

    /// Whether any listener, sync or async, intercepts `packet_type`.
    #[must_use]
    pub fn is_intercepted(&self, packet_type: &PacketType) -> bool {
        self.sync_listeners.contains(packet_type) || self.async_listeners.contains(packet_type)
    }

    /// Every packet type with at least one listener.
    #[must_use]
    pub fn intercepted_types(&self) -> BTreeSet<PacketType> {
        let mut types = self.sync_listeners.packet_types();
        types.extend(self.async_listeners.packet_types());
        types
    }

    /// Live registrations, oldest first.
    #[must_use]
    pub fn registrations(&self) -> Vec<ListenerHandle> {
        let mut handles: Vec<_> = self
            .registrations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Registered timeout handlers, oldest first.
    #[must_use]
    pub fn timeout_handlers(&self) -> Vec<ListenerHandle> {
        let mut handles: Vec<_> = self
            .timeout_registrations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Drop the packets a closed connection still has in flight.
    pub fn remove_connection(&self, connection: ConnectionId) {
        self.pipeline.remove_connection(connection);
    }

    /// Release packets whose deadline has passed.
    pub fn sweep(&self) {
        self.pipeline.sweep();
    }

    /// Stop every async worker, drop all packets in flight and forget every
    /// registration.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
        self.sync_listeners.clear();
        self.async_listeners.clear();
        self.timeout_handlers.clear();
        self.registrations.clear();
        self.timeout_registrations.clear();
    }

    /// Dispatcher for the synchronous listeners, for callers that run a
    /// single priority level themselves.
    #[must_use]
    pub fn sync_dispatcher(&self) -> &SyncDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn pipeline(&self) -> &AsyncPipeline {
        &self.pipeline
    }

    #[must_use]
    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("registrations", &self.registrations.len())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`Interceptor::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    id: ListenerId,
    owner: String,
    interceptor: Weak<Interceptor>,
}

impl Registration {
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the registration is still installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.interceptor
            .upgrade()
            .is_some_and(|interceptor| interceptor.registrations.contains_key(&self.id))
    }

    /// Remove this registration; see [`Interceptor::unregister`].
    pub fn unregister(&self) -> Vec<PacketType> {
        match self.interceptor.upgrade() {
            Some(interceptor) => interceptor.unregister(self.id),
            None => Vec::new(),
        }
    }
}

/// Builder for [`Interceptor`].
pub struct InterceptorBuilder {
    config: InterceptorConfig,
    registry: Option<Arc<PacketRegistry>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    metrics: Option<Arc<PipelineMetrics>>,
    runtime: Option<Handle>,
}

impl InterceptorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: InterceptorConfig::default(),
            registry: None,
            reporter: None,
            metrics: None,
            runtime: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: InterceptorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sink for listener failures. Defaults to [`TracingReporter`].
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime the async workers are spawned on. Defaults to the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the interceptor.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if the configuration fails validation
    /// - `NoRuntime` if no runtime was given and none is current
    pub fn build(self) -> Result<Arc<Interceptor>> {
        self.config
            .validate()
            .map_err(|e| InterceptError::InvalidConfig(e.to_string()))?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| InterceptError::NoRuntime)?,
        };
        let registry = self.registry.unwrap_or_default();
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter) as Arc<dyn ErrorReporter>);
        let metrics = self.metrics.unwrap_or_default();

        let sync_listeners = Arc::new(PacketTypeMultiMap::new());
        let dispatcher = SyncDispatcher::new(
            Arc::clone(&sync_listeners),
            Arc::clone(&reporter),
            Arc::clone(&metrics),
        );
        let timeout_handlers = Arc::new(PacketTypeMultiMap::new());

        debug!(
            max_concurrency = self.config.pipeline.max_concurrency,
            queue_full_policy = ?self.config.pipeline.queue_full_policy,
            packet_types = registry.len(),
            "interceptor built"
        );

        let config = self.config;
        Ok(Arc::new_cyclic(|interceptor: &Weak<Interceptor>| {
            let interceptor = interceptor.clone();
            let hooks = PipelineHooks {
                timeout_handlers: Arc::clone(&timeout_handlers),
                on_listener_failed: Some(Box::new(move |id: ListenerId| {
                    if let Some(interceptor) = interceptor.upgrade() {
                        interceptor.unregister(id);
                    }
                })),
            };
            let pipeline = AsyncPipeline::new(
                config.pipeline.clone(),
                Arc::clone(&reporter),
                Arc::clone(&metrics),
                hooks,
                runtime,
            );

            Interceptor {
                config,
                registry,
                reporter,
                metrics,
                sync_listeners,
                async_listeners: PacketTypeMultiMap::new(),
                timeout_handlers,
                dispatcher,
                pipeline,
                registrations: DashMap::new(),
                timeout_registrations: DashMap::new(),
                next_listener: AtomicU64::new(1),
                next_sequence: AtomicU64::new(0),
            }
        }))
    }
}

impl Default for InterceptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
