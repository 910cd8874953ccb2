//! Test harness for integration testing of the interception pipeline.
//!
//! Provides a complete test environment with:
//! - A registry of Play packet types
//! - An interceptor wired to a recording reporter and fresh metrics
//! - A recording connection packets are dispatched on

use std::sync::Arc;
use std::time::Duration;

use crate::config::{InterceptorConfig, QueueFullPolicy};
use crate::connection::Connection;
use crate::interceptor::{DispatchOutcome, Interceptor, Registration};
use crate::listener::{ListeningWhitelist, PacketListener};
use crate::metrics::PipelineMetrics;
use crate::protocol::{Packet, PacketRegistry, PacketType, Protocol, Sender};

use super::connection::RecordingConnection;
use super::reporter::RecordingReporter;

/// Packet types known to [`test_registry`].
pub mod packet_types {
    use crate::protocol::{PacketType, Protocol, Sender};

    pub const BUNDLE: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x00);
    pub const KEEP_ALIVE: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x05);
    pub const CHAT: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x0f);
    pub const SOUND: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x10);
    pub const ENTITY_MOVE: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x11);
    pub const CLIENT_CHAT: PacketType = PacketType::new(Protocol::Play, Sender::Client, 0x03);
    pub const CLIENT_POSITION: PacketType = PacketType::new(Protocol::Play, Sender::Client, 0x04);

    /// A server-bound Play type outside the test registry.
    pub const UNREGISTERED: PacketType = PacketType::new(Protocol::Play, Sender::Server, 0x7f);

    /// Server Play packet with the given id.
    #[must_use]
    pub const fn server(id: i32) -> PacketType {
        PacketType::new(Protocol::Play, Sender::Server, id)
    }
}

/// Registry with Play packet ids `0..32` in both directions.
#[must_use]
pub fn test_registry() -> PacketRegistry {
    let mut registry = PacketRegistry::new();
    for id in 0..32 {
        for sender in [Sender::Client, Sender::Server] {
            registry.register(
                PacketType::new(Protocol::Play, sender, id),
                format!("Play{}{id:#04x}", sender.as_str()),
            );
        }
    }
    registry
}

/// Test harness for integration testing.
pub struct InterceptorTestHarness {
    /// The interceptor under test
    pub interceptor: Arc<Interceptor>,
    /// Connection every packet is dispatched on
    pub connection: Arc<RecordingConnection>,
    /// Collects every absorbed failure
    pub reporter: Arc<RecordingReporter>,
    pub metrics: Arc<PipelineMetrics>,
}

impl InterceptorTestHarness {
    /// Create a harness with the default configuration.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(InterceptorConfig::default())
    }

    /// Create a harness with a custom configuration.
    #[must_use]
    pub fn with_config(config: InterceptorConfig) -> Self {
        let reporter = Arc::new(RecordingReporter::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let interceptor = Interceptor::builder()
            .config(config)
            .registry(Arc::new(test_registry()))
            .reporter(reporter.clone())
            .metrics(metrics.clone())
            .build()
            .expect("Failed to build interceptor");

        Self {
            interceptor,
            connection: Arc::new(RecordingConnection::new(1)),
            reporter,
            metrics,
        }
    }

    /// The harness connection as a trait object.
    #[must_use]
    pub fn connection_handle(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }

    /// Register a listener, panicking if registration fails.
    pub fn register(
        &self,
        whitelist: ListeningWhitelist,
        listener: impl PacketListener + 'static,
    ) -> Registration {
        self.register_arc(whitelist, Arc::new(listener))
    }

    /// Register a listener the test keeps a handle to.
    pub fn register_arc(&self, whitelist: ListeningWhitelist, listener: Arc<dyn PacketListener>) -> Registration {
        self.interceptor
            .register(whitelist, listener)
            .expect("Failed to register listener")
    }

    /// Dispatch a packet on the harness connection.
    ///
    /// Packets handed back for forwarding are transmitted right away, as a
    /// transport would.
    pub async fn dispatch(&self, packet: Packet) -> DispatchOutcome {
        let outcome = self
            .interceptor
            .dispatch(self.connection_handle(), packet)
            .await
            .expect("Fatal listener error");

        if let DispatchOutcome::Forward(packet) = &outcome {
            self.connection
                .transmit(packet.clone())
                .expect("Failed to transmit forwarded packet");
        }
        outcome
    }

    /// Wait until the connection saw `count` packets, up to five seconds.
    pub async fn wait_for_transmitted(&self, count: usize) -> bool {
        self.connection.wait_for(count, Duration::from_secs(5)).await
    }

    pub async fn shutdown(&self) {
        self.interceptor.shutdown().await;
    }
}

impl Default for InterceptorTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating a test harness with a specific pipeline configuration.
pub struct TestHarnessBuilder {
    config: InterceptorConfig,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: InterceptorConfig::default(),
        }
    }

    /// Set the number of callbacks allowed to run at once.
    #[must_use]
    pub fn max_concurrency(mut self, permits: usize) -> Self {
        self.config.pipeline.max_concurrency = permits;
        self
    }

    /// Set the capacity of each async listener queue.
    #[must_use]
    pub fn listener_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pipeline.listener_queue_capacity = capacity;
        self
    }

    /// Set the number of packets in flight per connection and direction.
    #[must_use]
    pub fn sending_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pipeline.sending_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.config.pipeline.queue_full_policy = policy;
        self
    }

    /// Set the async marker timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.pipeline.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.pipeline.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the test harness.
    #[must_use]
    pub fn build(self) -> InterceptorTestHarness {
        InterceptorTestHarness::with_config(self.config)
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
