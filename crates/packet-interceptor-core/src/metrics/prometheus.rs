//! Prometheus metrics for the interception pipeline.
//!
//! Provides counters, histograms, and gauges for monitoring dispatch volume,
//! drops, and listener health.

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::protocol::Sender;

/// Why a packet left the pipeline without being transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// A listener cancelled the packet.
    Cancelled,
    /// A bounded queue had no room for it.
    QueueFull,
    /// Its async marker deadline passed before processing finished.
    Timeout,
    /// It was queued for a listener that has since been unregistered.
    ListenerRemoved,
    /// The listener holding it failed fatally.
    ListenerFailed,
    /// The interceptor shut down.
    Shutdown,
    /// Its connection was removed.
    Disconnected,
}

impl DropReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::QueueFull => "queue_full",
            Self::Timeout => "timeout",
            Self::ListenerRemoved => "listener_removed",
            Self::ListenerFailed => "listener_failed",
            Self::Shutdown => "shutdown",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Pipeline metrics collection.
pub struct PipelineMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Packets entering dispatch, by direction.
    pub packets_dispatched: IntCounterVec,

    /// Packets released by a sending queue to their connection.
    pub packets_transmitted: IntCounter,

    /// Packets leaving the async pipeline untransmitted, by reason.
    pub packets_dropped: IntCounterVec,

    /// Reported listener failures by owner and kind.
    pub listener_failures: CounterVec,

    /// Listener callback latency by owner.
    pub listener_duration_seconds: HistogramVec,

    /// Async callbacks currently holding a concurrency permit.
    pub active_callbacks: IntGauge,

    /// Packets currently held by sending queues.
    pub in_flight: IntGauge,
}

impl PipelineMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let packets_dispatched = IntCounterVec::new(
            Opts::new(
                "packet_interceptor_dispatched_total",
                "Total number of packets dispatched by direction",
            ),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let packets_transmitted = IntCounter::new(
            "packet_interceptor_transmitted_total",
            "Total number of packets released by the sending queues",
        )
        .expect("metric creation should succeed");

        let packets_dropped = IntCounterVec::new(
            Opts::new(
                "packet_interceptor_dropped_total",
                "Total number of async packets dropped by reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let listener_failures = CounterVec::new(
            Opts::new(
                "packet_interceptor_listener_failures_total",
                "Total number of reported listener failures by owner and kind",
            ),
            &["owner", "kind"],
        )
        .expect("metric creation should succeed");

        let listener_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "packet_interceptor_listener_duration_seconds",
                "Listener callback latency in seconds",
            )
            .buckets(vec![
                0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
            &["owner"],
        )
        .expect("metric creation should succeed");

        let active_callbacks = IntGauge::new(
            "packet_interceptor_active_callbacks",
            "Current number of async listener callbacks executing",
        )
        .expect("metric creation should succeed");

        let in_flight = IntGauge::new(
            "packet_interceptor_in_flight",
            "Current number of packets held by sending queues",
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(packets_dispatched.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(packets_transmitted.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(packets_dropped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(listener_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(listener_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_callbacks.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            packets_dispatched,
            packets_transmitted,
            packets_dropped,
            listener_failures,
            listener_duration_seconds,
            active_callbacks,
            in_flight,
        }
    }

    /// Record a packet entering dispatch.
    pub fn record_dispatch(&self, sender: Sender) {
        self.packets_dispatched
            .with_label_values(&[sender.as_str()])
            .inc();
    }

    pub fn record_transmit(&self) {
        self.packets_transmitted.inc();
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.packets_dropped
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    /// Record a reported listener failure.
    pub fn record_failure(&self, owner: &str, kind: &str) {
        self.listener_failures
            .with_label_values(&[owner, kind])
            .inc();
    }

    /// Record listener callback duration.
    pub fn record_duration(&self, owner: &str, duration_seconds: f64) {
        self.listener_duration_seconds
            .with_label_values(&[owner])
            .observe(duration_seconds);
    }

    pub fn inc_active_callbacks(&self) {
        self.active_callbacks.inc();
    }

    pub fn dec_active_callbacks(&self) {
        self.active_callbacks.dec();
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.inc();
    }

    /// Decrease the in-flight gauge by `count` packets.
    pub fn sub_in_flight(&self, count: usize) {
        self.in_flight.sub(count as i64);
    }

    /// Total packets dropped for `reason` so far.
    #[must_use]
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.packets_dropped
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
