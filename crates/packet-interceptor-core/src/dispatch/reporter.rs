//! Error reporting sink.
//!
//! Every failure absorbed by the pipeline is handed to an [`ErrorReporter`]
//! exactly once, attributed to the plugin that owns the failing listener.

use std::fmt;

use tracing::warn;

use crate::error::ListenerError;
use crate::protocol::Packet;

/// Owner recorded for failures that no listener is responsible for.
pub const PIPELINE_OWNER: &str = "packet-interceptor";

/// One absorbed failure.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Plugin that owns the failing listener.
    pub owner: String,
    /// What was being attempted, e.g. `on_packet` or `transmit`.
    pub operation: &'static str,
    pub error: ListenerError,
    /// The packet being processed, when one is available.
    pub packet: Option<Packet>,
}

impl ErrorReport {
    pub fn new(owner: impl Into<String>, operation: &'static str, error: impl Into<ListenerError>) -> Self {
        Self {
            owner: owner.into(),
            operation,
            error: error.into(),
            packet: None,
        }
    }

    #[must_use]
    pub fn with_packet(mut self, packet: &Packet) -> Self {
        self.packet = Some(packet.clone());
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} failed: {}", self.owner, self.operation, self.error)?;
        if let Some(packet) = &self.packet {
            write!(f, " (packet {})", packet.packet_type())?;
        }
        Ok(())
    }
}

/// Receives every failure the pipeline absorbs.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Reporter that logs each report once at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        match &report.packet {
            Some(packet) => warn!(
                owner = %report.owner,
                operation = report.operation,
                kind = report.error.kind(),
                packet_type = %packet.packet_type(),
                error = %report.error,
                "listener failure"
            ),
            None => warn!(
                owner = %report.owner,
                operation = report.operation,
                kind = report.error.kind(),
                error = %report.error,
                "listener failure"
            ),
        }
    }
}
