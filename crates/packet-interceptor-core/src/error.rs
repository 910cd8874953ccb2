//! Domain error types for the packet interception pipeline.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::protocol::{PacketType, Protocol, Sender};

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// At least one listener callback must be allowed to run.
    #[error("max_concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// Bounded queues need room for at least one packet.
    #[error("{queue} capacity must be at least 1, got {capacity}")]
    InvalidQueueCapacity { queue: &'static str, capacity: usize },

    /// Concurrency and queue bounds are backed by semaphores with a hard
    /// permit ceiling.
    #[error("{field} must be at most {max}, got {value}")]
    PermitLimitExceeded {
        field: &'static str,
        value: usize,
        max: usize,
    },

    /// A zero timeout would expire every packet on arrival.
    #[error("timeout_ms must be greater than zero")]
    InvalidTimeout,

    /// The expiry sweeper needs a non-zero period.
    #[error("sweep_interval_ms must be greater than zero")]
    InvalidSweepInterval,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Errors raised by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The remote end is gone; the packet cannot be delivered.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors that occur while registering listeners or moving packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptError {
    /// No packet type was registered for this protocol/sender/id.
    #[error("unknown packet type: {protocol:?} {sender:?} id={id:#04x}")]
    UnknownPacketType {
        protocol: Protocol,
        sender: Sender,
        id: i32,
    },

    /// No packet type was registered for this payload class.
    #[error("unknown packet class: {0}")]
    UnknownPacketClass(String),

    /// A listener tried to change an event it may only observe.
    #[error("event is read-only: cannot {operation} for {packet_type}")]
    ReadOnlyViolation {
        operation: &'static str,
        packet_type: PacketType,
    },

    /// The codec collaborator could not encode or decode a packet.
    #[error("codec error for {packet_type}: {message}")]
    Codec {
        packet_type: PacketType,
        message: String,
    },

    /// A bounded internal queue rejected a packet.
    #[error("{queue} queue is full (capacity {capacity})")]
    QueueFull { queue: &'static str, capacity: usize },

    /// The whitelist names no packet type the registry knows.
    #[error("listener '{owner}' has an empty whitelist")]
    EmptyWhitelist { owner: String },

    /// A packet was not fully processed before its marker deadline.
    #[error("packet {packet_type} (sending index {sending_index}) timed out")]
    TimedOut {
        packet_type: PacketType,
        sending_index: u64,
    },

    /// A listener replaced the packet with one of a different type.
    #[error("listener replaced {expected} with a packet of type {actual}")]
    PacketTypeChanged {
        expected: PacketType,
        actual: PacketType,
    },

    /// Only events travelling through the async pipeline can be deferred.
    #[error("packet {packet_type} is not being processed asynchronously")]
    NotAsync { packet_type: PacketType },

    /// The interceptor was built from a configuration that failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker tasks need a Tokio runtime to be spawned on.
    #[error("no tokio runtime available to spawn listener workers")]
    NoRuntime,

    /// The interceptor has been shut down.
    #[error("interceptor shutting down")]
    Shutdown,

    /// Transport failure while transmitting a processed packet.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Errors returned by listener callbacks.
///
/// Every variant except [`ListenerError::Fatal`] is absorbed at the dispatch
/// boundary: it is reported once and dispatch moves on to the next listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Ordinary listener failure.
    #[error("listener failed: {0}")]
    Failed(String),

    /// Mutation attempted while the event was read-only.
    #[error(transparent)]
    Intercept(#[from] InterceptError),

    /// The callback panicked; the panic was caught by the dispatch guard.
    #[error("listener panicked: {0}")]
    Panicked(String),

    /// Unrecoverable failure that must not be swallowed.
    #[error("fatal listener error: {0}")]
    Fatal(String),
}

impl ListenerError {
    /// Create an ordinary failure from any message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this error must propagate past the dispatch guard.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Intercept(InterceptError::ReadOnlyViolation { .. }) => "read_only",
            Self::Intercept(_) => "intercept",
            Self::Panicked(_) => "panicked",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Result type alias for interception operations.
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for listener callbacks.
pub type ListenerResult = std::result::Result<(), ListenerError>;
