//! Packet Interceptor Core Library
//!
//! This library intercepts packets flowing between a client and a server and
//! runs them through an ordered chain of listeners that may observe, mutate or
//! cancel them. Listeners either run on the ingress task or on their own
//! worker; packets handled asynchronously are put back in arrival order before
//! they are transmitted.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Packet types, packets and the packet type registry
//! - [`concurrent`] - Copy-on-write priority sets and the type-to-listener multimap
//! - [`listener`] - Listener trait, priorities and whitelists
//! - [`event`] - Per-traversal packet events and async markers
//! - [`dispatch`] - Synchronous dispatcher, error guard and error reporting
//! - [`pipeline`] - Asynchronous workers and the order-restoring sending queues
//! - [`interceptor`] - Registration API and dispatch entry point
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use packet_interceptor_core::config::InterceptorConfig;
//! use packet_interceptor_core::Interceptor;
//!
//! // Load configuration
//! let config = InterceptorConfig::from_file("interceptor.yaml")?;
//!
//! // Build the interceptor and register listeners
//! let interceptor = Interceptor::builder().config(config).registry(registry).build()?;
//! // ...
//! ```

#![forbid(unsafe_code)]

pub mod concurrent;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod interceptor;
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod protocol;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{InterceptorConfig, PipelineConfig, QueueFullPolicy};
pub use connection::{Connection, ConnectionId};
pub use dispatch::{ErrorReport, ErrorReporter, SyncDispatcher, TracingReporter};
pub use error::{ConfigError, ConnectionError, InterceptError, ListenerError, ListenerResult, Result};
pub use event::{AsyncMarker, PacketEvent};
pub use interceptor::{DispatchOutcome, Interceptor, InterceptorBuilder, Registration};
pub use listener::{
    BundleBehavior, ListenerId, ListenerPriority, ListeningWhitelist, PacketListener,
};
pub use metrics::PipelineMetrics;
pub use pipeline::{AsyncPipeline, PipelineHooks, ProcessingDelay};
pub use protocol::{Packet, PacketRegistry, PacketType, Protocol, Sender};
