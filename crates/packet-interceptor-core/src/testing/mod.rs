//! Test utilities for the packet interceptor.
//!
//! This module provides infrastructure for unit and integration testing:
//!
//! - [`RecordingConnection`] - A connection that records every transmitted packet
//! - [`RecordingReporter`] - An error sink that keeps every report
//! - [`FnListener`], [`FnAsyncListener`], [`GatedListener`] - Listener helpers
//! - [`InterceptorTestHarness`] - A complete interceptor wired to the recorders
//! - [`TestHarnessBuilder`] - Builder pattern for custom pipeline configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use packet_interceptor_core::testing::{packet_types, FnListener, InterceptorTestHarness};
//!
//! #[tokio::test]
//! async fn test_cancelled_packet_is_not_sent() {
//!     let harness = InterceptorTestHarness::new();
//!     harness.register(
//!         ListeningWhitelist::builder().packet_type(packet_types::CHAT).build(),
//!         FnListener::new("mute", |event| Ok(event.cancel()?)),
//!     );
//!
//!     let outcome = harness.dispatch(Packet::new(packet_types::CHAT, &b"hi"[..])).await;
//!     assert!(matches!(outcome, DispatchOutcome::Cancelled));
//! }
//! ```

pub mod connection;
pub mod harness;
pub mod listeners;
pub mod reporter;

pub use connection::RecordingConnection;
pub use harness::{packet_types, test_registry, InterceptorTestHarness, TestHarnessBuilder};
pub use listeners::{ConcurrencyGauge, FnAsyncListener, FnListener, Gate, GatedListener, GaugeGuard};
pub use reporter::RecordingReporter;
