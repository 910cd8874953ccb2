//! Listener dispatch.
//!
//! Contains the synchronous dispatcher, the error guard shared with the async
//! workers, and the error reporting sink.

pub(crate) mod guard;
pub mod reporter;
mod sync;

pub use reporter::{ErrorReport, ErrorReporter, TracingReporter, PIPELINE_OWNER};
pub use sync::SyncDispatcher;
