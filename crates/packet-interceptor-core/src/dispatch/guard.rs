//! Error guard around listener callbacks.
//!
//! Both dispatchers run callbacks under `catch_unwind` and hand the outcome to
//! [`settle`], which decides what propagates and what is reported.

use std::any::Any;

use crate::error::{ListenerError, ListenerResult};
use crate::event::PacketEvent;
use crate::listener::RegisteredListener;
use crate::metrics::PipelineMetrics;

use super::{ErrorReport, ErrorReporter};

/// Outcome of a callback run under `catch_unwind`.
pub(crate) type CallbackOutcome = Result<ListenerResult, Box<dyn Any + Send>>;

/// Absorb a callback outcome.
///
/// Fatal errors are returned unreported. Every other failure, including a
/// panic or a rejected mutation the listener ignored, is reported exactly once
/// and `Ok(())` is returned so dispatch can continue.
pub(crate) fn settle(
    outcome: CallbackOutcome,
    event: &mut PacketEvent,
    listener: &RegisteredListener,
    operation: &'static str,
    reporter: &dyn ErrorReporter,
    metrics: &PipelineMetrics,
) -> ListenerResult {
    let result = outcome.unwrap_or_else(|payload| Err(ListenerError::Panicked(panic_message(&*payload))));
    let rejected = event.take_rejected();

    let error = match result {
        Ok(()) => rejected.map(ListenerError::from),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => Some(e),
    };

    if let Some(error) = error {
        metrics.record_failure(listener.owner(), error.kind());
        reporter.report(
            ErrorReport::new(listener.owner(), operation, error).with_packet(event.packet()),
        );
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
