//! Per-listener worker loop.
//!
//! Every async listener owns one bounded FIFO queue and one task draining it.
//! The task waits for a packet or for its cancellation token, runs the
//! listener under the error guard, and forwards the packet down the chain.

use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};

use crate::dispatch::{guard, ErrorReport};
use crate::error::ListenerError;
use crate::event::PacketEvent;
use crate::listener::{ListenerHandle, RegisteredListener};
use crate::metrics::DropReason;

use super::PipelineShared;

/// What to do with an event after its callback.
enum Step {
    Forward,
    Discard(DropReason),
}

/// Run the worker of `listener` until it is removed or the pipeline stops.
#[instrument(skip_all, fields(listener = %listener.id(), owner = %listener.owner()))]
pub(super) async fn run(
    shared: Weak<PipelineShared>,
    listener: ListenerHandle,
    mut queue: mpsc::Receiver<PacketEvent>,
    token: CancellationToken,
    shutdown: CancellationToken,
) {
    debug!("worker started");
    let mut failed = false;

    loop {
        let mut event = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = queue.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let Some(pipeline) = shared.upgrade() else {
            event.set_drop_reason(DropReason::Shutdown);
            break;
        };

        if event.async_marker().is_some_and(|marker| marker.is_expired()) {
            trace!(packet_type = %event.packet_type(), "skipping expired packet");
            event.set_drop_reason(DropReason::Timeout);
            continue;
        }

        match process(&pipeline, &listener, &mut event, &token).await {
            Ok(Step::Forward) => pipeline.forward_or_hold(event).await,
            Ok(Step::Discard(reason)) => event.set_drop_reason(reason),
            Err(e) => {
                error!(error = %e, packet_type = %event.packet_type(), "fatal listener error, stopping worker");
                pipeline.metrics.record_failure(listener.owner(), e.kind());
                pipeline.reporter.report(
                    ErrorReport::new(listener.owner(), "on_async_packet", e).with_packet(event.packet()),
                );
                event.set_drop_reason(DropReason::ListenerFailed);
                failed = true;
                break;
            }
        }
    }

    if failed {
        deregister(&shared, &listener);
    }

    // Clear whatever is still queued; each discarded packet releases its slot.
    queue.close();
    let reason = if failed {
        DropReason::ListenerFailed
    } else if shutdown.is_cancelled() {
        DropReason::Shutdown
    } else {
        DropReason::ListenerRemoved
    };
    let mut discarded = 0usize;
    while let Ok(mut event) = queue.try_recv() {
        event.set_drop_reason(reason);
        discarded += 1;
    }
    debug!(discarded, reason = reason.as_str(), "worker stopped");
}

/// Take a failed listener out of the pipeline and tell the owner, so no new
/// packet is routed to a worker that is gone.
fn deregister(shared: &Weak<PipelineShared>, listener: &RegisteredListener) {
    let Some(pipeline) = shared.upgrade() else {
        return;
    };
    pipeline.workers.remove(&listener.id());
    if let Some(on_failed) = &pipeline.hooks.on_listener_failed {
        on_failed(listener.id());
    }
}

/// Run one callback while holding a concurrency permit.
async fn process(
    shared: &PipelineShared,
    listener: &RegisteredListener,
    event: &mut PacketEvent,
    token: &CancellationToken,
) -> Result<Step, ListenerError> {
    let permit = tokio::select! {
        biased;
        () = token.cancelled() => return Ok(Step::Discard(DropReason::ListenerRemoved)),
        permit = shared.permits.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return Ok(Step::Discard(DropReason::Shutdown)),
        },
    };

    shared.metrics.inc_active_callbacks();
    event.set_read_only(listener.priority().is_monitor());

    let started = Instant::now();
    let outcome = AssertUnwindSafe(listener.listener().on_async_packet(event))
        .catch_unwind()
        .await;

    shared
        .metrics
        .record_duration(listener.owner(), started.elapsed().as_secs_f64());
    shared.metrics.dec_active_callbacks();
    drop(permit);

    event.set_read_only(false);
    guard::settle(
        outcome,
        event,
        listener,
        "on_async_packet",
        shared.reporter.as_ref(),
        &shared.metrics,
    )?;
    Ok(Step::Forward)
}
