//! Integration tests for the asynchronous pipeline.
//!
//! Covers transmission order, the concurrency bound, listener removal while
//! packets are in flight, timeouts and timeout handlers, processing delays,
//! queue overflow and shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use packet_interceptor_core::config::QueueFullPolicy;
use packet_interceptor_core::dispatch::PIPELINE_OWNER;
use packet_interceptor_core::error::{InterceptError, ListenerError};
use packet_interceptor_core::listener::{ListenerPriority, ListeningWhitelist};
use packet_interceptor_core::metrics::DropReason;
use packet_interceptor_core::testing::{
    packet_types, ConcurrencyGauge, FnAsyncListener, FnListener, Gate, GatedListener,
    InterceptorTestHarness, TestHarnessBuilder,
};
use packet_interceptor_core::{
    ConnectionId, DispatchOutcome, ListenerResult, Packet, PacketEvent, PacketType, ProcessingDelay,
};

const WAIT: Duration = Duration::from_secs(5);

fn async_whitelist(priority: ListenerPriority, packet_type: PacketType) -> ListeningWhitelist {
    ListeningWhitelist::builder()
        .priority(priority)
        .packet_type(packet_type)
        .asynchronous()
        .build()
}

fn tagged(packet_type: PacketType, tag: u8) -> Packet {
    Packet::new(packet_type, vec![tag])
}

fn tag_of(packet: &Packet) -> u8 {
    packet.body().and_then(|body| body.first().copied()).unwrap_or_default()
}

/// Poll `condition` until it holds or [`WAIT`] runs out.
async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Record the tag of every packet a listener sees.
fn recorder(log: &Arc<Mutex<Vec<u8>>>) -> impl Fn(&mut PacketEvent) -> ListenerResult + Send + Sync {
    let log = log.clone();
    move |event: &mut PacketEvent| {
        log.lock().push(tag_of(event.packet()));
        Ok(())
    }
}

// =============================================================================
// Ordering
// =============================================================================

/// Packets leave in submission order even when later ones finish first.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transmission_follows_submission_order() {
    let harness = InterceptorTestHarness::new();

    for tag in 0..10u8 {
        let delay = Duration::from_millis(u64::from(10 - tag) * 15);
        let listener = FnAsyncListener::new(format!("stage-{tag}"), move |event| {
            if tag == 4 {
                event.cancel()?;
            }
            Ok(())
        })
        .with_delay(delay);
        harness.register(
            async_whitelist(ListenerPriority::Normal, packet_types::server(i32::from(tag) + 1)),
            listener,
        );
    }

    let mut indices = Vec::new();
    for tag in 0..10u8 {
        let packet = tagged(packet_types::server(i32::from(tag) + 1), tag);
        match harness.dispatch(packet).await {
            DispatchOutcome::Queued { sending_index } => indices.push(sending_index),
            other => panic!("packet {tag} was not queued: {other:?}"),
        }
    }
    assert_eq!(indices, (1..=10).collect::<Vec<u64>>());

    assert!(harness.wait_for_transmitted(9).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.connection.transmitted_tags(), vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
    assert_eq!(harness.metrics.dropped(DropReason::Cancelled), 1);
    assert_eq!(harness.interceptor.pipeline().in_flight(), 0);
}

/// Async listeners see the packet as the synchronous listeners left it.
#[tokio::test]
async fn test_async_chain_runs_after_sync_listeners() {
    let harness = InterceptorTestHarness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let async_seen = seen.clone();
    harness.register(
        async_whitelist(ListenerPriority::Lowest, packet_types::CHAT),
        FnAsyncListener::new("async", move |event| {
            async_seen.lock().push(tag_of(event.packet()));
            event.packet_mut()?.set_body(vec![3u8]);
            Ok(())
        }),
    );
    harness.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::Highest)
            .packet_type(packet_types::CHAT)
            .build(),
        FnListener::new("sync", |event| {
            event.packet_mut()?.set_body(vec![2u8]);
            Ok(())
        }),
    );

    let outcome = harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
    assert!(harness.wait_for_transmitted(1).await);

    assert_eq!(*seen.lock(), vec![2]);
    assert_eq!(harness.connection.transmitted_tags(), vec![3]);
}

/// Monitor async listeners are read-only too.
#[tokio::test]
async fn test_async_monitor_is_read_only() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        async_whitelist(ListenerPriority::Monitor, packet_types::CHAT),
        FnAsyncListener::new("async-monitor", |event| {
            let _ = event.cancel();
            event.packet_mut()?.set_body(vec![9u8]);
            Ok(())
        }),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(harness.wait_for_transmitted(1).await);

    assert_eq!(harness.connection.transmitted_tags(), vec![1]);
    let reports = harness.reporter.reports_for("async-monitor");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, "on_async_packet");
    assert_eq!(reports[0].error.kind(), "read_only");
}

// =============================================================================
// Concurrency bound
// =============================================================================

/// No more callbacks run at once than the configured permits allow.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound() {
    let harness = TestHarnessBuilder::new().max_concurrency(2).build();
    let gate = Gate::new();
    let gauge = ConcurrencyGauge::new();

    for id in 1..=10 {
        harness.register(
            async_whitelist(ListenerPriority::Normal, packet_types::server(id)),
            GatedListener::new(format!("blocker-{id}"), gate.clone(), gauge.clone()),
        );
    }
    for id in 1..=10u8 {
        harness.dispatch(tagged(packet_types::server(i32::from(id)), id)).await;
    }

    assert!(gauge.wait_entered(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gauge.current(), 2);
    assert_eq!(gauge.entered(), 2);

    gate.open();
    assert!(harness.wait_for_transmitted(10).await);

    assert_eq!(gauge.peak(), 2);
    assert_eq!(gauge.entered(), 10);
    assert_eq!(harness.connection.transmitted_tags(), (1..=10).collect::<Vec<u8>>());
}

// =============================================================================
// Listener removal
// =============================================================================

/// A packet queued for a removed listener is dropped, not passed on.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_removal_mid_flight() {
    let harness = InterceptorTestHarness::new();
    let gate = Gate::new();
    let gauge = ConcurrencyGauge::new();
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let last_seen = Arc::new(Mutex::new(Vec::new()));

    harness.register(
        async_whitelist(ListenerPriority::Low, packet_types::CHAT),
        FnAsyncListener::new("l1", recorder(&first_seen)),
    );
    let middle = harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("l2", gate.clone(), gauge.clone()),
    );
    harness.register(
        async_whitelist(ListenerPriority::High, packet_types::CHAT),
        FnAsyncListener::new("l3", recorder(&last_seen)),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    harness.dispatch(tagged(packet_types::CHAT, 2)).await;

    // Packet 1 is inside l2, packet 2 waits in l2's queue.
    assert!(gauge.wait_entered(1, WAIT).await);
    while first_seen.lock().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(middle.unregister().is_empty());
    gate.open();

    assert!(harness.wait_for_transmitted(1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.connection.transmitted_tags(), vec![1]);
    assert_eq!(*last_seen.lock(), vec![1]);
    assert_eq!(gauge.entered(), 1);
    assert_eq!(harness.metrics.dropped(DropReason::ListenerRemoved), 1);
    assert!(harness.reporter.reports().is_empty());
}

/// A worker stopped by a fatal error is deregistered and skipped from then on.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_async_listener_stops_its_worker() {
    let harness = InterceptorTestHarness::new();
    let registration = harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnAsyncListener::new("fragile", |event| {
            if tag_of(event.packet()) == 1 {
                return Err(ListenerError::Fatal("stack overflow".into()));
            }
            Ok(())
        }),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(wait_until(|| !registration.is_active()).await);

    let pipeline = harness.interceptor.pipeline();
    assert!(!pipeline.has_listener(registration.id()));
    assert_eq!(pipeline.worker_count(), 0);
    assert!(!harness.interceptor.is_intercepted(&packet_types::CHAT));

    // Nothing intercepts CHAT any more, so the packet comes straight back.
    let outcome = harness.dispatch(tagged(packet_types::CHAT, 2)).await;
    assert!(matches!(outcome, DispatchOutcome::Forward(_)));
    assert_eq!(harness.connection.transmitted_tags(), vec![2]);
    assert_eq!(harness.metrics.dropped(DropReason::ListenerFailed), 1);

    let reports = harness.reporter.reports_for("fragile");
    assert_eq!(reports.len(), 1);
    assert!(reports[0].error.is_fatal());
}

// =============================================================================
// Timeout
// =============================================================================

/// An expired head is dropped and reported so later packets can leave.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_packet_is_dropped() {
    let harness = TestHarnessBuilder::new()
        .timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(10))
        .build();
    let gate = Gate::new();

    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("stuck", gate.clone(), ConcurrencyGauge::new()),
    );
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::SOUND),
        FnAsyncListener::new("quick", |_| Ok(())),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    harness.dispatch(tagged(packet_types::SOUND, 2)).await;

    assert!(harness.wait_for_transmitted(1).await);
    assert_eq!(harness.connection.transmitted_tags(), vec![2]);

    let reports = harness.reporter.reports_for_operation("timeout");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].owner, PIPELINE_OWNER);
    assert!(matches!(
        reports[0].error,
        ListenerError::Intercept(InterceptError::TimedOut { sending_index: 1, .. })
    ));
    assert_eq!(harness.metrics.dropped(DropReason::Timeout), 1);

    // Finishing late changes nothing.
    gate.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.connection.transmitted_tags(), vec![2]);
    assert_eq!(harness.reporter.reports_for_operation("timeout").len(), 1);
}

/// Timeout handlers see the expired head once, as it entered the pipeline.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_handler_sees_expired_packet_once() {
    let harness = TestHarnessBuilder::new()
        .timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(10))
        .build();
    let gate = Gate::new();
    let expired = Arc::new(Mutex::new(Vec::new()));

    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("stuck", gate.clone(), ConcurrencyGauge::new()),
    );
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::SOUND),
        FnAsyncListener::new("quick", |_| Ok(())),
    );
    let handler = harness
        .interceptor
        .register_timeout_handler(
            ListeningWhitelist::builder().packet_type(packet_types::CHAT).build(),
            Arc::new(FnListener::new("on-timeout", recorder(&expired))),
        )
        .unwrap();
    assert_eq!(harness.interceptor.timeout_handlers().len(), 1);

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    harness.dispatch(tagged(packet_types::SOUND, 2)).await;

    assert!(harness.wait_for_transmitted(1).await);
    assert!(wait_until(|| !expired.lock().is_empty()).await);
    assert_eq!(*expired.lock(), vec![1]);
    assert_eq!(harness.metrics.dropped(DropReason::Timeout), 1);

    gate.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.interceptor.sweep();
    assert_eq!(*expired.lock(), vec![1]);
    assert_eq!(harness.connection.transmitted_tags(), vec![2]);

    assert!(harness.interceptor.unregister_timeout_handler(handler));
    assert!(!harness.interceptor.unregister_timeout_handler(handler));
    assert!(harness.interceptor.timeout_handlers().is_empty());
}

// =============================================================================
// Processing delay
// =============================================================================

/// A deferred packet keeps its place in line without holding a permit, and
/// moves on only after every delay is released.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_packet_keeps_its_sending_index() {
    let harness = TestHarnessBuilder::new().max_concurrency(1).build();
    let delays: Arc<Mutex<Vec<ProcessingDelay>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_index = Arc::new(Mutex::new(None));
    let later = Arc::new(Mutex::new(Vec::new()));

    {
        let delays = delays.clone();
        let seen_index = seen_index.clone();
        harness.register(
            async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
            FnAsyncListener::new("holder", move |event| {
                let first = event.defer()?;
                let second = event.defer()?;
                *seen_index.lock() = event.async_marker().map(|marker| marker.sending_index());
                assert_eq!(event.async_marker().map(|marker| marker.processing_delay()), Some(2));
                delays.lock().extend([first, second]);
                Ok(())
            }),
        );
    }
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::SOUND),
        FnAsyncListener::new("after", recorder(&later)),
    );

    let first = harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(matches!(first, DispatchOutcome::Queued { sending_index: 1 }));
    harness.dispatch(tagged(packet_types::SOUND, 2)).await;

    // The only permit is free again, so the second packet gets processed.
    assert!(wait_until(|| !later.lock().is_empty()).await);
    assert!(wait_until(|| harness.interceptor.pipeline().deferred_count() == 1).await);
    assert_eq!(*seen_index.lock(), Some(1));
    assert_eq!(harness.interceptor.pipeline().in_flight(), 2);

    let mut held = std::mem::take(&mut *delays.lock());
    assert_eq!(held.len(), 2);
    assert!(held.iter().all(|delay| delay.sending_index() == 1));

    held.pop().unwrap().release();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.connection.transmitted_tags().is_empty());

    drop(held);
    assert!(harness.wait_for_transmitted(2).await);
    assert_eq!(harness.connection.transmitted_tags(), vec![1, 2]);
    assert_eq!(harness.interceptor.pipeline().deferred_count(), 0);
}

/// A deferred packet that runs out of time is dropped like any other.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_packet_expires() {
    let harness = TestHarnessBuilder::new()
        .timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(10))
        .build();
    let delays: Arc<Mutex<Vec<ProcessingDelay>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let delays = delays.clone();
        harness.register(
            async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
            FnAsyncListener::new("forgetful", move |event| {
                delays.lock().push(event.defer()?);
                Ok(())
            }),
        );
    }

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(wait_until(|| harness.metrics.dropped(DropReason::Timeout) == 1).await);
    assert!(wait_until(|| harness.interceptor.pipeline().deferred_count() == 0).await);

    // Releasing afterwards is harmless.
    delays.lock().clear();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.connection.transmitted_tags().is_empty());
    assert_eq!(harness.interceptor.pipeline().in_flight(), 0);
}

// =============================================================================
// Queue-full policies
// =============================================================================

/// A full listener queue drops the packet and reports it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_listener_queue_drops() {
    let harness = TestHarnessBuilder::new().listener_queue_capacity(1).build();
    let gate = Gate::new();
    let gauge = ConcurrencyGauge::new();
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("slow", gate.clone(), gauge.clone()),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    assert!(gauge.wait_entered(1, WAIT).await);
    let second = harness.dispatch(tagged(packet_types::CHAT, 2)).await;
    let third = harness.dispatch(tagged(packet_types::CHAT, 3)).await;

    assert!(matches!(second, DispatchOutcome::Queued { sending_index: 2 }));
    assert!(matches!(third, DispatchOutcome::Dropped));

    let reports = harness.reporter.reports_for("slow");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, "enqueue");
    assert!(matches!(
        reports[0].error,
        ListenerError::Intercept(InterceptError::QueueFull {
            queue: "listener",
            capacity: 1
        })
    ));

    gate.open();
    assert!(harness.wait_for_transmitted(2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.connection.transmitted_tags(), vec![1, 2]);
    assert_eq!(harness.metrics.dropped(DropReason::QueueFull), 1);
}

/// A full sending queue refuses the packet before it takes an index.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_sending_queue_drops() {
    let harness = TestHarnessBuilder::new().sending_queue_capacity(2).build();
    let gate = Gate::new();
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("slow", gate.clone(), ConcurrencyGauge::new()),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    harness.dispatch(tagged(packet_types::CHAT, 2)).await;
    let third = harness.dispatch(tagged(packet_types::CHAT, 3)).await;

    assert!(matches!(third, DispatchOutcome::Dropped));
    assert_eq!(harness.metrics.dropped(DropReason::QueueFull), 1);
    let reports = harness.reporter.reports_for(PIPELINE_OWNER);
    assert_eq!(reports.len(), 1);
    assert!(matches!(
        reports[0].error,
        ListenerError::Intercept(InterceptError::QueueFull { queue: "sending", .. })
    ));

    gate.open();
    assert!(harness.wait_for_transmitted(2).await);
    assert_eq!(harness.connection.transmitted_tags(), vec![1, 2]);

    // Room again once the first packets are gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fourth = harness.dispatch(tagged(packet_types::CHAT, 4)).await;
    assert!(matches!(fourth, DispatchOutcome::Queued { sending_index: 3 }));
}

/// The block policy waits for room instead of dropping.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_policy_is_lossless() {
    let harness = TestHarnessBuilder::new()
        .listener_queue_capacity(1)
        .queue_full_policy(QueueFullPolicy::Block)
        .build();
    let gate = Gate::new();
    let gauge = ConcurrencyGauge::new();
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("slow", gate.clone(), gauge.clone()),
    );

    let dispatching = async {
        for tag in 1..=3 {
            let outcome = harness.dispatch(tagged(packet_types::CHAT, tag)).await;
            assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        }
    };
    let releasing = async {
        assert!(gauge.wait_entered(1, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();
    };
    tokio::join!(dispatching, releasing);

    assert!(harness.wait_for_transmitted(3).await);
    assert_eq!(harness.connection.transmitted_tags(), vec![1, 2, 3]);
    assert!(harness.reporter.reports().is_empty());
    assert_eq!(harness.metrics.dropped(DropReason::QueueFull), 0);
}

// =============================================================================
// Connection removal and shutdown
// =============================================================================

/// Removing a connection drops what it still has in flight.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_connection_drops_in_flight() {
    let harness = InterceptorTestHarness::new();
    let gate = Gate::new();
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("slow", gate.clone(), ConcurrencyGauge::new()),
    );

    harness.dispatch(tagged(packet_types::CHAT, 1)).await;
    harness.dispatch(tagged(packet_types::CHAT, 2)).await;
    assert_eq!(harness.interceptor.pipeline().in_flight(), 2);

    harness.interceptor.remove_connection(ConnectionId(1));
    assert_eq!(harness.metrics.dropped(DropReason::Disconnected), 2);
    assert_eq!(harness.interceptor.pipeline().in_flight(), 0);

    gate.open();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.connection.transmitted().is_empty());
}

/// Shutdown drops every packet in flight and refuses new registrations.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drops_in_flight() {
    let harness = InterceptorTestHarness::new();
    let gate = Gate::new();
    let gauge = ConcurrencyGauge::new();
    harness.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        GatedListener::new("slow", gate.clone(), gauge.clone()),
    );

    for tag in 1..=3 {
        harness.dispatch(tagged(packet_types::CHAT, tag)).await;
    }
    assert!(gauge.wait_entered(1, WAIT).await);

    let releasing = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.open();
    };
    tokio::join!(harness.shutdown(), releasing);

    assert!(harness.connection.transmitted().is_empty());
    assert_eq!(harness.metrics.dropped(DropReason::Shutdown), 3);
    assert_eq!(harness.interceptor.pipeline().worker_count(), 0);
    assert!(harness.interceptor.registrations().is_empty());

    let result = harness.interceptor.register(
        async_whitelist(ListenerPriority::Normal, packet_types::CHAT),
        Arc::new(FnAsyncListener::new("late", |_| Ok(()))),
    );
    assert!(matches!(result, Err(InterceptError::Shutdown)));
}
