//! Integration tests for listener registration and synchronous dispatch.

use std::sync::Arc;

use parking_lot::Mutex;

use packet_interceptor_core::concurrent::SortedCopyOnWriteSet;
use packet_interceptor_core::error::{InterceptError, ListenerError};
use packet_interceptor_core::listener::{ListenerPriority, ListeningWhitelist};
use packet_interceptor_core::testing::{packet_types, FnListener, InterceptorTestHarness};
use packet_interceptor_core::{DispatchOutcome, Interceptor, InterceptorConfig, Packet, PacketType};

type CallLog = Arc<Mutex<Vec<&'static str>>>;

fn whitelist(priority: ListenerPriority, packet_type: PacketType) -> ListeningWhitelist {
    ListeningWhitelist::builder()
        .priority(priority)
        .packet_type(packet_type)
        .build()
}

/// Register a listener that appends `name` to `log` and does nothing else.
fn register_logged(
    harness: &InterceptorTestHarness,
    log: &CallLog,
    name: &'static str,
    priority: ListenerPriority,
) -> packet_interceptor_core::Registration {
    let log = log.clone();
    harness.register(
        whitelist(priority, packet_types::CHAT),
        FnListener::new(name, move |_| {
            log.lock().push(name);
            Ok(())
        }),
    )
}

fn chat(body: &'static [u8]) -> Packet {
    Packet::new(packet_types::CHAT, body)
}

// =============================================================================
// Ordering of listeners
// =============================================================================

/// Lower priorities run first, whatever the registration order.
#[tokio::test]
async fn test_priority_ordering_independent_of_registration_order() {
    let orders = [
        [ListenerPriority::Low, ListenerPriority::Normal, ListenerPriority::High],
        [ListenerPriority::High, ListenerPriority::Normal, ListenerPriority::Low],
    ];

    for order in orders {
        let harness = InterceptorTestHarness::new();
        let log = CallLog::default();
        for priority in order {
            register_logged(&harness, &log, priority.as_str(), priority);
        }

        harness.dispatch(chat(b"hello")).await;
        assert_eq!(*log.lock(), vec!["low", "normal", "high"]);
    }
}

/// Equal priorities keep registration order across unrelated changes.
#[tokio::test]
async fn test_equal_priority_is_stable() {
    let harness = InterceptorTestHarness::new();
    let log = CallLog::default();

    register_logged(&harness, &log, "a", ListenerPriority::Normal);
    register_logged(&harness, &log, "b", ListenerPriority::Normal);
    register_logged(&harness, &log, "c", ListenerPriority::High);
    let lowest = register_logged(&harness, &log, "d", ListenerPriority::Lowest);

    harness.dispatch(chat(b"1")).await;
    assert_eq!(*log.lock(), vec!["d", "a", "b", "c"]);

    log.lock().clear();
    lowest.unregister();
    register_logged(&harness, &log, "e", ListenerPriority::Normal);

    harness.dispatch(chat(b"2")).await;
    assert_eq!(*log.lock(), vec!["a", "b", "e", "c"]);
}

/// A snapshot taken before a removal still yields the removed element.
#[test]
fn test_snapshot_iteration() {
    let set = SortedCopyOnWriteSet::new();
    set.add("A", ListenerPriority::Low);
    set.add("B", ListenerPriority::Normal);
    set.add("C", ListenerPriority::High);

    let before = set.iter();
    assert!(set.remove(&"B"));

    assert_eq!(before.collect::<Vec<_>>(), vec!["A", "B", "C"]);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec!["A", "C"]);
}

// =============================================================================
// Cancellation and read-only enforcement
// =============================================================================

/// Listeners after a cancellation only see the packet if they asked to.
#[tokio::test]
async fn test_cancellation_propagation() {
    let harness = InterceptorTestHarness::new();
    let log = CallLog::default();

    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnListener::new("censor", |event| Ok(event.cancel()?)),
    );
    register_logged(&harness, &log, "plain", ListenerPriority::High);

    let observer_log = log.clone();
    harness.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::Highest)
            .packet_type(packet_types::CHAT)
            .include_cancelled()
            .build(),
        FnListener::new("auditor", move |event| {
            assert!(event.is_cancelled());
            observer_log.lock().push("auditor");
            Ok(())
        }),
    );

    let outcome = harness.dispatch(chat(b"rude")).await;

    assert!(matches!(outcome, DispatchOutcome::Cancelled));
    assert_eq!(*log.lock(), vec!["auditor"]);
    assert!(harness.connection.transmitted().is_empty());
    assert!(harness.reporter.reports().is_empty());
}

/// A listener can revive a cancelled packet if it opted into seeing it.
#[tokio::test]
async fn test_uncancel_restores_delivery() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Low, packet_types::CHAT),
        FnListener::new("censor", |event| Ok(event.cancel()?)),
    );
    harness.register(
        ListeningWhitelist::builder()
            .priority(ListenerPriority::High)
            .packet_type(packet_types::CHAT)
            .include_cancelled()
            .build(),
        FnListener::new("appeal", |event| Ok(event.set_cancelled(false)?)),
    );

    let outcome = harness.dispatch(chat(b"ok")).await;
    assert!(matches!(outcome, DispatchOutcome::Forward(_)));
    assert_eq!(harness.connection.sent().len(), 1);
}

/// Monitor listeners cannot change the packet, its body or its state.
#[tokio::test]
async fn test_monitor_cannot_mutate() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Monitor, packet_types::CHAT),
        FnListener::new("sneaky", |event| {
            if let Ok(packet) = event.packet_mut() {
                packet.set_body(&b"tampered"[..]);
            }
            let _ = event.set_packet(Packet::new(packet_types::CHAT, &b"replaced"[..]));
            let _ = event.cancel();
            Ok(())
        }),
    );

    let outcome = harness.dispatch(chat(b"original")).await;

    let DispatchOutcome::Forward(packet) = outcome else {
        panic!("expected the packet to be forwarded, got {outcome:?}");
    };
    assert_eq!(packet.body().map(|body| &body[..]), Some(&b"original"[..]));

    let reports = harness.reporter.reports_for("sneaky");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].error.kind(), "read_only");
}

/// A replacement of another packet type is rejected and the original kept.
#[tokio::test]
async fn test_packet_type_change_is_rejected() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnListener::new("swapper", |event| {
            event.set_packet(Packet::new(packet_types::SOUND, &b"boom"[..]))?;
            Ok(())
        }),
    );

    let outcome = harness.dispatch(chat(b"keep")).await;
    let DispatchOutcome::Forward(packet) = outcome else {
        panic!("expected the packet to be forwarded, got {outcome:?}");
    };
    assert_eq!(packet.packet_type(), packet_types::CHAT);

    let reports = harness.reporter.reports_for("swapper");
    assert_eq!(reports.len(), 1);
    assert!(matches!(
        reports[0].error,
        ListenerError::Intercept(InterceptError::PacketTypeChanged { .. })
    ));
}

// =============================================================================
// Bundles
// =============================================================================

/// A bundle whose every sub-packet is cancelled is cancelled itself.
#[tokio::test]
async fn test_bundle_all_cancelled() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        ListeningWhitelist::builder()
            .types([packet_types::CHAT, packet_types::SOUND, packet_types::ENTITY_MOVE])
            .build(),
        FnListener::new("silencer", |event| Ok(event.cancel()?)),
    );

    let bundle = Packet::bundle(
        packet_types::BUNDLE,
        vec![
            Packet::new(packet_types::CHAT, &b"c"[..]),
            Packet::new(packet_types::SOUND, &b"s"[..]),
            Packet::new(packet_types::ENTITY_MOVE, &b"m"[..]),
        ],
    );
    let outcome = harness.dispatch(bundle).await;

    assert!(matches!(outcome, DispatchOutcome::Cancelled));
    assert!(harness.connection.transmitted().is_empty());
}

/// Surviving sub-packets are reassembled in their original order.
#[tokio::test]
async fn test_bundle_partial_cancellation() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::SOUND),
        FnListener::new("mute", |event| Ok(event.cancel()?)),
    );

    let bundle = Packet::bundle(
        packet_types::BUNDLE,
        vec![
            Packet::new(packet_types::CHAT, &b"c"[..]),
            Packet::new(packet_types::SOUND, &b"s"[..]),
            Packet::new(packet_types::ENTITY_MOVE, &b"m"[..]),
        ],
    );
    let DispatchOutcome::Forward(packet) = harness.dispatch(bundle).await else {
        panic!("bundle with survivors must be forwarded");
    };

    let kept: Vec<_> = packet.bundled().iter().map(Packet::packet_type).collect();
    assert_eq!(kept, vec![packet_types::CHAT, packet_types::ENTITY_MOVE]);
}

// =============================================================================
// Error guard
// =============================================================================

/// Failing and panicking listeners are reported once and skipped.
#[tokio::test]
async fn test_listener_failures_do_not_stop_dispatch() {
    let harness = InterceptorTestHarness::new();
    let log = CallLog::default();

    harness.register(
        whitelist(ListenerPriority::Low, packet_types::CHAT),
        FnListener::new("broken", |_| Err(ListenerError::failed("database offline"))),
    );
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnListener::new("panicky", |_| panic!("index out of bounds")),
    );
    register_logged(&harness, &log, "healthy", ListenerPriority::High);

    let outcome = harness.dispatch(chat(b"x")).await;

    assert!(matches!(outcome, DispatchOutcome::Forward(_)));
    assert_eq!(*log.lock(), vec!["healthy"]);
    assert_eq!(harness.reporter.reports_for("broken").len(), 1);
    assert!(matches!(
        harness.reporter.reports_for("panicky")[0].error,
        ListenerError::Panicked(_)
    ));
}

/// Fatal errors are handed back to the caller unreported.
#[tokio::test]
async fn test_fatal_error_propagates() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnListener::new("doomed", |_| Err(ListenerError::Fatal("out of memory".into()))),
    );

    let result = harness
        .interceptor
        .dispatch(harness.connection_handle(), chat(b"x"))
        .await;

    assert!(matches!(result, Err(ListenerError::Fatal(_))));
    assert!(harness.reporter.reports().is_empty());
}

// =============================================================================
// Registration API
// =============================================================================

/// Unknown packet types are reported and left out of the whitelist.
#[tokio::test]
async fn test_unknown_types_are_reported() {
    let harness = InterceptorTestHarness::new();

    let registration = harness
        .interceptor
        .register(
            ListeningWhitelist::builder()
                .types([packet_types::CHAT, packet_types::UNREGISTERED])
                .build(),
            Arc::new(FnListener::new("legacy", |_| Ok(()))),
        )
        .unwrap();

    assert!(registration.is_active());
    assert!(harness.interceptor.is_intercepted(&packet_types::CHAT));
    assert!(!harness.interceptor.is_intercepted(&packet_types::UNREGISTERED));

    let reports = harness.reporter.reports_for("legacy");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].operation, "register");
    assert!(matches!(
        reports[0].error,
        ListenerError::Intercept(InterceptError::UnknownPacketType { id: 0x7f, .. })
    ));
}

/// A whitelist with nothing known left is refused.
#[tokio::test]
async fn test_empty_whitelist_is_rejected() {
    let harness = InterceptorTestHarness::new();

    let result = harness.interceptor.register(
        whitelist(ListenerPriority::Normal, packet_types::UNREGISTERED),
        Arc::new(FnListener::new("legacy", |_| Ok(()))),
    );

    assert!(matches!(result, Err(InterceptError::EmptyWhitelist { .. })));
    assert!(harness.interceptor.registrations().is_empty());
}

/// A configuration beyond the semaphore permit limit is refused at build time.
#[tokio::test]
async fn test_oversized_concurrency_is_rejected() {
    let mut config = InterceptorConfig::default();
    config.pipeline.max_concurrency = usize::MAX;

    let result = Interceptor::builder().config(config).build();
    assert!(matches!(result, Err(InterceptError::InvalidConfig(_))));
}

/// Unregistering reports the types nobody listens to any more.
#[tokio::test]
async fn test_unregister_reports_released_types() {
    let harness = InterceptorTestHarness::new();

    let wide = harness.register(
        ListeningWhitelist::builder()
            .types([packet_types::CHAT, packet_types::SOUND])
            .build(),
        FnListener::new("wide", |_| Ok(())),
    );
    harness.register(
        ListeningWhitelist::builder()
            .packet_type(packet_types::CHAT)
            .asynchronous()
            .build(),
        FnListener::new("narrow", |_| Ok(())),
    );

    let released = wide.unregister();

    assert_eq!(released, vec![packet_types::SOUND]);
    assert!(!wide.is_active());
    assert_eq!(
        harness.interceptor.intercepted_types().into_iter().collect::<Vec<_>>(),
        vec![packet_types::CHAT]
    );
    assert!(wide.unregister().is_empty());
}

/// Every registration of one owner can be removed at once.
#[tokio::test]
async fn test_unregister_owner() {
    let harness = InterceptorTestHarness::new();
    for packet_type in [packet_types::CHAT, packet_types::SOUND] {
        harness.register(
            whitelist(ListenerPriority::Normal, packet_type),
            FnListener::new("plugin-a", |_| Ok(())),
        );
    }
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CHAT),
        FnListener::new("plugin-b", |_| Ok(())),
    );

    assert_eq!(harness.interceptor.unregister_owner("plugin-a"), 2);

    let owners: Vec<_> = harness
        .interceptor
        .registrations()
        .iter()
        .map(|handle| handle.owner().to_string())
        .collect();
    assert_eq!(owners, vec!["plugin-b"]);
    assert!(!harness.interceptor.is_intercepted(&packet_types::SOUND));
}

/// Client-bound packets are routed to the server side of the connection.
#[tokio::test]
async fn test_client_packets_are_received() {
    let harness = InterceptorTestHarness::new();
    harness.register(
        whitelist(ListenerPriority::Normal, packet_types::CLIENT_CHAT),
        FnListener::new("command-parser", |event| {
            event.packet_mut()?.set_body(&b"/help"[..]);
            Ok(())
        }),
    );

    harness
        .dispatch(Packet::new(packet_types::CLIENT_CHAT, &b"help"[..]))
        .await;

    let received = harness.connection.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body().map(|body| &body[..]), Some(&b"/help"[..]));
    assert!(harness.connection.sent().is_empty());
}
