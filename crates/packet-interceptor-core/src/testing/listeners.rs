//! Listener helpers for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ListenerResult;
use crate::event::PacketEvent;
use crate::listener::PacketListener;
use crate::protocol::Packet;

/// Listener backed by a closure, run the same way on both paths.
pub struct FnListener<F> {
    owner: String,
    callback: F,
}

impl<F> FnListener<F>
where
    F: Fn(&mut PacketEvent) -> ListenerResult + Send + Sync,
{
    pub fn new(owner: impl Into<String>, callback: F) -> Self {
        Self {
            owner: owner.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> PacketListener for FnListener<F>
where
    F: Fn(&mut PacketEvent) -> ListenerResult + Send + Sync,
{
    fn owner(&self) -> &str {
        &self.owner
    }

    fn on_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        (self.callback)(event)
    }
}

/// Async listener that sleeps before running its closure.
pub struct FnAsyncListener<F> {
    owner: String,
    delay: Box<dyn Fn(&PacketEvent) -> Duration + Send + Sync>,
    callback: F,
}

impl<F> FnAsyncListener<F>
where
    F: Fn(&mut PacketEvent) -> ListenerResult + Send + Sync,
{
    pub fn new(owner: impl Into<String>, callback: F) -> Self {
        Self {
            owner: owner.into(),
            delay: Box::new(|_: &PacketEvent| Duration::ZERO),
            callback,
        }
    }

    /// Sleep for the same duration before every packet.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    /// Pick the sleep per packet, e.g. to make early packets finish last.
    #[must_use]
    pub fn with_delay_fn(mut self, delay: impl Fn(&PacketEvent) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }
}

#[async_trait]
impl<F> PacketListener for FnAsyncListener<F>
where
    F: Fn(&mut PacketEvent) -> ListenerResult + Send + Sync,
{
    fn owner(&self) -> &str {
        &self.owner
    }

    fn on_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        (self.callback)(event)
    }

    async fn on_async_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        let delay = (self.delay)(&*event);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.callback)(event)
    }
}

/// Barrier that holds callbacks until it is opened.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts callbacks running at the same time.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug, Default)]
struct GaugeInner {
    current: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicUsize,
    changed: Notify,
}

impl ConcurrencyGauge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a callback as running until the guard is dropped.
    #[must_use]
    pub fn enter(&self) -> GaugeGuard {
        let current = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(current, Ordering::SeqCst);
        self.inner.entered.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
        GaugeGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    /// Highest number of callbacks ever running at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Callbacks started so far.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.inner.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` callbacks have started.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.changed.notified();
                if self.entered() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Running-callback marker handed out by [`ConcurrencyGauge::enter`].
#[derive(Debug)]
pub struct GaugeGuard {
    inner: Arc<GaugeInner>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }
}

/// Async listener that records each packet, then waits on a [`Gate`].
#[derive(Debug)]
pub struct GatedListener {
    owner: String,
    gate: Gate,
    gauge: ConcurrencyGauge,
    seen: Mutex<Vec<Packet>>,
}

impl GatedListener {
    pub fn new(owner: impl Into<String>, gate: Gate, gauge: ConcurrencyGauge) -> Self {
        Self {
            owner: owner.into(),
            gate,
            gauge,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Packets this listener has started processing.
    #[must_use]
    pub fn seen(&self) -> Vec<Packet> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl PacketListener for GatedListener {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn on_async_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        self.seen.lock().push(event.packet().clone());
        let _running = self.gauge.enter();
        self.gate.wait().await;
        Ok(())
    }
}
