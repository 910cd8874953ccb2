//! In-memory connection that records what the pipeline transmits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::{Connection, ConnectionId};
use crate::error::ConnectionError;
use crate::protocol::Packet;

/// Connection that keeps every packet handed to it.
#[derive(Debug)]
pub struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Packet>>,
    received: Mutex<Vec<Packet>>,
    transmitted: Mutex<Vec<Packet>>,
    failing: AtomicBool,
    transmit_notify: Notify,
}

impl RecordingConnection {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id: ConnectionId(id),
            sent: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            transmitted: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            transmit_notify: Notify::new(),
        }
    }

    /// Packets delivered towards the client.
    #[must_use]
    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    /// Packets delivered towards the server.
    #[must_use]
    pub fn received(&self) -> Vec<Packet> {
        self.received.lock().clone()
    }

    /// Every delivered packet, in delivery order, regardless of direction.
    #[must_use]
    pub fn transmitted(&self) -> Vec<Packet> {
        self.transmitted.lock().clone()
    }

    /// First body byte of every delivered packet. Handy for ordering checks.
    #[must_use]
    pub fn transmitted_tags(&self) -> Vec<u8> {
        self.transmitted
            .lock()
            .iter()
            .filter_map(|packet| packet.body().and_then(|body| body.first().copied()))
            .collect()
    }

    /// Make every following delivery fail as if the connection were closed.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Wait until at least `count` packets were delivered.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.transmit_notify.notified();
                if self.transmitted.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn deliver(&self, target: &Mutex<Vec<Packet>>, packet: Packet) -> Result<(), ConnectionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed(self.id));
        }
        self.transmitted.lock().push(packet.clone());
        target.lock().push(packet);
        self.transmit_notify.notify_waiters();
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.deliver(&self.sent, packet)
    }

    fn receive(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.deliver(&self.received, packet)
    }
}
