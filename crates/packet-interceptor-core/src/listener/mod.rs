//! Packet listeners and their registrations.
//!
//! A listener is plugin code that observes, mutates or cancels packets of the
//! types named in its [`ListeningWhitelist`]. Synchronous listeners run on the
//! ingress thread through [`PacketListener::on_packet`]; asynchronous ones run
//! on a dedicated worker through [`PacketListener::on_async_packet`].

mod priority;
mod whitelist;

pub use priority::ListenerPriority;
pub use whitelist::{BundleBehavior, ListenerOptions, ListeningWhitelist, ListeningWhitelistBuilder};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ListenerResult;
use crate::event::PacketEvent;

/// Plugin callback invoked for every whitelisted packet.
#[async_trait]
pub trait PacketListener: Send + Sync {
    /// Identity of the plugin that owns this listener, used when reporting
    /// failures.
    fn owner(&self) -> &str;

    /// Handle a packet on the ingress thread.
    fn on_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        let _ = event;
        Ok(())
    }

    /// Handle a packet on this listener's worker.
    ///
    /// Defaults to running [`on_packet`](Self::on_packet).
    async fn on_async_packet(&self, event: &mut PacketEvent) -> ListenerResult {
        self.on_packet(event)
    }
}

/// Identifier of one registration, unique within an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A listener together with the whitelist it was registered under.
///
/// Two registrations are equal when their ids match, so the same callback
/// object may be registered more than once.
pub struct RegisteredListener {
    id: ListenerId,
    owner: String,
    whitelist: ListeningWhitelist,
    listener: Arc<dyn PacketListener>,
}

impl RegisteredListener {
    pub(crate) fn new(
        id: ListenerId,
        whitelist: ListeningWhitelist,
        listener: Arc<dyn PacketListener>,
    ) -> Self {
        Self {
            id,
            owner: listener.owner().to_string(),
            whitelist,
            listener,
        }
    }

    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn whitelist(&self) -> &ListeningWhitelist {
        &self.whitelist
    }

    #[must_use]
    pub fn priority(&self) -> ListenerPriority {
        self.whitelist.priority()
    }

    #[must_use]
    pub fn listener(&self) -> &Arc<dyn PacketListener> {
        &self.listener
    }

    /// Whether this listener wants to see `event` in its current state.
    #[must_use]
    pub fn accepts(&self, event: &PacketEvent) -> bool {
        if event.is_cancelled() && !self.whitelist.include_cancelled() {
            return false;
        }
        self.whitelist.bundle_behavior().accepts(event.in_bundle())
    }
}

impl PartialEq for RegisteredListener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for RegisteredListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredListener")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

/// Shared handle to a registration, as stored in the listener collections.
pub type ListenerHandle = Arc<RegisteredListener>;
