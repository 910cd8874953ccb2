//! Listening whitelists.
//!
//! A whitelist names the packet types one registration wants, the priority it
//! runs at, and how it should be invoked.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::protocol::{PacketType, Sender};

use super::ListenerPriority;

/// How a listener treats packets that arrive inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleBehavior {
    /// Receive packets both inside and outside bundles.
    #[default]
    Always,
    /// Ignore packets unwrapped from a bundle.
    SkipInsideBundle,
    /// Only receive packets unwrapped from a bundle.
    SkipOutsideBundle,
}

impl BundleBehavior {
    /// Whether an event with the given bundle membership should be delivered.
    #[must_use]
    pub fn accepts(self, in_bundle: bool) -> bool {
        match self {
            Self::Always => true,
            Self::SkipInsideBundle => !in_bundle,
            Self::SkipOutsideBundle => in_bundle,
        }
    }
}

/// Invocation options of a whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ListenerOptions {
    /// Run the listener on its own worker instead of the ingress thread.
    #[serde(default)]
    pub asynchronous: bool,

    /// Deliver packets that an earlier listener cancelled.
    #[serde(default)]
    pub include_cancelled: bool,

    #[serde(default)]
    pub bundle: BundleBehavior,
}

/// The packet types, priority and options of one listener registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListeningWhitelist {
    priority: ListenerPriority,
    types: BTreeSet<PacketType>,
    options: ListenerOptions,
}

impl ListeningWhitelist {
    /// Start building a whitelist.
    #[must_use]
    pub fn builder() -> ListeningWhitelistBuilder {
        ListeningWhitelistBuilder::default()
    }

    #[must_use]
    pub fn priority(&self) -> ListenerPriority {
        self.priority
    }

    #[must_use]
    pub fn types(&self) -> &BTreeSet<PacketType> {
        &self.types
    }

    #[must_use]
    pub fn options(&self) -> ListenerOptions {
        self.options
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.options.asynchronous
    }

    #[must_use]
    pub fn include_cancelled(&self) -> bool {
        self.options.include_cancelled
    }

    #[must_use]
    pub fn bundle_behavior(&self) -> BundleBehavior {
        self.options.bundle
    }

    #[must_use]
    pub fn contains(&self, packet_type: &PacketType) -> bool {
        self.types.contains(packet_type)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Packet types sent by `sender`.
    ///
    /// `Sender::Client` yields the receiving side of the registration and
    /// `Sender::Server` the sending side.
    pub fn types_from(&self, sender: Sender) -> impl Iterator<Item = &PacketType> + '_ {
        self.types
            .iter()
            .filter(move |packet_type| packet_type.sender == sender)
    }

    /// Remove every type for which `keep` returns `false`; returns the removed types.
    pub fn retain_types(&mut self, mut keep: impl FnMut(&PacketType) -> bool) -> Vec<PacketType> {
        let removed: Vec<PacketType> = self.types.iter().filter(|t| !keep(*t)).copied().collect();
        for packet_type in &removed {
            self.types.remove(packet_type);
        }
        removed
    }
}

/// Builder for [`ListeningWhitelist`].
#[derive(Debug, Default)]
pub struct ListeningWhitelistBuilder {
    whitelist: ListeningWhitelist,
}

impl ListeningWhitelistBuilder {
    #[must_use]
    pub fn priority(mut self, priority: ListenerPriority) -> Self {
        self.whitelist.priority = priority;
        self
    }

    #[must_use]
    pub fn types(mut self, types: impl IntoIterator<Item = PacketType>) -> Self {
        self.whitelist.types.extend(types);
        self
    }

    #[must_use]
    pub fn packet_type(mut self, packet_type: PacketType) -> Self {
        self.whitelist.types.insert(packet_type);
        self
    }

    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.whitelist.options.asynchronous = true;
        self
    }

    #[must_use]
    pub fn include_cancelled(mut self) -> Self {
        self.whitelist.options.include_cancelled = true;
        self
    }

    #[must_use]
    pub fn bundle_behavior(mut self, bundle: BundleBehavior) -> Self {
        self.whitelist.options.bundle = bundle;
        self
    }

    #[must_use]
    pub fn options(mut self, options: ListenerOptions) -> Self {
        self.whitelist.options = options;
        self
    }

    #[must_use]
    pub fn build(self) -> ListeningWhitelist {
        self.whitelist
    }
}
