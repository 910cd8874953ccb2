//! Listener priorities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordering key for listener invocation.
///
/// Lower priorities run first, so `Highest` listeners see the final state of
/// a packet. `Monitor` runs last of all and may only observe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

impl ListenerPriority {
    /// Every priority in invocation order.
    pub const ALL: [Self; 6] = [
        Self::Lowest,
        Self::Low,
        Self::Normal,
        Self::High,
        Self::Highest,
        Self::Monitor,
    ];

    /// Whether listeners at this priority receive read-only events.
    #[must_use]
    pub fn is_monitor(self) -> bool {
        matches!(self, Self::Monitor)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Highest => "highest",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for ListenerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
