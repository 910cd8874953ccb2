//! Listener collections safe to read while being modified.
//!
//! - [`SortedCopyOnWriteSet`] orders one packet type's listeners by priority
//! - [`PacketTypeMultiMap`] indexes those sets by packet type

mod multimap;
mod sorted_set;

pub use multimap::PacketTypeMultiMap;
pub use sorted_set::{Snapshot, SnapshotIter, SortedCopyOnWriteSet};
