//! Priority-sorted copy-on-write set.
//!
//! Listener chains change orders of magnitude less often than packets flow, so
//! reads hand out an immutable snapshot (`Arc<[T]>`) and writes rebuild the
//! backing array under a lock.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// A snapshot of a [`SortedCopyOnWriteSet`].
///
/// Later mutations of the set never affect an existing snapshot.
pub type Snapshot<T> = Arc<[T]>;

/// A set ordered by `(key ascending, insertion order)`.
///
/// Elements are compared by identity through `PartialEq`; adding an element
/// that is already present is a no-op.
#[derive(Debug)]
pub struct SortedCopyOnWriteSet<T, K> {
    entries: RwLock<Snapshot<(K, T)>>,
    elements: RwLock<Snapshot<T>>,
    write_lock: Mutex<()>,
}

impl<T, K> SortedCopyOnWriteSet<T, K>
where
    T: Clone + PartialEq,
    K: Ord + Clone,
{
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
            elements: RwLock::new(Arc::from(Vec::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert `element` ordered by `key`.
    ///
    /// The element goes before the first entry whose key is strictly greater,
    /// so equal keys keep their insertion order. Returns `false` if the element
    /// was already present.
    pub fn add(&self, element: T, key: K) -> bool {
        let _guard = self.write_lock.lock();
        let current = Arc::clone(&self.entries.read());

        if current.iter().any(|(_, existing)| *existing == element) {
            return false;
        }

        let insert_at = current
            .iter()
            .position(|(existing, _)| key < *existing)
            .unwrap_or(current.len());

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend_from_slice(&current[..insert_at]);
        next.push((key, element));
        next.extend_from_slice(&current[insert_at..]);

        self.publish(next);
        true
    }

    /// Remove `element`. Returns `false` if it was not present.
    pub fn remove(&self, element: &T) -> bool {
        let _guard = self.write_lock.lock();
        let current = Arc::clone(&self.entries.read());

        let Some(index) = current.iter().position(|(_, existing)| existing == element) else {
            return false;
        };

        let mut next = Vec::with_capacity(current.len() - 1);
        next.extend_from_slice(&current[..index]);
        next.extend_from_slice(&current[index + 1..]);

        self.publish(next);
        true
    }

    /// Ordered snapshot of the current elements.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<T> {
        Arc::clone(&self.elements.read())
    }

    /// Iterate over a snapshot taken now.
    #[must_use]
    pub fn iter(&self) -> SnapshotIter<T> {
        SnapshotIter::new(self.snapshot())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, element: &T) -> bool {
        self.elements.read().contains(element)
    }

    fn publish(&self, next: Vec<(K, T)>) {
        let elements: Vec<T> = next.iter().map(|(_, element)| element.clone()).collect();
        *self.entries.write() = Arc::from(next);
        *self.elements.write() = Arc::from(elements);
    }
}

impl<T, K> Default for SortedCopyOnWriteSet<T, K>
where
    T: Clone + PartialEq,
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Owning iterator over a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotIter<T> {
    snapshot: Snapshot<T>,
    cursor: usize,
}

impl<T> SnapshotIter<T> {
    #[must_use]
    pub fn new(snapshot: Snapshot<T>) -> Self {
        Self {
            snapshot,
            cursor: 0,
        }
    }

    /// An iterator with no elements.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Arc::from(Vec::new()))
    }
}

impl<T: Clone> Iterator for SnapshotIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.snapshot.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len() - self.cursor;
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for SnapshotIter<T> {}
