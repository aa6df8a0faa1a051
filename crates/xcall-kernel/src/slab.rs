//! Generational handle tables
//!
//! Instances, class handles, and messages live in slabs owned by the kernel.
//! Hosts only ever see `RawHandle`s into them; every use revalidates the
//! generation, so a stale handle fails lookup instead of reaching a reused
//! slot.

use parking_lot::RwLock;
use std::sync::Arc;
use xcall_sdk::RawHandle;

struct Entry<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct SlabInner<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

/// Table of `Arc<T>` cells addressed by generational handles
///
/// Lookups take the read lock only long enough to clone the `Arc`, so a
/// caller may re-enter the slab (for example from inside a handler) while
/// holding a cell.
pub struct Slab<T> {
    inner: RwLock<SlabInner<T>>,
    max_len: Option<usize>,
}

impl<T> Slab<T> {
    /// Create a new empty slab
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a slab that refuses inserts beyond `max_len` live entries
    pub fn with_limit(max_len: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(SlabInner {
                entries: Vec::new(),
                free: Vec::new(),
                len: 0,
            }),
            max_len,
        }
    }

    /// Insert a value built from its own handle
    ///
    /// Returns `None` when the slab is at its limit.
    pub fn insert_with<F>(&self, build: F) -> Option<(RawHandle, Arc<T>)>
    where
        F: FnOnce(RawHandle) -> T,
    {
        let mut inner = self.inner.write();
        if let Some(max) = self.max_len {
            if inner.len >= max {
                return None;
            }
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(inner.entries.len()).ok()?;
                inner.entries.push(Entry {
                    generation: 1,
                    value: None,
                });
                index
            }
        };

        let entry = &mut inner.entries[index as usize];
        let handle = RawHandle::new(index, entry.generation);
        let value = Arc::new(build(handle));
        entry.value = Some(Arc::clone(&value));
        inner.len += 1;
        Some((handle, value))
    }

    /// Insert a value
    pub fn insert(&self, value: T) -> Option<(RawHandle, Arc<T>)> {
        self.insert_with(|_| value)
    }

    /// Get the cell for a handle, if it is still current
    pub fn get(&self, handle: RawHandle) -> Option<Arc<T>> {
        let inner = self.inner.read();
        let entry = inner.entries.get(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.value.clone()
    }

    /// Reclaim a slot, invalidating every outstanding handle to it
    pub fn remove(&self, handle: RawHandle) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let entry = inner.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = if entry.generation >= RawHandle::MAX_GENERATION {
            1
        } else {
            entry.generation + 1
        };
        inner.free.push(handle.index);
        inner.len -= 1;
        Some(value)
    }

    /// Handles of every occupied slot
    pub fn handles(&self) -> Vec<RawHandle> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(index, entry)| RawHandle::new(index as u32, entry.generation))
            .collect()
    }

    /// Get the number of live entries
    pub fn len(&self) -> usize {
        self.inner.read().len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_creation() {
        let slab: Slab<u32> = Slab::new();
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_slab_insert_and_get() {
        let slab = Slab::new();
        let (h1, _) = slab.insert("a").unwrap();
        let (h2, _) = slab.insert("b").unwrap();

        assert_ne!(h1, h2);
        assert_eq!(slab.len(), 2);
        assert_eq!(*slab.get(h1).unwrap(), "a");
        assert_eq!(*slab.get(h2).unwrap(), "b");
    }

    #[test]
    fn test_slab_remove_invalidates_handle() {
        let slab = Slab::new();
        let (h, _) = slab.insert(10).unwrap();
        assert_eq!(*slab.remove(h).unwrap(), 10);

        assert!(slab.get(h).is_none());
        assert!(slab.remove(h).is_none());
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_slab_reuses_slot_with_new_generation() {
        let slab = Slab::new();
        let (old, _) = slab.insert(1).unwrap();
        slab.remove(old);

        let (new, _) = slab.insert(2).unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);
        assert!(slab.get(old).is_none());
        assert_eq!(*slab.get(new).unwrap(), 2);
    }

    #[test]
    fn test_slab_limit() {
        let slab = Slab::with_limit(Some(2));
        let (h, _) = slab.insert(1).unwrap();
        slab.insert(2).unwrap();
        assert!(slab.insert(3).is_none());

        slab.remove(h);
        assert!(slab.insert(3).is_some());
    }

    #[test]
    fn test_slab_insert_with_sees_own_handle() {
        let slab = Slab::new();
        let (h, cell) = slab.insert_with(|handle| handle).unwrap();
        assert_eq!(*cell, h);
    }

    #[test]
    fn test_slab_handles() {
        let slab = Slab::new();
        let (h1, _) = slab.insert(1).unwrap();
        let (h2, _) = slab.insert(2).unwrap();
        let (h3, _) = slab.insert(3).unwrap();
        slab.remove(h2);

        let handles = slab.handles();
        assert_eq!(handles.len(), 2);
        assert!(handles.contains(&h1));
        assert!(handles.contains(&h3));
    }
}
