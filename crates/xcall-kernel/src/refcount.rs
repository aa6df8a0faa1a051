//! Atomic reference counting shared by every kernel-managed object
//!
//! The zero transition is guarded: exactly one thread observes `1 -> 0`
//! and runs the destructive path; a count never climbs back up from zero.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic refcount starting at one
#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    /// New count owned by the creator
    pub fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    /// Current count
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Increment unless the count already reached zero
    pub fn try_retain(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement; returns true for the caller that took the count to zero
    ///
    /// # Panics
    ///
    /// Panics when the count is already zero. Releasing more references
    /// than were held breaks the caller contract and cannot be continued
    /// from safely.
    pub fn release(&self, what: impl fmt::Display) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                underflow(&what);
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current == 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Force the count to zero, returning the references that were dropped
    ///
    /// Used at teardown, when no other thread can hold the kernel.
    pub fn clear(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cold]
fn underflow(what: &dyn fmt::Display) -> ! {
    log::error!("refcount underflow on {}", what);
    panic!("refcount underflow on {}: released more references than were held", what);
}
