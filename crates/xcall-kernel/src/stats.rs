//! Kernel statistics counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time snapshot of the kernel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Instances currently Live
    pub live_instances: usize,
    /// Highest number of simultaneously live Instances
    pub peak_instances: usize,
    /// ClassHandles currently held
    pub live_class_handles: usize,
    /// Messages currently allocated (building or sealed)
    pub live_messages: usize,
    /// Segment bytes held by live messages
    pub arena_bytes: usize,
    /// Dispatches attempted
    pub dispatches: u64,
    /// Dispatches that ended in Failed
    pub failed_dispatches: u64,
    /// Instance and ClassHandle finalizers invoked
    pub finalizers_run: u64,
}

/// Resource usage counters shared by the kernel components
#[derive(Debug, Default)]
pub struct KernelCounters {
    live_instances: AtomicUsize,
    peak_instances: AtomicUsize,
    live_class_handles: AtomicUsize,
    live_messages: AtomicUsize,
    arena_bytes: AtomicUsize,
    dispatches: AtomicU64,
    failed_dispatches: AtomicU64,
    finalizers_run: AtomicU64,
}

impl KernelCounters {
    /// Create new counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment live Instance count, tracking the peak
    pub fn increment_instances(&self) -> usize {
        let count = self.live_instances.fetch_add(1, Ordering::Relaxed) + 1;

        let mut peak = self.peak_instances.load(Ordering::Relaxed);
        while count > peak {
            match self.peak_instances.compare_exchange_weak(
                peak,
                count,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }

        count
    }

    /// Decrement live Instance count
    pub fn decrement_instances(&self) -> usize {
        self.live_instances.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Get current live Instance count
    pub fn live_instances(&self) -> usize {
        self.live_instances.load(Ordering::Relaxed)
    }

    /// Track a new ClassHandle
    pub fn increment_class_handles(&self) {
        self.live_class_handles.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a finalized ClassHandle
    pub fn decrement_class_handles(&self) {
        self.live_class_handles.fetch_sub(1, Ordering::Relaxed);
    }

    /// Track a new message
    pub fn increment_messages(&self) {
        self.live_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a freed message
    pub fn decrement_messages(&self) {
        self.live_messages.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reserve arena bytes, failing if the total would exceed `limit`
    pub fn try_reserve_arena_bytes(&self, bytes: usize, limit: Option<usize>) -> bool {
        let mut current = self.arena_bytes.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) => next,
                None => return false,
            };
            if limit.is_some_and(|max| next > max) {
                return false;
            }
            match self.arena_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return arena bytes
    pub fn free_arena_bytes(&self, bytes: usize) {
        self.arena_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Count a dispatch attempt
    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed dispatch
    pub fn record_failure(&self) {
        self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finalizer invocation
    pub fn record_finalizer(&self) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> KernelStats {
        KernelStats {
            live_instances: self.live_instances.load(Ordering::Relaxed),
            peak_instances: self.peak_instances.load(Ordering::Relaxed),
            live_class_handles: self.live_class_handles.load(Ordering::Relaxed),
            live_messages: self.live_messages.load(Ordering::Relaxed),
            arena_bytes: self.arena_bytes.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
            finalizers_run: self.finalizers_run.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_peak() {
        let counters = KernelCounters::new();
        counters.increment_instances();
        counters.increment_instances();
        counters.decrement_instances();
        counters.increment_instances();

        let stats = counters.snapshot();
        assert_eq!(stats.live_instances, 2);
        assert_eq!(stats.peak_instances, 2);
    }

    #[test]
    fn test_arena_reservation_respects_limit() {
        let counters = KernelCounters::new();
        assert!(counters.try_reserve_arena_bytes(60, Some(100)));
        assert!(!counters.try_reserve_arena_bytes(50, Some(100)));
        assert!(counters.try_reserve_arena_bytes(40, Some(100)));
        counters.free_arena_bytes(100);
        assert_eq!(counters.snapshot().arena_bytes, 0);
    }

    #[test]
    fn test_unlimited_reservation() {
        let counters = KernelCounters::new();
        assert!(counters.try_reserve_arena_bytes(usize::MAX / 2, None));
        assert!(!counters.try_reserve_arena_bytes(usize::MAX, None));
    }
}
