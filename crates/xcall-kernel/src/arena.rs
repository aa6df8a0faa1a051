//! Message arena
//!
//! Owns the segment memory behind every message. A message starts in the
//! Building state with a single owner and an append-only list of
//! fixed-capacity segments; sealing freezes it into a shareable, refcounted
//! [`SealedBuffer`].
//!
//! # Segment Layout
//!
//! ```text
//! segment 0: [ used ........ | slack ]   <- full, never touched again
//! segment 1: [ used .... | free      ]   <- current write target
//! ```
//!
//! A write that does not fit in the current segment's free space opens a new
//! segment of `max(segment_size, write_len)` bytes. Earlier segments are never
//! reallocated, so offsets handed out during building stay valid.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use xcall_sdk::{KernelError, KernelResult, MessageId, MessageView, SealedBuffer};

use crate::config::KernelOptions;
use crate::refcount::RefCount;
use crate::slab::Slab;
use crate::stats::KernelCounters;

/// Mutable state of a message under construction
struct Builder {
    segments: Vec<Vec<u8>>,
    /// Logical offset where the last segment starts
    prefix: usize,
    /// Segment bytes charged against the limits
    charged: usize,
}

impl Builder {
    fn len(&self) -> usize {
        self.prefix + self.segments.last().map_or(0, |s| s.len())
    }
}

/// One arena slot
pub(crate) struct MessageCell {
    refcount: RefCount,
    builder: Mutex<Option<Builder>>,
    sealed: OnceCell<Arc<SealedBuffer>>,
    sealed_charge: AtomicUsize,
}

/// Pin on a sealed message, released on drop
pub(crate) struct MessagePin<'a> {
    arena: &'a MessageArena,
    id: MessageId,
}

impl Drop for MessagePin<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.arena.release(self.id) {
            log::warn!("failed to unpin message {}: {}", self.id, e);
        }
    }
}

/// Allocator and owner of message segments
pub struct MessageArena {
    messages: Slab<MessageCell>,
    counters: Arc<KernelCounters>,
    segment_size: usize,
    max_message_bytes: Option<usize>,
    max_arena_bytes: Option<usize>,
}

impl MessageArena {
    /// Create an arena configured from kernel options
    pub fn new(options: &KernelOptions, counters: Arc<KernelCounters>) -> Self {
        Self {
            messages: Slab::new(),
            counters,
            segment_size: options.segment_size.max(1),
            max_message_bytes: options.limits.max_message_bytes,
            max_arena_bytes: options.limits.max_arena_bytes,
        }
    }

    fn cell(&self, id: MessageId) -> KernelResult<Arc<MessageCell>> {
        self.messages
            .get(id.raw())
            .ok_or_else(|| KernelError::UseAfterFree(format!("message {} has been freed", id)))
    }

    /// Charge `capacity` bytes and allocate an empty segment of that size
    fn new_segment(&self, capacity: usize) -> KernelResult<Vec<u8>> {
        if !self
            .counters
            .try_reserve_arena_bytes(capacity, self.max_arena_bytes)
        {
            return Err(KernelError::OutOfMemory(format!(
                "arena limit reached allocating a {} byte segment",
                capacity
            )));
        }
        let mut segment = Vec::new();
        if let Err(e) = segment.try_reserve_exact(capacity) {
            self.counters.free_arena_bytes(capacity);
            return Err(KernelError::OutOfMemory(format!(
                "failed to allocate a {} byte segment: {}",
                capacity, e
            )));
        }
        Ok(segment)
    }

    /// Start building a message
    pub fn begin_build(&self) -> KernelResult<MessageId> {
        let capacity = match self.max_message_bytes {
            Some(max) => self.segment_size.min(max),
            None => self.segment_size,
        };
        let segment = self.new_segment(capacity)?;
        let builder = Builder {
            segments: vec![segment],
            prefix: 0,
            charged: capacity,
        };

        let inserted = self.messages.insert(MessageCell {
            refcount: RefCount::new(),
            builder: Mutex::new(Some(builder)),
            sealed: OnceCell::new(),
            sealed_charge: AtomicUsize::new(0),
        });
        let (raw, _) = match inserted {
            Some(inserted) => inserted,
            None => {
                self.counters.free_arena_bytes(capacity);
                return Err(KernelError::OutOfMemory(
                    "message table is full".to_string(),
                ));
            }
        };

        self.counters.increment_messages();
        let id = MessageId::from_raw(raw);
        trace!("begin_build {}", id);
        Ok(id)
    }

    /// Run `f` on the builder of a message that is still being built
    fn with_builder<R>(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut Builder) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let cell = self.cell(id)?;
        let mut guard = cell.builder.lock();
        match guard.as_mut() {
            Some(builder) => f(builder),
            None if cell.sealed.get().is_some() => Err(KernelError::DoubleSeal),
            None => Err(KernelError::UseAfterFree(format!(
                "message {} has been freed",
                id
            ))),
        }
    }

    /// Make room for `len` contiguous bytes, returning their logical offset
    fn reserve(&self, builder: &mut Builder, len: usize) -> KernelResult<usize> {
        let fits = builder
            .segments
            .last()
            .is_some_and(|s| s.capacity() - s.len() >= len);
        if fits {
            return Ok(builder.len());
        }

        let capacity = self.segment_size.max(len);
        // Only the initial segment can be empty, and it carries the whole charge.
        let replace_empty = builder.segments.last().is_some_and(|s| s.is_empty());
        let refund = if replace_empty { builder.charged } else { 0 };

        let total = builder.charged - refund + capacity;
        if self.max_message_bytes.is_some_and(|max| total > max) {
            return Err(KernelError::OutOfMemory(format!(
                "message would grow to {} bytes",
                total
            )));
        }

        // The replaced segment's bytes must not count against the arena limit.
        self.counters.free_arena_bytes(refund);
        let segment = match self.new_segment(capacity) {
            Ok(segment) => segment,
            Err(e) => {
                self.counters.try_reserve_arena_bytes(refund, None);
                return Err(e);
            }
        };
        if replace_empty {
            builder.segments.pop();
            builder.charged -= refund;
        } else if let Some(last) = builder.segments.last() {
            builder.prefix += last.len();
        }
        builder.segments.push(segment);
        builder.charged += capacity;
        Ok(builder.len())
    }

    /// Append bytes to a building message
    pub fn grow(&self, id: MessageId, bytes: &[u8]) -> KernelResult<usize> {
        self.with_builder(id, |builder| {
            if bytes.is_empty() {
                return Ok(builder.len());
            }
            let offset = self.reserve(builder, bytes.len())?;
            if let Some(segment) = builder.segments.last_mut() {
                segment.extend_from_slice(bytes);
            }
            Ok(offset)
        })
    }

    /// Reserve zeroed bytes in a building message
    pub fn allocate(&self, id: MessageId, len: usize) -> KernelResult<usize> {
        self.with_builder(id, |builder| {
            if len == 0 {
                return Ok(builder.len());
            }
            let offset = self.reserve(builder, len)?;
            if let Some(segment) = builder.segments.last_mut() {
                segment.resize(segment.len() + len, 0);
            }
            Ok(offset)
        })
    }

    /// Overwrite bytes previously appended to a building message
    pub fn write(&self, id: MessageId, offset: usize, bytes: &[u8]) -> KernelResult<()> {
        self.with_builder(id, |builder| {
            let extent = builder.len();
            let bounds = KernelError::Bounds {
                offset,
                length: bytes.len(),
                extent,
            };
            if bytes.is_empty() {
                return if offset <= extent { Ok(()) } else { Err(bounds) };
            }

            let mut start = 0;
            for segment in builder.segments.iter_mut() {
                let end = start + segment.len();
                if offset >= start && offset < end {
                    let local = offset - start;
                    if local + bytes.len() > segment.len() {
                        return Err(bounds);
                    }
                    segment[local..local + bytes.len()].copy_from_slice(bytes);
                    return Ok(());
                }
                start = end;
            }
            Err(bounds)
        })
    }

    /// Freeze a building message
    pub fn seal(&self, id: MessageId) -> KernelResult<()> {
        let cell = self.cell(id)?;
        let mut guard = cell.builder.lock();
        let builder = match guard.take() {
            Some(builder) => builder,
            None if cell.sealed.get().is_some() => return Err(KernelError::DoubleSeal),
            None => {
                return Err(KernelError::UseAfterFree(format!(
                    "message {} has been freed",
                    id
                )))
            }
        };

        let len = builder.len();
        cell.sealed_charge.store(builder.charged, Ordering::Release);
        let _ = cell
            .sealed
            .set(Arc::new(SealedBuffer::from_segments(builder.segments)));
        drop(guard);

        trace!("sealed {} ({} bytes)", id, len);
        Ok(())
    }

    /// Check whether a live message is sealed
    pub fn is_sealed(&self, id: MessageId) -> KernelResult<bool> {
        let cell = self.cell(id)?;
        Ok(cell.sealed.get().is_some())
    }

    /// Get the sealed buffer of a live message
    pub fn sealed_buffer(&self, id: MessageId) -> KernelResult<Arc<SealedBuffer>> {
        let cell = self.cell(id)?;
        if cell.refcount.get() == 0 {
            return Err(KernelError::UseAfterFree(format!(
                "message {} has been freed",
                id
            )));
        }
        cell.sealed.get().cloned().ok_or(KernelError::NotSealed)
    }

    /// Zero-copy read of a sealed message
    pub fn read(&self, id: MessageId, offset: usize, length: usize) -> KernelResult<MessageView> {
        self.sealed_buffer(id)?.view(offset, length)
    }

    /// Sealed extent in bytes
    pub fn len(&self, id: MessageId) -> KernelResult<usize> {
        Ok(self.sealed_buffer(id)?.len())
    }

    /// Number of segments backing a sealed message
    pub fn segment_count(&self, id: MessageId) -> KernelResult<usize> {
        Ok(self.sealed_buffer(id)?.segment_count())
    }

    /// Current refcount of a live message
    pub fn refcount(&self, id: MessageId) -> KernelResult<usize> {
        Ok(self.cell(id)?.refcount.get())
    }

    /// Add a reference to a sealed message
    ///
    /// A building message has exactly one owner and cannot be shared.
    pub fn retain(&self, id: MessageId) -> KernelResult<()> {
        let cell = self.cell(id)?;
        if cell.sealed.get().is_none() {
            return Err(KernelError::NotSealed);
        }
        if cell.refcount.try_retain() {
            Ok(())
        } else {
            Err(KernelError::UseAfterFree(format!(
                "message {} has been freed",
                id
            )))
        }
    }

    /// Drop a reference; at zero the segments are freed
    ///
    /// Releasing a building message abandons the build.
    pub fn release(&self, id: MessageId) -> KernelResult<()> {
        let cell = self.cell(id)?;
        if cell.refcount.release(MessageLabel(id)) {
            self.free(id, &cell);
        }
        Ok(())
    }

    /// Pin a sealed message for the duration of a call
    pub(crate) fn pin(&self, id: MessageId) -> KernelResult<MessagePin<'_>> {
        self.retain(id)?;
        Ok(MessagePin { arena: self, id })
    }

    fn free(&self, id: MessageId, cell: &MessageCell) {
        self.messages.remove(id.raw());
        let charged = match cell.builder.lock().take() {
            Some(builder) => builder.charged,
            None => cell.sealed_charge.load(Ordering::Acquire),
        };
        self.counters.free_arena_bytes(charged);
        self.counters.decrement_messages();
        trace!("freed {} ({} bytes)", id, charged);
    }

    /// Free every message regardless of refcount
    pub(crate) fn free_all(&self) -> usize {
        let handles = self.messages.handles();
        let count = handles.len();
        for raw in handles {
            let id = MessageId::from_raw(raw);
            if let Some(cell) = self.messages.get(raw) {
                cell.refcount.clear();
                self.free(id, &cell);
            }
        }
        count
    }

    /// Number of live messages
    pub fn live_messages(&self) -> usize {
        self.messages.len()
    }
}

struct MessageLabel(MessageId);

impl fmt::Display for MessageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelLimits;

    fn arena_with(options: KernelOptions) -> (MessageArena, Arc<KernelCounters>) {
        let counters = Arc::new(KernelCounters::new());
        (MessageArena::new(&options, Arc::clone(&counters)), counters)
    }

    fn arena() -> MessageArena {
        arena_with(KernelOptions::default().segment_size(16)).0
    }

    #[test]
    fn test_build_seal_read() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        assert_eq!(arena.grow(id, b"hello").unwrap(), 0);
        assert_eq!(arena.grow(id, b" world").unwrap(), 5);
        arena.seal(id).unwrap();

        let view = arena.read(id, 0, 11).unwrap();
        assert_eq!(&*view, b"hello world");
        assert!(view.is_zero_copy());
        assert_eq!(arena.len(id).unwrap(), 11);
    }

    #[test]
    fn test_grow_opens_new_segment() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.grow(id, &[1u8; 10]).unwrap();
        // Does not fit in the remaining 6 bytes.
        assert_eq!(arena.grow(id, &[2u8; 10]).unwrap(), 10);
        // Larger than a segment: gets a dedicated one.
        assert_eq!(arena.grow(id, &[3u8; 40]).unwrap(), 20);
        arena.seal(id).unwrap();

        assert_eq!(arena.segment_count(id).unwrap(), 3);
        assert_eq!(&*arena.read(id, 10, 10).unwrap(), &[2u8; 10]);
        assert!(arena.read(id, 20, 40).unwrap().is_zero_copy());
        // Spans segments 0 and 1.
        let gathered = arena.read(id, 8, 4).unwrap();
        assert!(!gathered.is_zero_copy());
        assert_eq!(&*gathered, &[1, 1, 2, 2]);
    }

    #[test]
    fn test_large_first_write_replaces_empty_segment() {
        let (arena, counters) = arena_with(KernelOptions::default().segment_size(16));
        let id = arena.begin_build().unwrap();
        assert_eq!(counters.snapshot().arena_bytes, 16);
        assert_eq!(arena.grow(id, &[7u8; 32]).unwrap(), 0);
        assert_eq!(counters.snapshot().arena_bytes, 32);
        arena.seal(id).unwrap();
        assert_eq!(arena.segment_count(id).unwrap(), 1);
    }

    #[test]
    fn test_allocate_then_write() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        let header = arena.allocate(id, 8).unwrap();
        let body = arena.grow(id, b"abc").unwrap();
        arena
            .write(id, header, &(body as u64).to_le_bytes())
            .unwrap();
        arena.seal(id).unwrap();

        let view = arena.read(id, header, 8).unwrap();
        let mut word = [0u8; 8];
        word.copy_from_slice(&view);
        assert_eq!(u64::from_le_bytes(word), 8);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.allocate(id, 4).unwrap();
        assert!(matches!(
            arena.write(id, 2, &[0u8; 4]),
            Err(KernelError::Bounds { .. })
        ));
        assert!(arena.write(id, 4, &[]).is_ok());
    }

    #[test]
    fn test_double_seal() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.seal(id).unwrap();
        assert_eq!(arena.seal(id).unwrap_err(), KernelError::DoubleSeal);
        assert_eq!(arena.grow(id, b"x").unwrap_err(), KernelError::DoubleSeal);
    }

    #[test]
    fn test_read_requires_seal() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.grow(id, b"abc").unwrap();
        assert_eq!(arena.read(id, 0, 3).unwrap_err(), KernelError::NotSealed);
        assert_eq!(arena.retain(id).unwrap_err(), KernelError::NotSealed);
    }

    #[test]
    fn test_read_bounds() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.grow(id, b"abc").unwrap();
        arena.seal(id).unwrap();
        assert_eq!(
            arena.read(id, 2, 2).unwrap_err(),
            KernelError::Bounds {
                offset: 2,
                length: 2,
                extent: 3
            }
        );
    }

    #[test]
    fn test_refcount_and_free() {
        let (arena, counters) = arena_with(KernelOptions::default().segment_size(16));
        let id = arena.begin_build().unwrap();
        arena.grow(id, b"abc").unwrap();
        arena.seal(id).unwrap();

        arena.retain(id).unwrap();
        assert_eq!(arena.refcount(id).unwrap(), 2);
        arena.release(id).unwrap();
        assert_eq!(arena.read(id, 0, 3).unwrap().len(), 3);

        arena.release(id).unwrap();
        assert!(matches!(
            arena.read(id, 0, 3),
            Err(KernelError::UseAfterFree(_))
        ));
        assert!(matches!(arena.release(id), Err(KernelError::UseAfterFree(_))));

        let stats = counters.snapshot();
        assert_eq!(stats.live_messages, 0);
        assert_eq!(stats.arena_bytes, 0);
    }

    #[test]
    fn test_release_building_abandons() {
        let (arena, counters) = arena_with(KernelOptions::default().segment_size(16));
        let id = arena.begin_build().unwrap();
        arena.grow(id, &[0u8; 40]).unwrap();
        arena.release(id).unwrap();

        assert!(matches!(arena.grow(id, b"x"), Err(KernelError::UseAfterFree(_))));
        assert_eq!(counters.snapshot().arena_bytes, 0);
        assert_eq!(arena.live_messages(), 0);
    }

    #[test]
    fn test_message_limit_is_recoverable() {
        let options = KernelOptions::default()
            .segment_size(16)
            .limits(KernelLimits::with_message_limit(32));
        let (arena, _) = arena_with(options);
        let id = arena.begin_build().unwrap();
        arena.grow(id, &[0u8; 12]).unwrap();
        assert!(matches!(
            arena.grow(id, &[0u8; 64]),
            Err(KernelError::OutOfMemory(_))
        ));
        // A smaller retry still fits.
        assert_eq!(arena.grow(id, &[1u8; 8]).unwrap(), 12);
        arena.seal(id).unwrap();
        assert_eq!(arena.len(id).unwrap(), 20);
    }

    #[test]
    fn test_arena_limit() {
        let options = KernelOptions::default()
            .segment_size(16)
            .limits(KernelLimits::with_arena_limit(32));
        let (arena, _) = arena_with(options);
        let a = arena.begin_build().unwrap();
        let _b = arena.begin_build().unwrap();
        assert!(matches!(
            arena.begin_build(),
            Err(KernelError::OutOfMemory(_))
        ));
        arena.release(a).unwrap();
        assert!(arena.begin_build().is_ok());
    }

    #[test]
    fn test_arena_limit_ignores_replaced_segment() {
        let options = KernelOptions::default()
            .segment_size(16)
            .limits(KernelLimits::with_arena_limit(32));
        let (arena, counters) = arena_with(options);
        let id = arena.begin_build().unwrap();
        assert_eq!(arena.grow(id, &[0u8; 32]).unwrap(), 0);
        assert_eq!(counters.snapshot().arena_bytes, 32);

        // Too large even after the refund: the original charge stays intact.
        let other = arena.begin_build();
        assert!(matches!(other, Err(KernelError::OutOfMemory(_))));
        let (small, counters) = arena_with(
            KernelOptions::default()
                .segment_size(16)
                .limits(KernelLimits::with_arena_limit(32)),
        );
        let id = small.begin_build().unwrap();
        assert!(matches!(
            small.grow(id, &[0u8; 48]),
            Err(KernelError::OutOfMemory(_))
        ));
        assert_eq!(counters.snapshot().arena_bytes, 16);
        assert_eq!(small.grow(id, b"fits").unwrap(), 0);
    }

    #[test]
    fn test_view_survives_release() {
        let arena = arena();
        let id = arena.begin_build().unwrap();
        arena.grow(id, b"kept").unwrap();
        arena.seal(id).unwrap();
        let view = arena.read(id, 0, 4).unwrap();
        arena.release(id).unwrap();
        assert_eq!(&*view, b"kept");
    }

    #[test]
    fn test_free_all() {
        let (arena, counters) = arena_with(KernelOptions::default());
        arena.begin_build().unwrap();
        let sealed = arena.begin_build().unwrap();
        arena.seal(sealed).unwrap();
        arena.retain(sealed).unwrap();

        assert_eq!(arena.free_all(), 2);
        assert_eq!(arena.live_messages(), 0);
        assert_eq!(counters.snapshot().arena_bytes, 0);
    }
}
