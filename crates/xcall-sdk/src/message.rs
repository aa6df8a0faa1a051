//! Sealed message buffers and zero-copy views
//!
//! A sealed message is an immutable list of segments. Offsets are logical:
//! segment `n` starts where segment `n - 1`'s used bytes end. Writers never
//! split a single write across segments, so anything written in one piece can
//! be read back without copying.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{KernelError, KernelResult};

/// Immutable segment list of a sealed message
pub struct SealedBuffer {
    segments: Vec<Vec<u8>>,
    starts: Vec<usize>,
    len: usize,
}

impl SealedBuffer {
    /// Freeze a list of segments
    ///
    /// Empty segments are dropped; they carry no bytes and would break the
    /// strictly increasing start offsets.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        let segments: Vec<Vec<u8>> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        let mut starts = Vec::with_capacity(segments.len());
        let mut len = 0;
        for segment in &segments {
            starts.push(len);
            len += segment.len();
        }
        Self {
            segments,
            starts,
            len,
        }
    }

    /// Total sealed extent in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the message carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of non-empty segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Borrow one segment
    pub fn segment(&self, index: usize) -> Option<&[u8]> {
        self.segments.get(index).map(|s| s.as_slice())
    }

    /// Total bytes held, including unused segment capacity
    pub fn allocated_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.capacity()).sum()
    }

    /// Create a view of `length` bytes at `offset`
    pub fn view(self: &Arc<Self>, offset: usize, length: usize) -> KernelResult<MessageView> {
        let end = offset.checked_add(length).ok_or(KernelError::Bounds {
            offset,
            length,
            extent: self.len,
        })?;
        if end > self.len {
            return Err(KernelError::Bounds {
                offset,
                length,
                extent: self.len,
            });
        }
        if length == 0 {
            return Ok(MessageView {
                repr: ViewRepr::Gathered(Vec::new()),
            });
        }

        let first = self.starts.partition_point(|&start| start <= offset) - 1;
        let local = offset - self.starts[first];
        if local + length <= self.segments[first].len() {
            return Ok(MessageView {
                repr: ViewRepr::Shared {
                    buffer: Arc::clone(self),
                    segment: first,
                    start: local,
                    end: local + length,
                },
            });
        }

        // Range crosses a segment boundary: gather it.
        let mut gathered = Vec::with_capacity(length);
        let mut segment = first;
        let mut local = local;
        while gathered.len() < length {
            let bytes = &self.segments[segment];
            let take = (length - gathered.len()).min(bytes.len() - local);
            gathered.extend_from_slice(&bytes[local..local + take]);
            segment += 1;
            local = 0;
        }
        Ok(MessageView {
            repr: ViewRepr::Gathered(gathered),
        })
    }
}

impl fmt::Debug for SealedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBuffer")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}

enum ViewRepr {
    Shared {
        buffer: Arc<SealedBuffer>,
        segment: usize,
        start: usize,
        end: usize,
    },
    Gathered(Vec<u8>),
}

/// Read-only view into a sealed message
///
/// A view keeps the sealed buffer alive on its own, so it stays valid after
/// the message handle is released.
pub struct MessageView {
    repr: ViewRepr,
}

impl MessageView {
    /// True when the view borrows the sealed segment directly
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.repr, ViewRepr::Shared { .. })
    }

    /// Interpret the view as UTF-8
    pub fn as_str(&self) -> KernelResult<&str> {
        std::str::from_utf8(self)
            .map_err(|e| KernelError::HandlerFailed(format!("Invalid UTF-8 in message: {}", e)))
    }
}

impl Deref for MessageView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.repr {
            ViewRepr::Shared {
                buffer,
                segment,
                start,
                end,
            } => &buffer.segments[*segment][*start..*end],
            ViewRepr::Gathered(bytes) => bytes,
        }
    }
}

impl AsRef<[u8]> for MessageView {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for MessageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageView")
            .field("len", &self.len())
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}
