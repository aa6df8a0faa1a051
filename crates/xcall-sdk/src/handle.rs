//! Opaque handles crossing the kernel boundary
//!
//! Every object the kernel manages is named by an index into a table the
//! kernel owns, never by a pointer. Handles pack into a single `u64`:
//!
//! ```text
//! ┌────────┬──────────────────┬──────────────────────────────┐
//! │ kind 8 │ generation 24    │ index 32                     │
//! └────────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! The generation is bumped every time a slot is reclaimed, so a stale
//! handle fails validation instead of aliasing a newer object.

use std::fmt;

use crate::error::{KernelError, KernelResult};

const KIND_SHIFT: u64 = 56;
const GENERATION_SHIFT: u64 = 32;
const GENERATION_MASK: u32 = 0x00FF_FFFF;
const INDEX_MASK: u64 = 0xFFFF_FFFF;

/// Kind tag stored in the top byte of a packed handle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Live object wrapping a host payload
    Instance = 1,
    /// Refcounted capability on a class
    Class = 2,
    /// Building or sealed message
    Message = 3,
}

impl HandleKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HandleKind::Instance),
            2 => Some(HandleKind::Class),
            3 => Some(HandleKind::Message),
            _ => None,
        }
    }
}

/// Untyped slot reference: index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    /// Slot index in the owning table
    pub index: u32,
    /// Generation of the slot when the handle was issued
    pub generation: u32,
}

impl RawHandle {
    /// Largest generation that fits in a packed handle
    pub const MAX_GENERATION: u32 = GENERATION_MASK;

    /// Create a raw handle
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack with a kind tag
    pub fn pack(self, kind: HandleKind) -> u64 {
        ((kind as u64) << KIND_SHIFT)
            | (((self.generation & GENERATION_MASK) as u64) << GENERATION_SHIFT)
            | self.index as u64
    }

    /// Unpack, checking the kind tag
    pub fn unpack(bits: u64, expected: HandleKind) -> KernelResult<Self> {
        let tag = (bits >> KIND_SHIFT) as u8;
        match HandleKind::from_u8(tag) {
            Some(kind) if kind == expected => Ok(Self {
                index: (bits & INDEX_MASK) as u32,
                generation: ((bits >> GENERATION_SHIFT) as u32) & GENERATION_MASK,
            }),
            _ => Err(KernelError::InvalidHandle(bits)),
        }
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw slot reference
            pub fn from_raw(raw: RawHandle) -> Self {
                Self(raw.pack($kind))
            }

            /// Validate packed bits received from across the boundary
            pub fn from_bits(bits: u64) -> KernelResult<Self> {
                RawHandle::unpack(bits, $kind).map(|_| Self(bits))
            }

            /// Packed representation
            pub const fn to_bits(self) -> u64 {
                self.0
            }

            /// Slot reference
            pub fn raw(self) -> RawHandle {
                RawHandle {
                    index: (self.0 & INDEX_MASK) as u32,
                    generation: ((self.0 >> GENERATION_SHIFT) as u32) & GENERATION_MASK,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let raw = self.raw();
                write!(f, "{}({}v{})", stringify!($name), raw.index, raw.generation)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

typed_handle!(
    /// Handle to a kernel-managed Instance
    InstanceId,
    HandleKind::Instance
);

typed_handle!(
    /// Handle to a ClassHandle (a borrowed capability on a class)
    ClassHandleId,
    HandleKind::Class
);

typed_handle!(
    /// Handle to a message in the arena
    MessageId,
    HandleKind::Message
);

/// Numeric identifier of a registered class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Get the raw ID value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Any refcounted handle, for the polymorphic `retain` / `release`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// An Instance
    Instance(InstanceId),
    /// A ClassHandle
    Class(ClassHandleId),
    /// A message
    Message(MessageId),
}

impl Handle {
    /// Decode packed bits of any kind
    pub fn from_bits(bits: u64) -> KernelResult<Self> {
        match HandleKind::from_u8((bits >> KIND_SHIFT) as u8) {
            Some(HandleKind::Instance) => Ok(Handle::Instance(InstanceId(bits))),
            Some(HandleKind::Class) => Ok(Handle::Class(ClassHandleId(bits))),
            Some(HandleKind::Message) => Ok(Handle::Message(MessageId(bits))),
            None => Err(KernelError::InvalidHandle(bits)),
        }
    }

    /// Packed representation
    pub fn to_bits(self) -> u64 {
        match self {
            Handle::Instance(id) => id.to_bits(),
            Handle::Class(id) => id.to_bits(),
            Handle::Message(id) => id.to_bits(),
        }
    }
}

impl From<InstanceId> for Handle {
    fn from(id: InstanceId) -> Self {
        Handle::Instance(id)
    }
}

impl From<ClassHandleId> for Handle {
    fn from(id: ClassHandleId) -> Self {
        Handle::Class(id)
    }
}

impl From<MessageId> for Handle {
    fn from(id: MessageId) -> Self {
        Handle::Message(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let raw = RawHandle::new(7, 3);
        let bits = raw.pack(HandleKind::Message);
        assert_eq!(bits, (3u64 << 56) | (3u64 << 32) | 7);
        assert_eq!(RawHandle::unpack(bits, HandleKind::Message).unwrap(), raw);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let id = InstanceId::from_raw(RawHandle::new(1, 1));
        let err = MessageId::from_bits(id.to_bits()).unwrap_err();
        assert_eq!(err, KernelError::InvalidHandle(id.to_bits()));
    }

    #[test]
    fn test_zero_bits_invalid() {
        assert!(Handle::from_bits(0).is_err());
        assert!(InstanceId::from_bits(0).is_err());
    }

    #[test]
    fn test_handle_enum_dispatch() {
        let id = ClassHandleId::from_raw(RawHandle::new(42, 9));
        let handle = Handle::from_bits(id.to_bits()).unwrap();
        assert_eq!(handle, Handle::Class(id));
        assert_eq!(handle.to_bits(), id.to_bits());
        assert_eq!(id.raw(), RawHandle::new(42, 9));
    }

    #[test]
    fn test_generation_truncated_to_24_bits() {
        let raw = RawHandle::new(0, RawHandle::MAX_GENERATION);
        let id = MessageId::from_raw(raw);
        assert_eq!(id.raw().generation, RawHandle::MAX_GENERATION);
    }
}
