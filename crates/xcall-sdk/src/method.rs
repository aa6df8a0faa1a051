//! Method identifiers
//!
//! A method id is a pure function of the method name: the first four bytes
//! (big-endian) of `SHA-256(name)` with the top bit cleared. The derivation is
//! fixed so ids cached by a bridge stay valid across process runs.

use std::fmt;

use sha2::{Digest, Sha256};

/// 31-bit method identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MethodId(u32);

impl MethodId {
    /// Reserved top bit; zero in every valid id
    pub const RESERVED_BIT: u32 = 1 << 31;

    /// Mask of the usable identifier bits
    pub const MASK: u32 = !Self::RESERVED_BIT;

    /// Wrap a raw value, rejecting ids with the reserved bit set
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw & Self::RESERVED_BIT != 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Get the raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Which table a method lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Class-level method, invoked with no receiver (constructors live here)
    Class,
    /// Instance method, invoked with a live receiver
    Instance,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKind::Class => write!(f, "class method"),
            MethodKind::Instance => write!(f, "instance method"),
        }
    }
}

/// Compute the stable identifier for a method name
pub fn method_id(name: &str) -> MethodId {
    let digest = Sha256::digest(name.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    MethodId(raw & MethodId::MASK)
}
