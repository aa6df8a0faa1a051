//! Error types for the xcall calling convention
//!
//! Every failure crosses the boundary as a value. Bridges that want a
//! host-native exception re-raise from the [`ErrorKind`] code.

use crate::handle::ClassId;
use crate::method::MethodId;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// A class with this name is already registered
    #[error("Class '{0}' is already registered")]
    DuplicateClass(String),

    /// Two methods of one class hash to the same identifier
    #[error("Method id collision in class '{class}': '{first}' and '{second}' both map to {id}")]
    MethodIdCollision {
        /// Class being registered
        class: String,
        /// Method registered first
        first: String,
        /// Method that collided with it
        second: String,
        /// The shared identifier
        id: MethodId,
    },

    /// No class registered under this name or id
    #[error("Class not found: {0}")]
    NotFound(String),

    /// Method id does not resolve in the class's method table
    #[error("Unknown method {method} on class {class}")]
    UnknownMethod {
        /// Class searched
        class: ClassId,
        /// Method that failed to resolve
        method: MethodId,
    },

    /// Operation on an object that is finalizing or already destroyed
    #[error("Use after free: {0}")]
    UseAfterFree(String),

    /// Constructor reached through the instance path or vice versa
    #[error("Wrong dispatch kind: {0}")]
    WrongDispatchKind(String),

    /// Message was sealed twice
    #[error("Message is already sealed")]
    DoubleSeal,

    /// Message is still being built
    #[error("Message is not sealed")]
    NotSealed,

    /// Read past the sealed extent of a message
    #[error("Read of {length} bytes at offset {offset} exceeds message extent {extent}")]
    Bounds {
        /// Requested start offset
        offset: usize,
        /// Requested length
        length: usize,
        /// Sealed extent of the message
        extent: usize,
    },

    /// Arena allocation failed or a configured limit was hit
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Handle of the wrong kind, or one that was never issued
    #[error("Invalid handle: {0:#018x}")]
    InvalidHandle(u64),

    /// Handler returned an error result
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Handler unwound past the dispatch boundary
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// Reentrant call nesting exceeded the configured limit
    #[error("Call depth limit of {limit} exceeded")]
    CallDepthExceeded {
        /// Configured maximum depth
        limit: usize,
    },
}

/// Stable numeric error codes
///
/// These values cross the C ABI and never change meaning.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error
    Ok = 0,
    /// See [`KernelError::DuplicateClass`]
    DuplicateClass = 1,
    /// See [`KernelError::MethodIdCollision`]
    MethodIdCollision = 2,
    /// See [`KernelError::NotFound`]
    NotFound = 3,
    /// See [`KernelError::UnknownMethod`]
    UnknownMethod = 4,
    /// See [`KernelError::UseAfterFree`]
    UseAfterFree = 5,
    /// See [`KernelError::WrongDispatchKind`]
    WrongDispatchKind = 6,
    /// See [`KernelError::DoubleSeal`]
    DoubleSeal = 7,
    /// See [`KernelError::Bounds`]
    Bounds = 8,
    /// See [`KernelError::OutOfMemory`]
    OutOfMemory = 9,
    /// See [`KernelError::NotSealed`]
    NotSealed = 10,
    /// See [`KernelError::InvalidHandle`]
    InvalidHandle = 11,
    /// See [`KernelError::HandlerFailed`]
    HandlerFailed = 12,
    /// See [`KernelError::HandlerPanicked`]
    HandlerPanicked = 13,
    /// See [`KernelError::CallDepthExceeded`]
    CallDepthExceeded = 14,
}

impl KernelError {
    /// Get the stable code for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::DuplicateClass(_) => ErrorKind::DuplicateClass,
            KernelError::MethodIdCollision { .. } => ErrorKind::MethodIdCollision,
            KernelError::NotFound(_) => ErrorKind::NotFound,
            KernelError::UnknownMethod { .. } => ErrorKind::UnknownMethod,
            KernelError::UseAfterFree(_) => ErrorKind::UseAfterFree,
            KernelError::WrongDispatchKind(_) => ErrorKind::WrongDispatchKind,
            KernelError::DoubleSeal => ErrorKind::DoubleSeal,
            KernelError::NotSealed => ErrorKind::NotSealed,
            KernelError::Bounds { .. } => ErrorKind::Bounds,
            KernelError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            KernelError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            KernelError::HandlerFailed(_) => ErrorKind::HandlerFailed,
            KernelError::HandlerPanicked(_) => ErrorKind::HandlerPanicked,
            KernelError::CallDepthExceeded { .. } => ErrorKind::CallDepthExceeded,
        }
    }

    /// Check whether this error came from registration
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            KernelError::DuplicateClass(_) | KernelError::MethodIdCollision { .. }
        )
    }
}

impl From<String> for KernelError {
    fn from(s: String) -> Self {
        KernelError::HandlerFailed(s)
    }
}

impl From<&str> for KernelError {
    fn from(s: &str) -> Self {
        KernelError::HandlerFailed(s.to_string())
    }
}
