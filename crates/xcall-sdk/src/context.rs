//! KernelContext trait: abstract kernel operations
//!
//! Handlers and bridges program against this trait without depending on
//! kernel internals. The kernel crate provides the concrete implementation.
//! Every operation is synchronous and reentrant: a handler may call back
//! into the context it was handed.

use crate::error::KernelResult;
use crate::handle::{ClassHandleId, ClassId, Handle, InstanceId, MessageId};
use crate::handler::{ClassFinalizer, InstanceFinalizer};
use crate::message::MessageView;
use crate::method::MethodId;

/// Tagged result of a completed dispatch
///
/// The caller owns one reference to whatever is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A freshly constructed Instance
    Instance(InstanceId),
    /// A sealed result message
    Message(MessageId),
}

impl CallOutcome {
    /// Get the Instance, if this outcome constructed one
    pub fn instance(self) -> Option<InstanceId> {
        match self {
            CallOutcome::Instance(id) => Some(id),
            CallOutcome::Message(_) => None,
        }
    }

    /// Get the message, if this outcome produced one
    pub fn message(self) -> Option<MessageId> {
        match self {
            CallOutcome::Message(id) => Some(id),
            CallOutcome::Instance(_) => None,
        }
    }

    /// The owned reference as a generic handle
    pub fn handle(self) -> Handle {
        match self {
            CallOutcome::Instance(id) => Handle::Instance(id),
            CallOutcome::Message(id) => Handle::Message(id),
        }
    }
}

/// Abstract kernel context.
///
/// This trait is the single entry point handlers use for message
/// construction, refcounting, and nested calls.
pub trait KernelContext {
    // ========================================================================
    // Message Construction
    // ========================================================================

    /// Start building a message; the caller is its single owner
    fn begin_build(&self) -> KernelResult<MessageId>;

    /// Append bytes, returning the logical offset they were written at
    fn grow(&self, message: MessageId, bytes: &[u8]) -> KernelResult<usize>;

    /// Reserve `len` zeroed bytes, returning their logical offset
    fn allocate(&self, message: MessageId, len: usize) -> KernelResult<usize>;

    /// Overwrite previously reserved bytes of a message under construction
    fn write(&self, message: MessageId, offset: usize, bytes: &[u8]) -> KernelResult<()>;

    /// Freeze a building message; one-way
    fn seal(&self, message: MessageId) -> KernelResult<MessageId>;

    // ========================================================================
    // Message Inspection
    // ========================================================================

    /// Zero-copy view of a sealed message's bytes
    fn read(&self, message: MessageId, offset: usize, length: usize)
        -> KernelResult<MessageView>;

    /// Sealed extent of a message
    fn message_len(&self, message: MessageId) -> KernelResult<usize>;

    // ========================================================================
    // Reference Counting
    // ========================================================================

    /// Add one reference
    fn retain(&self, handle: Handle) -> KernelResult<()>;

    /// Drop one reference; destruction runs on the zero transition
    fn release(&self, handle: Handle) -> KernelResult<()>;

    // ========================================================================
    // Classes
    // ========================================================================

    /// Find a registered class by name
    fn lookup_class(&self, name: &str) -> KernelResult<ClassId>;

    /// Borrow a class; the finalizer runs when the handle's refcount hits zero
    fn borrow_class_until_finalized(
        &self,
        class: ClassId,
        finalizer: Option<ClassFinalizer>,
    ) -> KernelResult<ClassHandleId>;

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Invoke a class method that must construct an Instance
    fn call_class_constructor(
        &self,
        class: ClassHandleId,
        method: MethodId,
        finalizer: Option<InstanceFinalizer>,
        args: MessageId,
    ) -> KernelResult<InstanceId>;

    /// Invoke any class method
    fn call_class_method(
        &self,
        class: ClassHandleId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<CallOutcome>;

    /// Invoke an instance method on a live receiver
    fn call_instance_method(
        &self,
        instance: InstanceId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<MessageId>;

    // ========================================================================
    // Convenience
    // ========================================================================

    /// Build and seal a single-segment message from bytes
    fn build_message(&self, bytes: &[u8]) -> KernelResult<MessageId> {
        let message = self.begin_build()?;
        if let Err(e) = self.grow(message, bytes) {
            let _ = self.release(Handle::Message(message));
            return Err(e);
        }
        self.seal(message)
    }

    /// Read a whole sealed message
    fn read_all(&self, message: MessageId) -> KernelResult<MessageView> {
        let len = self.message_len(message)?;
        self.read(message, 0, len)
    }
}
