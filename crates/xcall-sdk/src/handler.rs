//! Method handler capability
//!
//! Class methods and instance methods share a single handler shape:
//! `(context, receiver-or-none, sealed args) -> CallResult`. The dispatch
//! kind is chosen by which table the handler is registered in.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::KernelContext;
use crate::handle::{ClassId, InstanceId, MessageId};

/// Opaque host-owned object state; the kernel never looks inside
pub type Payload = Arc<dyn Any + Send + Sync>;

/// The receiver of an instance-method call
#[derive(Clone)]
pub struct Receiver {
    /// Handle of the receiving Instance
    pub instance: InstanceId,
    /// Class the Instance was constructed from
    pub class: ClassId,
    /// Host payload bound at construction
    pub payload: Payload,
}

impl Receiver {
    /// Borrow the payload as a concrete type
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        (*self.payload).downcast_ref::<T>()
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("instance", &self.instance)
            .field("class", &self.class)
            .finish()
    }
}

/// What a handler hands back to the dispatcher
pub enum CallResult {
    /// Constructor result; the kernel wraps it in a fresh Instance
    New(Payload),
    /// Sealed result message; the caller receives this reference
    ///
    /// A message the handler built is handed over as is. Returning the
    /// call's own args needs no retain; the dispatcher adds one.
    Message(MessageId),
    /// Handler-level failure
    Error(String),
}

impl CallResult {
    /// Create a constructor result from any payload value
    #[inline]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::New(Arc::new(value))
    }

    /// Create an error result
    #[inline]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallResult::New(_) => write!(f, "CallResult::New(..)"),
            CallResult::Message(id) => write!(f, "CallResult::Message({:?})", id),
            CallResult::Error(msg) => write!(f, "CallResult::Error({:?})", msg),
        }
    }
}

impl<E: std::fmt::Display> From<Result<MessageId, E>> for CallResult {
    fn from(result: Result<MessageId, E>) -> Self {
        match result {
            Ok(id) => CallResult::Message(id),
            Err(e) => CallResult::Error(e.to_string()),
        }
    }
}

/// A method handler
pub type Handler =
    Arc<dyn Fn(&dyn KernelContext, Option<&Receiver>, MessageId) -> CallResult + Send + Sync>;

/// Called exactly once when an Instance's refcount reaches zero
pub type InstanceFinalizer = Box<dyn FnOnce(InstanceId, Payload) + Send>;

/// Called exactly once when a ClassHandle's refcount reaches zero
pub type ClassFinalizer = Box<dyn FnOnce(ClassId) + Send>;

/// A named handler awaiting registration
#[derive(Clone)]
pub struct MethodDef {
    /// Method name; its id is derived from this
    pub name: String,
    /// Handler invoked on dispatch
    pub handler: Handler,
}

impl MethodDef {
    /// Create a method definition from a closure
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&dyn KernelContext, Option<&Receiver>, MessageId) -> CallResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef").field("name", &self.name).finish()
    }
}

/// A class definition: name plus both method tables
///
/// # Example
///
/// ```ignore
/// let class = ClassDef::new("Counter")
///     .class_method("new", |_ctx, _recv, _args| CallResult::new(0u64))
///     .instance_method("get", get_handler);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClassDef {
    /// Unique class name
    pub name: String,
    /// Methods invoked without a receiver
    pub class_methods: Vec<MethodDef>,
    /// Methods invoked on a live Instance
    pub instance_methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Start a class definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_methods: Vec::new(),
            instance_methods: Vec::new(),
        }
    }

    /// Add a class-level method
    pub fn class_method(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&dyn KernelContext, Option<&Receiver>, MessageId) -> CallResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.class_methods.push(MethodDef::new(name, handler));
        self
    }

    /// Add an instance method
    pub fn instance_method(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&dyn KernelContext, Option<&Receiver>, MessageId) -> CallResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.instance_methods.push(MethodDef::new(name, handler));
        self
    }
}
