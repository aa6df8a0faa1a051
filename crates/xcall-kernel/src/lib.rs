//! xcall kernel - same-process cross-language call machinery
//!
//! This crate implements the runtime behind [`xcall_sdk::KernelContext`]:
//! - **Registry**: named classes with class and instance method tables (`registry`)
//! - **Object model**: refcounted Instances and ClassHandles with finalizers (`object`)
//! - **Arena**: segmented, sealable argument and result messages (`arena`)
//! - **Dispatch**: reentrant method invocation with pinned operands (`dispatch`)
//!
//! # Example
//!
//! ```rust,ignore
//! use xcall_kernel::{Kernel, KernelContext, ClassDef, CallResult};
//!
//! let kernel = Kernel::new();
//! let class = kernel.register(
//!     ClassDef::new("Counter").class_method("new", |_ctx, _recv, _args| CallResult::new(0u64)),
//! )?;
//! let handle = kernel.borrow_class_until_finalized(class, None)?;
//! let args = kernel.build_message(&[])?;
//! let counter = kernel.call_class_constructor(handle, Kernel::method_id("new"), None, args)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Segmented message storage
pub mod arena;

/// Kernel options and resource limits
pub mod config;

/// Call phases and the dispatcher
pub mod dispatch;

/// Instances and ClassHandles
pub mod object;

/// Class registry and method tables
pub mod registry;

/// Resource counters
pub mod stats;

mod kernel;
mod refcount;
mod slab;

// ============================================================================
// Re-exports
// ============================================================================

pub use arena::MessageArena;
pub use config::{KernelLimits, KernelOptions, DEFAULT_MAX_CALL_DEPTH, DEFAULT_SEGMENT_SIZE};
pub use dispatch::{current_depth, CallFrame, CallPhase, Target};
pub use kernel::Kernel;
pub use object::{InstanceState, ObjectModel};
pub use registry::{ClassDescriptor, ClassRegistry, ClassState, MethodDescriptor, MethodTable};
pub use stats::{KernelCounters, KernelStats};

pub use xcall_sdk::{
    method_id, CallOutcome, CallResult, ClassDef, ClassFinalizer, ClassHandleId, ClassId,
    ErrorKind, Handle, InstanceFinalizer, InstanceId, KernelContext, KernelError, KernelResult,
    MessageId, MessageView, MethodDef, MethodId, MethodKind, Payload, Receiver,
};
