//! xcall SDK - Lightweight SDK for bridge adapters and method handlers
//!
//! This crate provides the minimal types and traits needed to write handlers
//! and host-language bridges without depending on the kernel itself.
//!
//! # Example
//!
//! ```ignore
//! use xcall_sdk::{method_id, CallResult, ClassDef, KernelContext};
//!
//! let class = ClassDef::new("Greeter")
//!     .class_method("new", |_ctx, _recv, _args| CallResult::new(String::from("hi")))
//!     .instance_method("greet", |ctx, recv, _args| {
//!         let greeting = recv.and_then(|r| r.downcast::<String>()).cloned();
//!         ctx.build_message(greeting.unwrap_or_default().as_bytes()).into()
//!     });
//!
//! let greet = method_id("greet"); // cacheable across runs
//! ```

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod handle;
pub mod handler;
pub mod message;
pub mod method;

pub use context::{CallOutcome, KernelContext};
pub use error::{ErrorKind, KernelError, KernelResult};
pub use handle::{ClassHandleId, ClassId, Handle, HandleKind, InstanceId, MessageId, RawHandle};
pub use handler::{
    CallResult, ClassDef, ClassFinalizer, Handler, InstanceFinalizer, MethodDef, Payload,
    Receiver,
};
pub use message::{MessageView, SealedBuffer};
pub use method::{method_id, MethodId, MethodKind};
