//! Method dispatch
//!
//! A call moves through `Pending -> Resolving -> Invoking -> Completed` or
//! ends in `Failed` at any step. Resolution and argument checks happen
//! before the handler runs, so a rejected call leaves every refcount and
//! lifecycle state as it found them.
//!
//! During `Invoking` the receiver (or class handle) and the argument message
//! are pinned by guards that drop after the handler returns. No kernel lock
//! is held while a handler runs; handlers may call back into the kernel on
//! the same thread, up to the configured depth.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{trace, warn};
use xcall_sdk::{
    CallOutcome, CallResult, ClassHandleId, InstanceFinalizer, InstanceId, KernelError,
    KernelResult, MessageId, MethodId, MethodKind,
};

use crate::kernel::Kernel;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Nesting level of the current thread's call, released on drop
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: Option<usize>) -> KernelResult<Self> {
        CALL_DEPTH.with(|depth| {
            let current = depth.get();
            if let Some(limit) = limit {
                if current >= limit {
                    return Err(KernelError::CallDepthExceeded { limit });
                }
            }
            depth.set(current + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Nesting level of dispatches on the current thread
pub fn current_depth() -> usize {
    CALL_DEPTH.with(|depth| depth.get())
}

/// Phase of an in-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Accepted, nothing checked yet
    Pending,
    /// Looking up the target and method
    Resolving,
    /// Handler running
    Invoking,
    /// Returned a result to the caller
    Completed,
    /// Returned an error to the caller
    Failed,
}

/// What a call is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A class method through a ClassHandle
    Class(ClassHandleId),
    /// An instance method on a receiver
    Instance(InstanceId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Class(id) => write!(f, "{}", id),
            Target::Instance(id) => write!(f, "{}", id),
        }
    }
}

/// Bookkeeping for one call
#[derive(Debug)]
pub struct CallFrame {
    /// Receiver or class handle
    pub target: Target,
    /// Requested method
    pub method: MethodId,
    /// Argument message
    pub args: MessageId,
    /// Nesting level this call occupies on its thread
    pub depth: usize,
    /// Current phase
    pub phase: CallPhase,
}

impl CallFrame {
    fn new(target: Target, method: MethodId, args: MessageId) -> Self {
        Self {
            target,
            method,
            args,
            depth: current_depth() + 1,
            phase: CallPhase::Pending,
        }
    }

    fn advance(&mut self, phase: CallPhase) {
        trace!(
            "[depth {}] {} {}: {:?} -> {:?}",
            self.depth,
            self.target,
            self.method,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    fn finish<T>(&mut self, result: &KernelResult<T>) {
        match result {
            Ok(_) => self.advance(CallPhase::Completed),
            Err(e) => {
                trace!("{} {} failed: {}", self.target, self.method, e);
                self.advance(CallPhase::Failed);
            }
        }
    }
}

/// Executes calls against a kernel
pub(crate) struct Dispatcher<'k> {
    kernel: &'k Kernel,
}

impl<'k> Dispatcher<'k> {
    pub(crate) fn new(kernel: &'k Kernel) -> Self {
        Self { kernel }
    }

    /// Dispatch a constructor; only an Instance result is accepted
    pub(crate) fn construct(
        &self,
        class: ClassHandleId,
        method: MethodId,
        finalizer: Option<InstanceFinalizer>,
        args: MessageId,
    ) -> KernelResult<InstanceId> {
        let mut frame = CallFrame::new(Target::Class(class), method, args);
        self.kernel.counters().record_dispatch();
        let result = self
            .invoke_class(&mut frame, class, finalizer)
            .and_then(|outcome| match outcome {
                CallOutcome::Instance(id) => Ok(id),
                CallOutcome::Message(message) => {
                    self.discard(message);
                    Err(KernelError::WrongDispatchKind(format!(
                        "constructor call to {} returned a message",
                        method
                    )))
                }
            });
        self.complete(&mut frame, &result);
        result
    }

    /// Dispatch a class method
    pub(crate) fn call_class(
        &self,
        class: ClassHandleId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<CallOutcome> {
        let mut frame = CallFrame::new(Target::Class(class), method, args);
        self.kernel.counters().record_dispatch();
        let result = self.invoke_class(&mut frame, class, None);
        self.complete(&mut frame, &result);
        result
    }

    /// Dispatch an instance method
    pub(crate) fn call_instance(
        &self,
        instance: InstanceId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<MessageId> {
        let mut frame = CallFrame::new(Target::Instance(instance), method, args);
        self.kernel.counters().record_dispatch();
        let result = self.invoke_instance(&mut frame, instance);
        self.complete(&mut frame, &result);
        result
    }

    fn complete<T>(&self, frame: &mut CallFrame, result: &KernelResult<T>) {
        if result.is_err() {
            self.kernel.counters().record_failure();
        }
        frame.finish(result);
    }

    fn invoke_class(
        &self,
        frame: &mut CallFrame,
        handle: ClassHandleId,
        finalizer: Option<InstanceFinalizer>,
    ) -> KernelResult<CallOutcome> {
        let _depth = DepthGuard::enter(self.kernel.options().limits.max_call_depth)?;

        frame.advance(CallPhase::Resolving);
        let pin = self.kernel.objects().pin_class(handle)?;
        let class = Arc::clone(pin.cell().class());
        let handler = Arc::clone(class.resolve(MethodKind::Class, frame.method)?.handler());
        let _args = self.kernel.arena().pin(frame.args)?;

        frame.advance(CallPhase::Invoking);
        let args = frame.args;
        let result = catch_unwind(AssertUnwindSafe(|| handler(self.kernel, None, args)))
            .map_err(|panic| contained(frame, &*panic))?;

        match result {
            CallResult::New(payload) => self
                .kernel
                .objects()
                .create_instance(&class, payload, finalizer)
                .map(CallOutcome::Instance),
            CallResult::Message(message) => {
                self.accept_result(message, args)?;
                Ok(CallOutcome::Message(message))
            }
            CallResult::Error(message) => Err(KernelError::HandlerFailed(message)),
        }
    }

    fn invoke_instance(
        &self,
        frame: &mut CallFrame,
        instance: InstanceId,
    ) -> KernelResult<MessageId> {
        let _depth = DepthGuard::enter(self.kernel.options().limits.max_call_depth)?;

        frame.advance(CallPhase::Resolving);
        let pin = self.kernel.objects().pin_instance(instance)?;
        let class = Arc::clone(pin.cell().class());
        let handler =
            Arc::clone(class.resolve(MethodKind::Instance, frame.method)?.handler());
        let _args = self.kernel.arena().pin(frame.args)?;
        let receiver = pin.cell().receiver();

        frame.advance(CallPhase::Invoking);
        let args = frame.args;
        let result = catch_unwind(AssertUnwindSafe(|| {
            handler(self.kernel, Some(&receiver), args)
        }))
        .map_err(|panic| contained(frame, &*panic))?;

        match result {
            CallResult::Message(message) => {
                self.accept_result(message, args)?;
                Ok(message)
            }
            CallResult::New(_) => Err(KernelError::WrongDispatchKind(format!(
                "instance method {} on '{}' returned a new object",
                frame.method,
                class.name()
            ))),
            CallResult::Error(message) => Err(KernelError::HandlerFailed(message)),
        }
    }

    /// A handler result must be a live, sealed message
    ///
    /// Echoing the call's own args gains a reference for the caller, who
    /// still owns the one it passed in.
    fn accept_result(&self, message: MessageId, args: MessageId) -> KernelResult<()> {
        if message == args {
            return self.kernel.arena().retain(message);
        }
        if self.kernel.arena().is_sealed(message)? {
            Ok(())
        } else {
            self.discard(message);
            Err(KernelError::NotSealed)
        }
    }

    fn discard(&self, message: MessageId) {
        if let Err(e) = self.kernel.arena().release(message) {
            warn!("failed to release discarded result {}: {}", message, e);
        }
    }
}

/// Convert a handler unwind into an error value
fn contained(frame: &CallFrame, panic: &(dyn Any + Send)) -> KernelError {
    let message = panic_message(panic);
    warn!("handler for {} {} panicked: {}", frame.target, frame.method, message);
    KernelError::HandlerPanicked(message)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
