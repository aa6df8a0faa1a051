//! C FFI bindings for the xcall kernel
//!
//! This crate exposes the kernel to any runtime that can call C functions.
//! The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Thread-safe (a kernel can be used from multiple threads at once)
//! - Error handling via out-parameters
//! - Opaque pointers for the kernel and errors, plain integers for handles
//!
//! Handles cross the boundary as the kind-tagged `uint64_t` encoding of
//! `xcall_sdk::Handle`; method ids as `uint32_t`. Host objects are `void*`
//! payloads the kernel never dereferences.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod error;

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;

use xcall_kernel::{Kernel, KernelOptions};
use xcall_sdk::{
    method_id, CallResult, ClassDef, ClassFinalizer, ClassHandleId, ClassId, Handle,
    InstanceFinalizer, InstanceId, KernelContext, MessageId, MethodDef, MethodId, Payload,
};

pub use error::{error_kind, FfiError, XcallError, XCALL_INVALID_ARGUMENT};
use error::{set_error, status};

// ============================================================================
// Opaque Types
// ============================================================================

/// Opaque handle to a kernel
#[repr(C)]
pub struct XcallKernel {
    _private: [u8; 0],
}

// Internal representation of a kernel (not exposed to C)
struct KernelHandle {
    kernel: Kernel,
}

/// Foreign pointer carried through Rust closures and payloads
#[derive(Clone, Copy)]
struct ForeignPtr(*mut c_void);

// SAFETY: the kernel never dereferences foreign pointers; the host that
// supplied them is responsible for their thread-safety.
unsafe impl Send for ForeignPtr {}
unsafe impl Sync for ForeignPtr {}

impl ForeignPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

// ============================================================================
// Handler Types
// ============================================================================

/// `XcallResult::tag`: `payload` becomes a new Instance
pub const XCALL_RESULT_NEW: u32 = 0;

/// `XcallResult::tag`: `message` is a sealed result message
pub const XCALL_RESULT_MESSAGE: u32 = 1;

/// `XcallResult::tag`: `error` describes a handler failure
pub const XCALL_RESULT_ERROR: u32 = 2;

/// Value returned by a C handler
#[repr(C)]
pub struct XcallResult {
    /// Which field is meaningful, one of the `XCALL_RESULT_*` constants;
    /// any other value fails the call
    pub tag: u32,
    /// Constructor payload for `New`
    pub payload: *mut c_void,
    /// Packed message handle for `Message`
    pub message: u64,
    /// Null-terminated message for `Error`; copied before the handler's
    /// frame is gone, may be null
    pub error: *const c_char,
}

/// C method handler
///
/// `receiver` is the packed Instance handle (0 for class methods) and
/// `payload` its constructor payload (null for class methods). `kernel` is the
/// kernel the class was registered with; handlers may call back into it.
pub type XcallHandlerFn = unsafe extern "C" fn(
    kernel: *const XcallKernel,
    user_data: *mut c_void,
    receiver: u64,
    payload: *mut c_void,
    args: u64,
) -> XcallResult;

/// Instance finalizer: receives the constructor payload
pub type XcallInstanceFinalizerFn = unsafe extern "C" fn(payload: *mut c_void, user_data: *mut c_void);

/// ClassHandle finalizer: receives the class id
pub type XcallClassFinalizerFn = unsafe extern "C" fn(class: u32, user_data: *mut c_void);

/// One method of a class being registered
#[repr(C)]
pub struct XcallMethodDef {
    /// Null-terminated UTF-8 method name
    pub name: *const c_char,
    /// Handler
    pub handler: Option<XcallHandlerFn>,
    /// Passed back to the handler on every call
    pub user_data: *mut c_void,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Borrow the kernel behind an opaque pointer
///
/// # Safety
/// `kernel` must be null or a live pointer from `xcall_kernel_new()`.
unsafe fn kernel_ref<'a>(kernel: *const XcallKernel) -> Result<&'a Kernel, FfiError> {
    if kernel.is_null() {
        return Err(FfiError::InvalidArgument("null kernel"));
    }
    Ok(&(*(kernel as *const KernelHandle)).kernel)
}

/// # Safety
/// `s` must be null or a valid null-terminated string.
unsafe fn c_str<'a>(s: *const c_char, what: &'static str) -> Result<&'a str, FfiError> {
    if s.is_null() {
        return Err(FfiError::InvalidArgument(what));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| FfiError::InvalidArgument(what))
}

/// # Safety
/// `out` must be null or valid for writes.
unsafe fn write_out<T>(out: *mut T, value: T) {
    if !out.is_null() {
        *out = value;
    }
}

fn method(raw: u32) -> Result<MethodId, FfiError> {
    MethodId::from_raw(raw).ok_or(FfiError::InvalidArgument("method id has reserved bit set"))
}

/// Wrap a C handler in a kernel handler
fn wrap_handler(
    name: &str,
    kernel: *const XcallKernel,
    handler: XcallHandlerFn,
    user_data: *mut c_void,
) -> MethodDef {
    let kernel = ForeignPtr(kernel as *mut c_void);
    let user_data = ForeignPtr(user_data);
    MethodDef::new(name, move |_ctx, receiver, args| {
        let (receiver_bits, payload) = match receiver {
            Some(receiver) => (
                Handle::Instance(receiver.instance).to_bits(),
                receiver
                    .downcast::<ForeignPtr>()
                    .map_or(ptr::null_mut(), |p| p.get()),
            ),
            None => (0, ptr::null_mut()),
        };
        // SAFETY: the host registered `handler` for this kernel and
        // guarantees it is callable with these arguments.
        let result = unsafe {
            handler(
                kernel.get() as *const XcallKernel,
                user_data.get(),
                receiver_bits,
                payload,
                Handle::Message(args).to_bits(),
            )
        };
        // SAFETY: `error` is null or a string valid for this call.
        unsafe { into_call_result(result) }
    })
}

/// # Safety
/// `result.error` must be null or a valid null-terminated string.
unsafe fn into_call_result(result: XcallResult) -> CallResult {
    match result.tag {
        XCALL_RESULT_NEW => CallResult::new(ForeignPtr(result.payload)),
        XCALL_RESULT_MESSAGE => match MessageId::from_bits(result.message) {
            Ok(message) => CallResult::Message(message),
            Err(e) => CallResult::error(e.to_string()),
        },
        XCALL_RESULT_ERROR => {
            if result.error.is_null() {
                CallResult::error("handler failed")
            } else {
                CallResult::error(CStr::from_ptr(result.error).to_string_lossy().into_owned())
            }
        }
        tag => CallResult::error(format!("invalid result tag {}", tag)),
    }
}

/// # Safety
/// `defs` must be null (with `count == 0`) or valid for `count` elements,
/// each with a valid name string.
unsafe fn method_defs(
    kernel: *const XcallKernel,
    defs: *const XcallMethodDef,
    count: usize,
) -> Result<Vec<MethodDef>, FfiError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if defs.is_null() {
        return Err(FfiError::InvalidArgument("null method array"));
    }
    slice::from_raw_parts(defs, count)
        .iter()
        .map(|def| {
            let name = c_str(def.name, "invalid method name")?;
            let handler = def
                .handler
                .ok_or(FfiError::InvalidArgument("null method handler"))?;
            Ok(wrap_handler(name, kernel, handler, def.user_data))
        })
        .collect()
}

// ============================================================================
// Kernel Lifecycle Functions
// ============================================================================

/// Create a new kernel
///
/// # Arguments
/// * `segment_size` - Capacity of each message segment in bytes (0 = default)
///
/// # Returns
/// * Non-null pointer to XcallKernel; construction cannot fail
///
/// # Safety
/// The returned kernel must be freed with `xcall_kernel_free()`
///
/// # Example (C)
/// ```c
/// XcallKernel* kernel = xcall_kernel_new(0);
/// // Register classes, dispatch...
/// xcall_kernel_free(kernel);
/// ```
#[no_mangle]
pub unsafe extern "C" fn xcall_kernel_new(segment_size: usize) -> *mut XcallKernel {
    let mut options = KernelOptions::default();
    if segment_size != 0 {
        options = options.segment_size(segment_size);
    }
    let handle = Box::new(KernelHandle {
        kernel: Kernel::init(options),
    });
    Box::into_raw(handle) as *mut XcallKernel
}

/// Tear down a kernel and free all resources
///
/// Every Instance and ClassHandle finalizer that has not run yet runs now.
///
/// # Safety
/// - Kernel pointer must be null or valid (created by `xcall_kernel_new()`)
/// - Kernel must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn xcall_kernel_free(kernel: *mut XcallKernel) {
    if kernel.is_null() {
        return;
    }
    let handle = Box::from_raw(kernel as *mut KernelHandle);
    let stats = handle.kernel.teardown();
    log::debug!("kernel freed: {:?}", stats);
}

/// Method id of a name
///
/// # Returns
/// * The 31-bit method id
/// * `0xFFFFFFFF` (reserved bit set, never a valid id) if `name` is null or
///   not UTF-8
///
/// # Safety
/// `name` must be null or a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn xcall_method_id(name: *const c_char) -> u32 {
    match c_str(name, "invalid method name") {
        Ok(name) => method_id(name).as_u32(),
        Err(_) => u32::MAX,
    }
}

// ============================================================================
// Class Functions
// ============================================================================

/// Register a class
///
/// # Arguments
/// * `kernel` - Pointer to XcallKernel (must not be NULL)
/// * `name` - Null-terminated class name
/// * `class_methods` / `class_method_count` - Class-level methods
/// * `instance_methods` / `instance_method_count` - Instance methods
/// * `out_class` - Receives the class id
/// * `error` - Optional pointer to receive error information
///
/// # Returns
/// * 0 on success
/// * -1 on failure; nothing was registered
///
/// # Safety
/// All pointers must be valid for the given counts. Handlers and their
/// `user_data` must stay valid until the kernel is freed.
#[no_mangle]
pub unsafe extern "C" fn xcall_register_class(
    kernel: *const XcallKernel,
    name: *const c_char,
    class_methods: *const XcallMethodDef,
    class_method_count: usize,
    instance_methods: *const XcallMethodDef,
    instance_method_count: usize,
    out_class: *mut u32,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let k = kernel_ref(kernel)?;
        let def = ClassDef {
            name: c_str(name, "invalid class name")?.to_string(),
            class_methods: method_defs(kernel, class_methods, class_method_count)?,
            instance_methods: method_defs(kernel, instance_methods, instance_method_count)?,
        };
        let class = k.register(def)?;
        write_out(out_class, class.as_u32());
        Ok(())
    })();
    status(result, error)
}

/// Look up a class by name
///
/// # Safety
/// `kernel` must be valid; `name` a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn xcall_lookup_class(
    kernel: *const XcallKernel,
    name: *const c_char,
    out_class: *mut u32,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let class = kernel_ref(kernel)?.lookup(c_str(name, "invalid class name")?)?;
        write_out(out_class, class.as_u32());
        Ok(())
    })();
    status(result, error)
}

/// Request removal of a class
///
/// # Returns
/// * 1 if the class was removed immediately
/// * 0 if removal waits for outstanding handles and instances
/// * -1 on failure
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_unregister_class(
    kernel: *const XcallKernel,
    class: u32,
    error: *mut *mut XcallError,
) -> c_int {
    match kernel_ref(kernel).and_then(|k| Ok(k.unregister(ClassId(class))?)) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            set_error(error, e);
            -1
        }
    }
}

/// Borrow a class until the returned handle's refcount reaches zero
///
/// # Safety
/// `kernel` must be valid; `finalizer` and `user_data` must stay valid until
/// the finalizer has run
#[no_mangle]
pub unsafe extern "C" fn xcall_borrow_class_until_finalized(
    kernel: *const XcallKernel,
    class: u32,
    finalizer: Option<XcallClassFinalizerFn>,
    user_data: *mut c_void,
    out_handle: *mut u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let k = kernel_ref(kernel)?;
        let finalizer = finalizer.map(|f| {
            let user_data = ForeignPtr(user_data);
            Box::new(move |class: ClassId| {
                // SAFETY: the host keeps `f` and `user_data` valid until now.
                unsafe { f(class.as_u32(), user_data.get()) }
            }) as ClassFinalizer
        });
        let handle = k.borrow_class_until_finalized(ClassId(class), finalizer)?;
        write_out(out_handle, Handle::Class(handle).to_bits());
        Ok(())
    })();
    status(result, error)
}

// ============================================================================
// Dispatch Functions
// ============================================================================

/// Call a constructor through a class handle
///
/// # Arguments
/// * `class_handle` - Packed ClassHandle
/// * `method` - Method id
/// * `finalizer` / `user_data` - Optional finalizer for the new Instance
/// * `args` - Packed sealed message
/// * `out_instance` - Receives the packed Instance handle (refcount 1)
///
/// # Safety
/// `kernel` must be valid; `finalizer` and `user_data` must stay valid until
/// the finalizer has run
#[no_mangle]
pub unsafe extern "C" fn xcall_call_class_constructor(
    kernel: *const XcallKernel,
    class_handle: u64,
    method_id: u32,
    finalizer: Option<XcallInstanceFinalizerFn>,
    user_data: *mut c_void,
    args: u64,
    out_instance: *mut u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let k = kernel_ref(kernel)?;
        let finalizer = finalizer.map(|f| {
            let user_data = ForeignPtr(user_data);
            Box::new(move |_instance: InstanceId, payload: Payload| {
                let payload = payload
                    .downcast_ref::<ForeignPtr>()
                    .map_or(ptr::null_mut(), |p| p.get());
                // SAFETY: the host keeps `f` and `user_data` valid until now.
                unsafe { f(payload, user_data.get()) }
            }) as InstanceFinalizer
        });
        let instance = k.call_class_constructor(
            ClassHandleId::from_bits(class_handle)?,
            method(method_id)?,
            finalizer,
            MessageId::from_bits(args)?,
        )?;
        write_out(out_instance, Handle::Instance(instance).to_bits());
        Ok(())
    })();
    status(result, error)
}

/// Call any class method
///
/// `out_handle` receives either a packed Instance or a packed Message; the
/// top byte of the handle tells which.
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_call_class_method(
    kernel: *const XcallKernel,
    class_handle: u64,
    method_id: u32,
    args: u64,
    out_handle: *mut u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let outcome = kernel_ref(kernel)?.call_class_method(
            ClassHandleId::from_bits(class_handle)?,
            method(method_id)?,
            MessageId::from_bits(args)?,
        )?;
        write_out(out_handle, outcome.handle().to_bits());
        Ok(())
    })();
    status(result, error)
}

/// Call an instance method
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_call_instance_method(
    kernel: *const XcallKernel,
    instance: u64,
    method_id: u32,
    args: u64,
    out_message: *mut u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let message = kernel_ref(kernel)?.call_instance_method(
            InstanceId::from_bits(instance)?,
            method(method_id)?,
            MessageId::from_bits(args)?,
        )?;
        write_out(out_message, Handle::Message(message).to_bits());
        Ok(())
    })();
    status(result, error)
}

// ============================================================================
// Reference Counting Functions
// ============================================================================

/// Add a reference to any packed handle
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_retain(
    kernel: *const XcallKernel,
    handle: u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = kernel_ref(kernel).and_then(|k| Ok(k.retain(Handle::from_bits(handle)?)?));
    status(result, error)
}

/// Drop a reference to any packed handle
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_release(
    kernel: *const XcallKernel,
    handle: u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = kernel_ref(kernel).and_then(|k| Ok(k.release(Handle::from_bits(handle)?)?));
    status(result, error)
}

// ============================================================================
// Message Functions
// ============================================================================

/// Start building a message
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_begin_build(
    kernel: *const XcallKernel,
    out_message: *mut u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let message = kernel_ref(kernel)?.begin_build()?;
        write_out(out_message, Handle::Message(message).to_bits());
        Ok(())
    })();
    status(result, error)
}

/// Append bytes to a building message
///
/// `out_offset` receives the logical offset the bytes were written at.
///
/// # Safety
/// `kernel` must be valid; `bytes` valid for `length` bytes
#[no_mangle]
pub unsafe extern "C" fn xcall_grow(
    kernel: *const XcallKernel,
    message: u64,
    bytes: *const u8,
    length: usize,
    out_offset: *mut usize,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let data = if length == 0 {
            &[][..]
        } else if bytes.is_null() {
            return Err(FfiError::InvalidArgument("null bytes"));
        } else {
            slice::from_raw_parts(bytes, length)
        };
        let offset = kernel_ref(kernel)?.grow(MessageId::from_bits(message)?, data)?;
        write_out(out_offset, offset);
        Ok(())
    })();
    status(result, error)
}

/// Reserve zeroed bytes in a building message
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_allocate(
    kernel: *const XcallKernel,
    message: u64,
    length: usize,
    out_offset: *mut usize,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let offset = kernel_ref(kernel)?.allocate(MessageId::from_bits(message)?, length)?;
        write_out(out_offset, offset);
        Ok(())
    })();
    status(result, error)
}

/// Overwrite previously appended bytes of a building message
///
/// # Safety
/// `kernel` must be valid; `bytes` valid for `length` bytes
#[no_mangle]
pub unsafe extern "C" fn xcall_write(
    kernel: *const XcallKernel,
    message: u64,
    offset: usize,
    bytes: *const u8,
    length: usize,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        if bytes.is_null() && length != 0 {
            return Err(FfiError::InvalidArgument("null bytes"));
        }
        let data = if length == 0 {
            &[][..]
        } else {
            slice::from_raw_parts(bytes, length)
        };
        Ok(kernel_ref(kernel)?.write(MessageId::from_bits(message)?, offset, data)?)
    })();
    status(result, error)
}

/// Seal a building message
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_seal(
    kernel: *const XcallKernel,
    message: u64,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        kernel_ref(kernel)?.seal(MessageId::from_bits(message)?)?;
        Ok(())
    })();
    status(result, error)
}

/// Copy bytes out of a sealed message
///
/// # Safety
/// `kernel` must be valid; `out` valid for `length` bytes
#[no_mangle]
pub unsafe extern "C" fn xcall_read(
    kernel: *const XcallKernel,
    message: u64,
    offset: usize,
    length: usize,
    out: *mut u8,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        if out.is_null() && length != 0 {
            return Err(FfiError::InvalidArgument("null output buffer"));
        }
        let view = kernel_ref(kernel)?.read(MessageId::from_bits(message)?, offset, length)?;
        if length != 0 {
            ptr::copy_nonoverlapping(view.as_ptr(), out, length);
        }
        Ok(())
    })();
    status(result, error)
}

/// Sealed length of a message
///
/// # Safety
/// `kernel` must be valid
#[no_mangle]
pub unsafe extern "C" fn xcall_message_len(
    kernel: *const XcallKernel,
    message: u64,
    out_length: *mut usize,
    error: *mut *mut XcallError,
) -> c_int {
    let result = (|| -> Result<(), FfiError> {
        let length = kernel_ref(kernel)?.message_len(MessageId::from_bits(message)?)?;
        write_out(out_length, length);
        Ok(())
    })();
    status(result, error)
}

// ============================================================================
// Error Handling Functions
// ============================================================================

/// Get the numeric code of an error
///
/// Kernel errors use their `ErrorKind` value; `XCALL_INVALID_ARGUMENT` marks
/// malformed arguments.
///
/// # Safety
/// Error pointer must be null or valid
#[no_mangle]
pub unsafe extern "C" fn xcall_error_code(error: *const XcallError) -> u32 {
    if error.is_null() {
        return 0;
    }
    (*error).code()
}

/// Get the error message
///
/// # Returns
/// * Null-terminated error message
/// * NULL if error is NULL
///
/// # Safety
/// - Error pointer must be valid
/// - The returned string is owned by the error and freed with it
#[no_mangle]
pub unsafe extern "C" fn xcall_error_message(error: *const XcallError) -> *const c_char {
    if error.is_null() {
        return ptr::null();
    }
    (*error).message()
}

/// Free an error
///
/// # Safety
/// - Error pointer must be null or valid (created by an xcall function)
/// - Error must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn xcall_error_free(error: *mut XcallError) {
    if error.is_null() {
        return;
    }
    drop(Box::from_raw(error));
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the library version string
///
/// # Safety
/// The returned string is static and must not be freed
#[no_mangle]
pub unsafe extern "C" fn xcall_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

// ============================================================================
// Tests
// ============================================================================
