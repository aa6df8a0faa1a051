//! Errors reported across the C ABI

use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::ptr;

use xcall_sdk::{ErrorKind, KernelError};

/// Code for a null pointer, bad UTF-8, or other malformed argument
pub const XCALL_INVALID_ARGUMENT: u32 = 100;

/// Failure of an FFI call
#[derive(Debug, thiserror::Error)]
pub enum FfiError {
    /// Error returned by the kernel
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// The caller passed something unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl FfiError {
    /// Numeric code; kernel errors keep their `ErrorKind` value
    pub fn code(&self) -> u32 {
        match self {
            FfiError::Kernel(e) => e.kind() as u32,
            FfiError::InvalidArgument(_) => XCALL_INVALID_ARGUMENT,
        }
    }
}

/// Error information handed to C
///
/// Allocated by the library, freed with `xcall_error_free()`.
#[repr(C)]
pub struct XcallError {
    code: u32,
    message: *mut c_char,
}

impl XcallError {
    pub(crate) fn code(&self) -> u32 {
        self.code
    }

    pub(crate) fn message(&self) -> *const c_char {
        self.message
    }
}

impl Drop for XcallError {
    fn drop(&mut self) {
        if !self.message.is_null() {
            // SAFETY: `message` came from `CString::into_raw` in `create_error`.
            drop(unsafe { CString::from_raw(self.message) });
        }
    }
}

/// Convert Rust string to C string (caller must free)
fn rust_to_c_string(s: &str) -> *mut c_char {
    match CString::new(s.replace('\0', " ")) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn create_error(error: &FfiError) -> *mut XcallError {
    Box::into_raw(Box::new(XcallError {
        code: error.code(),
        message: rust_to_c_string(&error.to_string()),
    }))
}

/// Set error out-parameter
///
/// # Safety
/// `error_out` must be null or valid for writes.
pub(crate) unsafe fn set_error(error_out: *mut *mut XcallError, error: FfiError) {
    log::debug!("xcall ffi call failed: {}", error);
    if !error_out.is_null() {
        *error_out = create_error(&error);
    }
}

/// Report a result: 0 on success, -1 with the error out-parameter filled
///
/// # Safety
/// `error_out` must be null or valid for writes.
pub(crate) unsafe fn status(result: Result<(), FfiError>, error_out: *mut *mut XcallError) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            set_error(error_out, e);
            -1
        }
    }
}

/// `ErrorKind` of a code, if it is one
pub fn error_kind(code: u32) -> Option<ErrorKind> {
    const KINDS: [ErrorKind; 15] = [
        ErrorKind::Ok,
        ErrorKind::DuplicateClass,
        ErrorKind::MethodIdCollision,
        ErrorKind::NotFound,
        ErrorKind::UnknownMethod,
        ErrorKind::UseAfterFree,
        ErrorKind::WrongDispatchKind,
        ErrorKind::DoubleSeal,
        ErrorKind::Bounds,
        ErrorKind::OutOfMemory,
        ErrorKind::NotSealed,
        ErrorKind::InvalidHandle,
        ErrorKind::HandlerFailed,
        ErrorKind::HandlerPanicked,
        ErrorKind::CallDepthExceeded,
    ];
    KINDS.iter().copied().find(|kind| *kind as u32 == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(FfiError::from(KernelError::DoubleSeal).code(), 7);
        assert_eq!(
            FfiError::InvalidArgument("null kernel").code(),
            XCALL_INVALID_ARGUMENT
        );
        assert_eq!(error_kind(5), Some(ErrorKind::UseAfterFree));
        assert_eq!(error_kind(XCALL_INVALID_ARGUMENT), None);
    }

    #[test]
    fn test_set_error() {
        let mut error: *mut XcallError = ptr::null_mut();
        unsafe {
            set_error(&mut error, FfiError::InvalidArgument("null kernel"));
            assert!(!error.is_null());
            assert_eq!((*error).code(), XCALL_INVALID_ARGUMENT);
            drop(Box::from_raw(error));
        }
    }

    #[test]
    fn test_interior_nul_is_replaced() {
        let message = rust_to_c_string("a\0b");
        assert!(!message.is_null());
        unsafe {
            let owned = CString::from_raw(message);
            assert_eq!(owned.to_str().unwrap(), "a b");
        }
    }
}
