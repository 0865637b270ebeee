//! Status strings and the panic guard shared by every exported function.

use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use ctorch_data::DataError;
use libc::c_char;
use thiserror::Error;

use crate::engine::EngineError;
use crate::handle::HandleKind;

/// Null on success, otherwise an owned message released with [`ct_free_string`].
pub type Status = *mut c_char;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("null {0} handle")]
    NullHandle(HandleKind),

    #[error("null pointer passed for {0}")]
    NullPointer(&'static str),

    #[error("{0} is not valid UTF-8")]
    Utf8(&'static str),

    #[error("{what} buffer too small: need {needed}, capacity {capacity}")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        capacity: usize,
    },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("loader closed")]
    LoaderClosed,

    #[error("iterator exhausted")]
    IteratorExhausted,

    /// Only raised with the `audit` feature: the address is not a live handle
    /// of this kind (already closed, or never produced by this library).
    #[error("{kind} handle {addr:#x} is not live")]
    StaleHandle { kind: HandleKind, addr: usize },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub(crate) fn catch<T, F>(default: T, f: F) -> T
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(panic = %msg, "panic caught at ffi boundary");
            default
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic across FFI boundary".to_string()
    }
}

/// Runs `f`, turning its error or panic into an owned status message.
pub(crate) fn ffi_guard<F>(op: &'static str, f: F) -> Status
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => ptr::null_mut(),
        Ok(Err(err)) => {
            tracing::debug!(op, error = %err, "returning error status");
            status_from(err.to_string())
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::warn!(op, panic = %msg, "panic caught at ffi boundary");
            status_from(format!("panic: {}", msg))
        }
    }
}

pub(crate) fn status_from(message: String) -> Status {
    CString::new(message.replace('\0', "\\0"))
        .unwrap_or_default()
        .into_raw()
}

pub(crate) fn owned_string(s: String) -> Result<*mut c_char> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| BridgeError::Invalid("string contained an interior NUL".to_string()))
}

pub(crate) unsafe fn cstr_to_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| BridgeError::Utf8(what))
}

pub(crate) unsafe fn write_out<T>(out: *mut T, value: T, what: &'static str) -> Result<()> {
    if out.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    out.write(value);
    Ok(())
}

/// Borrows a caller array. A zero length never dereferences `ptr`.
pub(crate) unsafe fn slice_in<'a, T>(
    ptr: *const T,
    len: usize,
    what: &'static str,
) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

/// Copies `values` into a caller buffer of `capacity` elements and reports
/// the count through `out_len`.
pub(crate) unsafe fn copy_out<T: Copy>(
    values: &[T],
    buf: *mut T,
    capacity: usize,
    out_len: *mut usize,
    what: &'static str,
) -> Result<()> {
    if out_len.is_null() {
        return Err(BridgeError::NullPointer("out_len"));
    }
    if values.len() > capacity {
        return Err(BridgeError::BufferTooSmall {
            what,
            needed: values.len(),
            capacity,
        });
    }
    if !values.is_empty() {
        if buf.is_null() {
            return Err(BridgeError::NullPointer(what));
        }
        ptr::copy_nonoverlapping(values.as_ptr(), buf, values.len());
    }
    out_len.write(values.len());
    Ok(())
}

/// Releases a string produced by this library: a failure `Status`,
/// `ct_tensor_string`, `ct_backend_name` or `ct_backend_info`.
///
/// # Safety
/// `s` must be null or a pointer returned by one of those calls, freed once.
#[no_mangle]
pub unsafe extern "C" fn ct_free_string(s: *mut c_char) {
    catch((), || {
        if !s.is_null() {
            drop(CString::from_raw(s));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(status: Status) -> Option<String> {
        if status.is_null() {
            return None;
        }
        let msg = unsafe { CStr::from_ptr(status) }.to_string_lossy().into_owned();
        unsafe { ct_free_string(status) };
        Some(msg)
    }

    #[test]
    fn guard_maps_ok_error_and_panic() {
        assert_eq!(take(ffi_guard("ok", || Ok(()))), None);
        assert_eq!(
            take(ffi_guard("err", || Err(BridgeError::IteratorExhausted))).as_deref(),
            Some("iterator exhausted")
        );
        let msg = take(ffi_guard("boom", || panic!("kaboom"))).unwrap();
        assert_eq!(msg, "panic: kaboom");
    }

    #[test]
    fn copy_out_rejects_small_buffers() {
        let mut buf = [0i64; 2];
        let mut n = 0usize;
        let err =
            unsafe { copy_out(&[1i64, 2, 3], buf.as_mut_ptr(), 2, &mut n, "shape") }.unwrap_err();
        assert!(matches!(err, BridgeError::BufferTooSmall { needed: 3, .. }));
        unsafe { copy_out(&[4i64, 5], buf.as_mut_ptr(), 2, &mut n, "shape") }.unwrap();
        assert_eq!((buf, n), ([4, 5], 2));
    }

    #[test]
    fn status_survives_interior_nul() {
        let msg = take(status_from("a\0b".to_string())).unwrap();
        assert_eq!(msg, "a\\0b");
    }
}
