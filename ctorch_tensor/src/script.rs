//! TorchScript modules and the values their `forward` returns.
//!
//! Only the `torch` engine can load a module; the reference engine reports
//! "unsupported". Value handles work with either engine.

use std::path::Path;

use libc::c_char;

use crate::engine::{Module, Tensor};
use crate::error::{
    copy_out, cstr_to_str, ffi_guard, slice_in, write_out, BridgeError, Result, Status,
};
use crate::handle::{
    borrow, into_raw, write_handle, DeviceHandle, ModuleHandle, TensorHandle, ValueHandle,
};

/// Loads a module saved with `torch.jit.save` onto `device`.
///
/// # Safety
/// `path` NUL-terminated; `device` live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_module_load(
    path: *const c_char,
    device: DeviceHandle,
    out: *mut ModuleHandle,
) -> Status {
    ffi_guard("ct_module_load", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        let path = cstr_to_str(path, "path")?;
        let module = Module::load(Path::new(path), *borrow(device)?)?;
        tracing::info!(path, "module loaded");
        write_handle(out, module)
    })
}

/// Runs `forward` on `n` tensor arguments.
///
/// # Safety
/// `module` live; `inputs` must hold `n` live tensor handles; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_module_forward(
    module: ModuleHandle,
    inputs: *const TensorHandle,
    n: usize,
    out: *mut ValueHandle,
) -> Status {
    ffi_guard("ct_module_forward", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        let inputs = slice_in(inputs, n, "inputs")?
            .iter()
            .map(|&h| borrow(h))
            .collect::<Result<Vec<&Tensor>>>()?;
        write_handle(out, borrow(module)?.forward(&inputs)?)
    })
}

/// # Safety
/// `value` live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_ivalue_is_tensor(value: ValueHandle, out: *mut bool) -> Status {
    ffi_guard("ct_ivalue_is_tensor", || write_out(out, borrow(value)?.is_tensor(), "out"))
}

/// # Safety
/// `value` live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_ivalue_is_tuple(value: ValueHandle, out: *mut bool) -> Status {
    ffi_guard("ct_ivalue_is_tuple", || write_out(out, borrow(value)?.is_tuple(), "out"))
}

/// The tensor held by `value`, as a new handle aliasing it.
///
/// # Safety
/// `value` live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_ivalue_to_tensor(value: ValueHandle, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_ivalue_to_tensor", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        write_handle(out, borrow(value)?.to_tensor()?)
    })
}

/// Unpacks a tuple into `buf`, one value handle per element. Nothing is
/// allocated when `cap` is too small.
///
/// # Safety
/// `value` live; `buf` must have room for `cap` handles; `out_len` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_ivalue_to_tuple(
    value: ValueHandle,
    buf: *mut ValueHandle,
    cap: usize,
    out_len: *mut usize,
) -> Status {
    ffi_guard("ct_ivalue_to_tuple", || {
        if out_len.is_null() {
            return Err(BridgeError::NullPointer("out_len"));
        }
        let items = borrow(value)?.to_tuple()?;
        if items.len() > cap {
            return Err(BridgeError::BufferTooSmall {
                what: "values",
                needed: items.len(),
                capacity: cap,
            });
        }
        if !items.is_empty() && buf.is_null() {
            return Err(BridgeError::NullPointer("values"));
        }
        let handles: Vec<ValueHandle> = items.into_iter().map(into_raw).collect();
        copy_out(&handles, buf, cap, out_len, "values")
    })
}
