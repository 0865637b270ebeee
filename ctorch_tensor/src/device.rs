use libc::c_char;

use crate::engine::{self, Device};
use crate::error::{cstr_to_str, ffi_guard, write_out, Status};
use crate::handle::{write_handle, DeviceHandle};

/// Creates a device handle from `cpu`, `cuda` or `cuda:N`.
///
/// # Safety
/// `name` must be a NUL-terminated string and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_device(name: *const c_char, out: *mut DeviceHandle) -> Status {
    ffi_guard("ct_device", || {
        let device = Device::parse(cstr_to_str(name, "name")?)?;
        write_handle(out, device)
    })
}

#[no_mangle]
pub extern "C" fn ct_set_num_threads(n: i32) -> Status {
    ffi_guard("ct_set_num_threads", || {
        engine::set_num_threads(n)?;
        tracing::debug!(threads = n, "intra-op threads set");
        Ok(())
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_cuda_is_available(out: *mut bool) -> Status {
    ffi_guard("ct_cuda_is_available", || {
        write_out(out, engine::cuda_is_available(), "out")
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_cudnn_is_available(out: *mut bool) -> Status {
    ffi_guard("ct_cudnn_is_available", || {
        write_out(out, engine::cudnn_is_available(), "out")
    })
}
