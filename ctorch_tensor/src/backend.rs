use libc::c_char;
use serde::Serialize;

use crate::engine::{self, ENGINE_NAME};
use crate::error::{ffi_guard, owned_string, write_out, BridgeError, Status};

#[derive(Debug, Serialize)]
pub struct BackendInfo {
    pub engine: &'static str,
    pub version: &'static str,
    pub cuda_available: bool,
    pub cudnn_available: bool,
    pub num_threads: i32,
    pub audit: bool,
}

pub fn backend_info() -> BackendInfo {
    BackendInfo {
        engine: ENGINE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        cuda_available: engine::cuda_is_available(),
        cudnn_available: engine::cudnn_is_available(),
        num_threads: engine::num_threads(),
        audit: cfg!(feature = "audit"),
    }
}

/// # Safety
/// `out` must be writable; the string is released with `ct_free_string`.
#[no_mangle]
pub unsafe extern "C" fn ct_backend_name(out: *mut *mut c_char) -> Status {
    ffi_guard("ct_backend_name", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        write_out(out, owned_string(ENGINE_NAME.to_string())?, "out")
    })
}

/// Writes a JSON object describing the compiled engine.
///
/// # Safety
/// `out` must be writable; the string is released with `ct_free_string`.
#[no_mangle]
pub unsafe extern "C" fn ct_backend_info(out: *mut *mut c_char) -> Status {
    ffi_guard("ct_backend_info", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        let json = serde_json::to_string(&backend_info())
            .map_err(|e| BridgeError::Invalid(e.to_string()))?;
        write_out(out, owned_string(json)?, "out")
    })
}
