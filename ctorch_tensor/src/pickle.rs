//! Tensor serialisation to owned byte buffers and to files.

use std::path::Path;

use libc::c_char;

use crate::engine::{Device, Tensor};
use crate::error::{cstr_to_str, ffi_guard, slice_in, write_out, Status};
use crate::handle::{borrow, write_handle, ByteBufferHandle, TensorHandle};

/// Bytes owned by the library until `ct_byte_buffer_free`.
#[derive(Debug, Default)]
pub struct ByteBuffer(Vec<u8>);

impl ByteBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        ByteBuffer(bytes)
    }
}

fn encode(t: &Tensor) -> crate::engine::Result<Vec<u8>> {
    if t.device().is_cuda() {
        t.copy_to(Device::Cpu)?.encode()
    } else {
        t.encode()
    }
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_encode(t: TensorHandle, out: *mut ByteBufferHandle) -> Status {
    ffi_guard("ct_tensor_encode", || {
        let bytes = encode(borrow(t)?)?;
        write_handle(out, ByteBuffer::from(bytes))
    })
}

/// Points `out` at the buffer's bytes, valid until the buffer is freed.
///
/// # Safety
/// `buf` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_byte_buffer_data(buf: ByteBufferHandle, out: *mut *const u8) -> Status {
    ffi_guard("ct_byte_buffer_data", || {
        write_out(out, borrow(buf)?.as_slice().as_ptr(), "out")
    })
}

/// # Safety
/// `buf` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_byte_buffer_size(buf: ByteBufferHandle, out: *mut usize) -> Status {
    ffi_guard("ct_byte_buffer_size", || write_out(out, borrow(buf)?.len(), "out"))
}

/// Rebuilds a tensor from `len` bytes produced by `ct_tensor_encode`. The bytes
/// are copied; the caller keeps ownership.
///
/// # Safety
/// `data` must hold `len` readable bytes; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_decode(
    data: *const u8,
    len: usize,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_decode", || {
        let bytes = slice_in(data, len, "data")?;
        write_handle(out, Tensor::decode(bytes)?)
    })
}

/// # Safety
/// `t` must be live; `path` NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_save(t: TensorHandle, path: *const c_char) -> Status {
    ffi_guard("ct_tensor_save", || {
        let path = cstr_to_str(path, "path")?;
        let t = borrow(t)?;
        if t.device().is_cuda() {
            t.copy_to(Device::Cpu)?.save(Path::new(path))?;
        } else {
            t.save(Path::new(path))?;
        }
        tracing::debug!(path, "tensor saved");
        Ok(())
    })
}

/// # Safety
/// `path` NUL-terminated; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_load(path: *const c_char, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_tensor_load", || {
        let path = cstr_to_str(path, "path")?;
        write_handle(out, Tensor::load(Path::new(path))?)
    })
}
