#![allow(dead_code)]

use std::ffi::{CStr, CString};
use std::ptr;

use ctorch_tensor::{ct_free_string, DeviceHandle, Status, TensorHandle};

pub const FLOAT: i32 = 6;
pub const LONG: i32 = 4;

/// Frees `status` and returns its message, `None` on success.
pub fn take(status: Status) -> Option<String> {
    if status.is_null() {
        return None;
    }
    let msg = unsafe { CStr::from_ptr(status) }.to_string_lossy().into_owned();
    unsafe { ct_free_string(status) };
    Some(msg)
}

#[track_caller]
pub fn ok(status: Status) {
    if let Some(msg) = take(status) {
        panic!("unexpected error status: {msg}");
    }
}

#[track_caller]
pub fn err(status: Status) -> String {
    take(status).expect("expected an error status")
}

pub fn cstr(s: &str) -> CString {
    CString::new(s).unwrap()
}

pub fn cpu() -> DeviceHandle {
    let mut dev = ptr::null_mut();
    ok(unsafe { ctorch_tensor::device::ct_device(cstr("cpu").as_ptr(), &mut dev) });
    dev
}

pub fn f32_tensor(values: &[f32], shape: &[i64]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let mut t = ptr::null_mut();
    ok(unsafe {
        ctorch_tensor::tensor::ct_tensor_from_blob(
            bytes.as_ptr(),
            bytes.len(),
            shape.as_ptr(),
            shape.len(),
            FLOAT,
            &mut t,
        )
    });
    t
}

pub fn i64_tensor(values: &[i64], shape: &[i64]) -> TensorHandle {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let mut t = ptr::null_mut();
    ok(unsafe {
        ctorch_tensor::tensor::ct_tensor_from_blob(
            bytes.as_ptr(),
            bytes.len(),
            shape.as_ptr(),
            shape.len(),
            LONG,
            &mut t,
        )
    });
    t
}

pub fn shape(t: TensorHandle) -> Vec<i64> {
    let mut buf = [0i64; 8];
    let mut n = 0usize;
    ok(unsafe { ctorch_tensor::tensor::ct_tensor_shape(t, buf.as_mut_ptr(), buf.len(), &mut n) });
    buf[..n].to_vec()
}

/// Contiguous copy of a `float32` tensor's elements.
pub fn f32_values(t: TensorHandle) -> Vec<f32> {
    let mut numel = 0i64;
    ok(unsafe { ctorch_tensor::tensor::ct_tensor_numel(t, &mut numel) });
    let mut bytes = vec![0u8; numel as usize * 4];
    let mut n = 0usize;
    ok(unsafe {
        ctorch_tensor::tensor::ct_tensor_copy_data(t, bytes.as_mut_ptr(), bytes.len(), &mut n)
    });
    bytes[..n]
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn i64_values(t: TensorHandle) -> Vec<i64> {
    let mut numel = 0i64;
    ok(unsafe { ctorch_tensor::tensor::ct_tensor_numel(t, &mut numel) });
    let mut bytes = vec![0u8; numel as usize * 8];
    let mut n = 0usize;
    ok(unsafe {
        ctorch_tensor::tensor::ct_tensor_copy_data(t, bytes.as_mut_ptr(), bytes.len(), &mut n)
    });
    bytes[..n]
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn close(t: TensorHandle) {
    ok(unsafe { ctorch_tensor::handle::ct_tensor_close(t) });
}
