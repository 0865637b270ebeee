//! Tensor construction, queries, conversion and autograd entry points.
//!
//! Constructors take a device handle, a dtype code (LibTorch `ScalarType`
//! numbering) and a `requires_grad` flag, and write a fresh tensor handle.

use std::fmt::Write;

use libc::c_char;

use crate::engine::{DType, Device, Tensor};
use crate::error::{
    copy_out, ffi_guard, owned_string, slice_in, write_out, BridgeError, Result, Status,
};
use crate::handle::{borrow, borrow_mut, write_handle, DeviceHandle, TensorHandle};

unsafe fn construct<F>(
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
    make: F,
) -> Result<()>
where
    F: FnOnce(DType, Device) -> crate::engine::Result<Tensor>,
{
    let dtype = DType::from_code(dtype)?;
    let device = *borrow(device)?;
    let mut tensor = make(dtype, device)?;
    if requires_grad {
        tensor.set_requires_grad(true)?;
    }
    write_handle(out, tensor)
}

macro_rules! shape_ctor {
    ($($name:ident => $ctor:path;)*) => {
        $(
            /// # Safety
            /// `shape` must hold `ndim` values; `device` must be live; `out` writable.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                shape: *const i64,
                ndim: usize,
                dtype: i32,
                device: DeviceHandle,
                requires_grad: bool,
                out: *mut TensorHandle,
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let shape = slice_in(shape, ndim, "shape")?;
                    construct(dtype, device, requires_grad, out, |dtype, device| {
                        $ctor(shape, dtype, device)
                    })
                })
            }
        )*
    };
}

shape_ctor! {
    ct_tensor_zeros => Tensor::zeros;
    ct_tensor_ones => Tensor::ones;
    ct_tensor_empty => Tensor::empty;
    ct_tensor_randn => Tensor::randn;
    ct_tensor_rand => Tensor::rand;
}

/// # Safety
/// `shape` must hold `ndim` values; `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_full(
    shape: *const i64,
    ndim: usize,
    value: f64,
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_full", || {
        let shape = slice_in(shape, ndim, "shape")?;
        construct(dtype, device, requires_grad, out, |dtype, device| {
            Tensor::full(shape, value, dtype, device)
        })
    })
}

/// # Safety
/// `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_eye(
    n: i64,
    m: i64,
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_eye", || {
        construct(dtype, device, requires_grad, out, |dtype, device| {
            Tensor::eye(n, m, dtype, device)
        })
    })
}

/// # Safety
/// `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_arange(
    start: f64,
    end: f64,
    step: f64,
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_arange", || {
        construct(dtype, device, requires_grad, out, |dtype, device| {
            Tensor::arange(start, end, step, dtype, device)
        })
    })
}

/// # Safety
/// `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_linspace(
    start: f64,
    end: f64,
    steps: i64,
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_linspace", || {
        construct(dtype, device, requires_grad, out, |dtype, device| {
            Tensor::linspace(start, end, steps, dtype, device)
        })
    })
}

/// # Safety
/// `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_logspace(
    start: f64,
    end: f64,
    steps: i64,
    base: f64,
    dtype: i32,
    device: DeviceHandle,
    requires_grad: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_logspace", || {
        construct(dtype, device, requires_grad, out, |dtype, device| {
            Tensor::logspace(start, end, steps, base, dtype, device)
        })
    })
}

/// Copies `nbytes` of host memory holding `dtype` elements into a new CPU
/// tensor. The caller keeps ownership of `data`.
///
/// # Safety
/// `data` must hold `nbytes` readable bytes and `shape` must hold `ndim` values.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_from_blob(
    data: *const u8,
    nbytes: usize,
    shape: *const i64,
    ndim: usize,
    dtype: i32,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_from_blob", || {
        let bytes = slice_in(data, nbytes, "data")?;
        let shape = slice_in(shape, ndim, "shape")?;
        let tensor = Tensor::from_data(bytes, shape, DType::from_code(dtype)?)?;
        write_handle(out, tensor)
    })
}

// Queries

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_dim(t: TensorHandle, out: *mut i64) -> Status {
    ffi_guard("ct_tensor_dim", || write_out(out, borrow(t)?.dim() as i64, "out"))
}

/// Writes the sizes into `buf` (capacity `cap`) and their count into `out_len`.
///
/// # Safety
/// `t` must be live; `buf` must have room for `cap` values.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_shape(
    t: TensorHandle,
    buf: *mut i64,
    cap: usize,
    out_len: *mut usize,
) -> Status {
    ffi_guard("ct_tensor_shape", || {
        copy_out(&borrow(t)?.size(), buf, cap, out_len, "shape")
    })
}

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_dtype(t: TensorHandle, out: *mut i32) -> Status {
    ffi_guard("ct_tensor_dtype", || write_out(out, borrow(t)?.dtype().code(), "out"))
}

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_numel(t: TensorHandle, out: *mut i64) -> Status {
    ffi_guard("ct_tensor_numel", || write_out(out, borrow(t)?.numel() as i64, "out"))
}

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_item_f64(t: TensorHandle, out: *mut f64) -> Status {
    ffi_guard("ct_tensor_item_f64", || write_out(out, borrow(t)?.item_f64()?, "out"))
}

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_item_i64(t: TensorHandle, out: *mut i64) -> Status {
    ffi_guard("ct_tensor_item_i64", || write_out(out, borrow(t)?.item_i64()?, "out"))
}

fn render(t: &Tensor) -> Result<String> {
    let mut text = String::new();
    write!(text, "{t}")
        .map_err(|_| BridgeError::Invalid("tensor could not be rendered".to_string()))?;
    Ok(text)
}

/// Renders the tensor; release the string with `ct_free_string`.
///
/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_string(t: TensorHandle, out: *mut *mut c_char) -> Status {
    ffi_guard("ct_tensor_string", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        write_out(out, owned_string(render(borrow(t)?)?)?, "out")
    })
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_print(t: TensorHandle) -> Status {
    ffi_guard("ct_tensor_print", || {
        println!("{}", render(borrow(t)?)?);
        Ok(())
    })
}

/// Copies the elements, contiguous and native-endian, into a caller buffer.
///
/// # Safety
/// `t` must be live; `buf` must have room for `cap` bytes.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_copy_data(
    t: TensorHandle,
    buf: *mut u8,
    cap: usize,
    out_len: *mut usize,
) -> Status {
    ffi_guard("ct_tensor_copy_data", || {
        let bytes = borrow(t)?.to_bytes()?;
        copy_out(&bytes, buf, cap, out_len, "data")
    })
}

// Conversion

/// # Safety
/// `t` and `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_to(
    t: TensorHandle,
    device: DeviceHandle,
    dtype: i32,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_to", || {
        let device = *borrow(device)?;
        let moved = borrow(t)?.to(device, DType::from_code(dtype)?)?;
        write_handle(out, moved)
    })
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_cast(
    t: TensorHandle,
    dtype: i32,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_cast", || {
        let cast = borrow(t)?.cast(DType::from_code(dtype)?)?;
        write_handle(out, cast)
    })
}

/// # Safety
/// `t` and `device` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_copy_to(
    t: TensorHandle,
    device: DeviceHandle,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_copy_to", || {
        let device = *borrow(device)?;
        write_handle(out, borrow(t)?.copy_to(device)?)
    })
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_pin_memory(t: TensorHandle, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_tensor_pin_memory", || write_handle(out, borrow(t)?.pin_memory()?))
}

/// Aliases `t`'s storage without autograd history. Close the result on its own.
///
/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_detach(t: TensorHandle, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_tensor_detach", || write_handle(out, borrow(t)?.detach()?))
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_clone(t: TensorHandle, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_tensor_clone", || write_handle(out, borrow(t)?.deep_clone()?))
}

/// Rebinds `t` to `src`'s storage; both handles stay separately owned.
///
/// # Safety
/// Both handles must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_set_data(t: TensorHandle, src: TensorHandle) -> Status {
    ffi_guard("ct_tensor_set_data", || {
        let src = borrow(src)?.shallow_clone();
        borrow_mut(t)?.set_data(&src)?;
        Ok(())
    })
}

/// Selects along leading dimensions, one index per dimension. The result aliases `t`.
///
/// # Safety
/// `t` must be live; `indices` must hold `n` values; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_index(
    t: TensorHandle,
    indices: *const i64,
    n: usize,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_index", || {
        let indices = slice_in(indices, n, "indices")?;
        write_handle(out, borrow(t)?.index(indices)?)
    })
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_select(
    t: TensorHandle,
    dim: i64,
    index: i64,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_select", || write_handle(out, borrow(t)?.select(dim, index)?))
}

// Autograd

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_set_requires_grad(
    t: TensorHandle,
    requires_grad: bool,
) -> Status {
    ffi_guard("ct_tensor_set_requires_grad", || {
        borrow_mut(t)?.set_requires_grad(requires_grad)?;
        Ok(())
    })
}

/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_requires_grad(t: TensorHandle, out: *mut bool) -> Status {
    ffi_guard("ct_tensor_requires_grad", || {
        write_out(out, borrow(t)?.requires_grad(), "out")
    })
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_backward(t: TensorHandle) -> Status {
    ffi_guard("ct_tensor_backward", || Ok(borrow(t)?.backward()?))
}

/// Writes the gradient, or null when none has been accumulated.
///
/// # Safety
/// `t` must be live and `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_grad(t: TensorHandle, out: *mut TensorHandle) -> Status {
    ffi_guard("ct_tensor_grad", || match borrow(t)?.grad() {
        Some(grad) => write_handle(out, grad),
        None => write_out(out, std::ptr::null_mut(), "out"),
    })
}
