//! The operation table. Each entry performs one engine call and writes a
//! fresh handle, a primitive, or mutates its first argument in place.
//!
//! Views (`view`, `transpose`, `squeeze`, `narrow`, `expand_as`, `split`, …)
//! share storage with their source but are separately owned handles.

use libc::c_char;

use crate::engine::{Reduction, Tensor};
use crate::error::{
    copy_out, cstr_to_str, ffi_guard, slice_in, write_out, BridgeError, Result, Status,
};
use crate::handle::{borrow, borrow_mut, into_raw, write_handle, TensorHandle};

macro_rules! unary_op {
    ($($name:ident($($arg:ident: $ty:ty),*) => $method:ident;)*) => {
        $(
            /// # Safety
            /// `t` must be live; `out` writable.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                t: TensorHandle,
                $($arg: $ty,)*
                out: *mut TensorHandle,
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let result = borrow(t)?.$method($($arg),*)?;
                    write_handle(out, result)
                })
            }
        )*
    };
}

macro_rules! binary_op {
    ($($name:ident($($arg:ident: $ty:ty),*) => $method:ident;)*) => {
        $(
            /// # Safety
            /// `a` and `b` must be live; `out` writable.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                a: TensorHandle,
                b: TensorHandle,
                $($arg: $ty,)*
                out: *mut TensorHandle,
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let result = borrow(a)?.$method(borrow(b)?, $($arg),*)?;
                    write_handle(out, result)
                })
            }
        )*
    };
}

macro_rules! inplace_op {
    ($($name:ident($($arg:ident: $ty:ty),*) => $method:ident;)*) => {
        $(
            /// Updates `a` in place. `b` may be the same handle as `a`.
            ///
            /// # Safety
            /// `a` and `b` must be live.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                a: TensorHandle,
                b: TensorHandle,
                $($arg: $ty),*
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let other = borrow(b)?.shallow_clone();
                    borrow_mut(a)?.$method(&other, $($arg),*)?;
                    Ok(())
                })
            }
        )*
    };
}

macro_rules! dims_op {
    ($($name:ident => $method:ident;)*) => {
        $(
            /// # Safety
            /// `t` must be live; `dims` must hold `n` values; `out` writable.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                t: TensorHandle,
                dims: *const i64,
                n: usize,
                out: *mut TensorHandle,
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let dims = slice_in(dims, n, "dims")?;
                    write_handle(out, borrow(t)?.$method(dims)?)
                })
            }
        )*
    };
}

binary_op! {
    ct_tensor_add(alpha: f64) => add;
    ct_tensor_sub(alpha: f64) => sub;
    ct_tensor_mul() => mul;
    ct_tensor_div() => div;
    ct_tensor_mm() => mm;
    ct_tensor_eq() => eq_tensor;
    ct_tensor_expand_as() => expand_as;
}

inplace_op! {
    ct_tensor_add_(alpha: f64) => add_;
    ct_tensor_sub_(alpha: f64) => sub_;
    ct_tensor_mul_() => mul_;
    ct_tensor_div_() => div_;
}

unary_op! {
    ct_tensor_relu() => relu;
    ct_tensor_tanh() => tanh;
    ct_tensor_sigmoid() => sigmoid;
    ct_tensor_sqrt() => sqrt;
    ct_tensor_leaky_relu(slope: f64) => leaky_relu;
    ct_tensor_log_softmax(dim: i64) => log_softmax;
    ct_tensor_add_scalar(value: f64) => add_scalar;
    ct_tensor_mul_scalar(value: f64) => mul_scalar;
    ct_tensor_sum() => sum;
    ct_tensor_mean() => mean;
    ct_tensor_sum_dim(dim: i64, keepdim: bool) => sum_dim;
    ct_tensor_squeeze() => squeeze;
    ct_tensor_squeeze_dim(dim: i64) => squeeze_dim;
    ct_tensor_unsqueeze(dim: i64) => unsqueeze;
    ct_tensor_transpose(dim0: i64, dim1: i64) => transpose;
    ct_tensor_flatten(start_dim: i64, end_dim: i64) => flatten;
    ct_tensor_narrow(dim: i64, start: i64, length: i64) => narrow;
}

macro_rules! loss_op {
    ($($(#[$doc:meta])* $name:ident => $method:ident;)*) => {
        $(
            $(#[$doc])*
            ///
            /// `reduction` is one of `none`, `mean` or `sum`.
            ///
            /// # Safety
            /// Handles must be live; `reduction` NUL-terminated; `out` writable.
            #[no_mangle]
            pub unsafe extern "C" fn $name(
                input: TensorHandle,
                target: TensorHandle,
                reduction: *const c_char,
                out: *mut TensorHandle,
            ) -> Status {
                ffi_guard(stringify!($name), || {
                    let reduction: Reduction = cstr_to_str(reduction, "reduction")?.parse()?;
                    let result = borrow(input)?.$method(borrow(target)?, reduction)?;
                    write_handle(out, result)
                })
            }
        )*
    };
}

dims_op! {
    ct_tensor_view => view;
    ct_tensor_reshape => reshape;
    ct_tensor_permute => permute;
}

loss_op! {
    /// Mean squared error between same-shaped tensors.
    ct_tensor_mse_loss => mse_loss;
    /// Negative log likelihood over log-probabilities `[N, C]` and class
    /// indices `[N]`. Targets equal to -100 are ignored.
    ct_tensor_nll_loss => nll_loss;
    /// `log_softmax` over the class dimension of logits `[N, C]`, then
    /// `nll_loss` against class indices `[N]`.
    ct_tensor_cross_entropy => cross_entropy;
    /// Binary cross entropy between probabilities and same-shaped targets.
    ct_tensor_binary_cross_entropy => binary_cross_entropy;
}

unsafe fn arg_reduce(
    t: TensorHandle,
    has_dim: bool,
    dim: i64,
    keepdim: bool,
    out: *mut TensorHandle,
    min: bool,
) -> Result<()> {
    let t = borrow(t)?;
    let dim = has_dim.then_some(dim);
    let result = if min { t.argmin(dim, keepdim)? } else { t.argmax(dim, keepdim)? };
    write_handle(out, result)
}

/// Index of the largest element, over `dim` when `has_dim` is set, otherwise
/// over the flattened tensor.
///
/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_argmax(
    t: TensorHandle,
    has_dim: bool,
    dim: i64,
    keepdim: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_argmax", || arg_reduce(t, has_dim, dim, keepdim, out, false))
}

/// # Safety
/// `t` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_argmin(
    t: TensorHandle,
    has_dim: bool,
    dim: i64,
    keepdim: bool,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_argmin", || arg_reduce(t, has_dim, dim, keepdim, out, true))
}

/// # Safety
/// `tensors` must hold `n` live handles; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_stack(
    tensors: *const TensorHandle,
    n: usize,
    dim: i64,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_stack", || {
        let inputs = slice_in(tensors, n, "tensors")?
            .iter()
            .map(|&h| borrow(h))
            .collect::<Result<Vec<&Tensor>>>()?;
        write_handle(out, Tensor::stack(&inputs, dim)?)
    })
}

/// Splits into chunks of `split_size` along `dim`. Each chunk is written to
/// `buf` as its own handle; nothing is allocated when `cap` is too small.
///
/// # Safety
/// `t` must be live; `buf` must have room for `cap` handles.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_split(
    t: TensorHandle,
    split_size: i64,
    dim: i64,
    buf: *mut TensorHandle,
    cap: usize,
    out_len: *mut usize,
) -> Status {
    ffi_guard("ct_tensor_split", || {
        if out_len.is_null() {
            return Err(BridgeError::NullPointer("out_len"));
        }
        let parts = borrow(t)?.split(split_size, dim)?;
        if parts.len() > cap {
            return Err(BridgeError::BufferTooSmall {
                what: "tensors",
                needed: parts.len(),
                capacity: cap,
            });
        }
        if !parts.is_empty() && buf.is_null() {
            return Err(BridgeError::NullPointer("tensors"));
        }
        let handles: Vec<TensorHandle> = parts.into_iter().map(into_raw).collect();
        copy_out(&handles, buf, cap, out_len, "tensors")
    })
}

/// The `k` largest (or, with `largest` unset, smallest) entries along `dim`
/// and their `int64` indices, written to two separate handles.
///
/// # Safety
/// `t` must be live; `values` and `indices` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_topk(
    t: TensorHandle,
    k: i64,
    dim: i64,
    largest: bool,
    sorted: bool,
    values: *mut TensorHandle,
    indices: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_topk", || {
        if values.is_null() {
            return Err(BridgeError::NullPointer("values"));
        }
        if indices.is_null() {
            return Err(BridgeError::NullPointer("indices"));
        }
        let (top, picked) = borrow(t)?.topk(k, dim, largest, sorted)?;
        write_handle(values, top)?;
        write_handle(indices, picked)
    })
}

/// Picks the slices of `dim` listed in the 1-D integer tensor `index`.
///
/// # Safety
/// `t` and `index` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_index_select(
    t: TensorHandle,
    dim: i64,
    index: TensorHandle,
    out: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_tensor_index_select", || {
        let result = borrow(t)?.index_select(dim, borrow(index)?)?;
        write_handle(out, result)
    })
}

/// # Safety
/// `a` and `b` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_equal(
    a: TensorHandle,
    b: TensorHandle,
    out: *mut bool,
) -> Status {
    ffi_guard("ct_tensor_equal", || {
        let equal = borrow(a)?.equal(borrow(b)?)?;
        write_out(out, equal, "out")
    })
}

/// # Safety
/// `a` and `b` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_tensor_allclose(
    a: TensorHandle,
    b: TensorHandle,
    rtol: f64,
    atol: f64,
    equal_nan: bool,
    out: *mut bool,
) -> Status {
    ffi_guard("ct_tensor_allclose", || {
        let close = borrow(a)?.allclose(borrow(b)?, rtol, atol, equal_nan)?;
        write_out(out, close, "out")
    })
}
