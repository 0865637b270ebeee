//! Opaque handles: boxed native values whose address crosses the boundary.
//!
//! Every producer pairs with exactly one release function, listed in
//! [`OWNERSHIP`]. Live counts per kind are always tracked; the `audit`
//! feature additionally records every live address so that double frees
//! and foreign pointers are reported instead of being undefined behaviour.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

#[cfg(feature = "audit")]
use std::collections::HashMap;
#[cfg(feature = "audit")]
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "audit")]
use once_cell::sync::Lazy;

use crate::error::{ffi_guard, write_out, BridgeError, Result, Status};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HandleKind {
    Tensor = 0,
    Device = 1,
    Optimizer = 2,
    Dataset = 3,
    Loader = 4,
    Iterator = 5,
    ByteBuffer = 6,
    Module = 7,
    Value = 8,
}

impl HandleKind {
    pub const ALL: [HandleKind; 9] = [
        HandleKind::Tensor,
        HandleKind::Device,
        HandleKind::Optimizer,
        HandleKind::Dataset,
        HandleKind::Loader,
        HandleKind::Iterator,
        HandleKind::ByteBuffer,
        HandleKind::Module,
        HandleKind::Value,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(code).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Tensor => "tensor",
            HandleKind::Device => "device",
            HandleKind::Optimizer => "optimizer",
            HandleKind::Dataset => "dataset",
            HandleKind::Loader => "loader",
            HandleKind::Iterator => "iterator",
            HandleKind::ByteBuffer => "byte buffer",
            HandleKind::Module => "module",
            HandleKind::Value => "ivalue",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A native type that may cross the boundary as a handle.
pub trait Native: Sized + 'static {
    const KIND: HandleKind;
}

static LIVE: [AtomicI64; 9] = [
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
    AtomicI64::new(0),
];

#[cfg(feature = "audit")]
static LEDGER: Lazy<Mutex<HashMap<usize, HandleKind>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn live_count(kind: HandleKind) -> i64 {
    LIVE[kind as usize].load(Ordering::SeqCst)
}

pub(crate) fn into_raw<T: Native>(value: T) -> *mut T {
    let ptr = Box::into_raw(Box::new(value));
    LIVE[T::KIND as usize].fetch_add(1, Ordering::SeqCst);
    #[cfg(feature = "audit")]
    LEDGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(ptr as usize, T::KIND);
    tracing::trace!(kind = %T::KIND, addr = ?ptr, "handle created");
    ptr
}

#[cfg(feature = "audit")]
fn audit_live<T: Native>(ptr: *mut T) -> Result<()> {
    let ledger = LEDGER.lock().unwrap_or_else(PoisonError::into_inner);
    match ledger.get(&(ptr as usize)) {
        Some(kind) if *kind == T::KIND => Ok(()),
        _ => Err(BridgeError::StaleHandle {
            kind: T::KIND,
            addr: ptr as usize,
        }),
    }
}

pub(crate) unsafe fn borrow<'a, T: Native>(ptr: *mut T) -> Result<&'a T> {
    if ptr.is_null() {
        return Err(BridgeError::NullHandle(T::KIND));
    }
    #[cfg(feature = "audit")]
    audit_live(ptr)?;
    Ok(&*ptr)
}

pub(crate) unsafe fn borrow_mut<'a, T: Native>(ptr: *mut T) -> Result<&'a mut T> {
    if ptr.is_null() {
        return Err(BridgeError::NullHandle(T::KIND));
    }
    #[cfg(feature = "audit")]
    audit_live(ptr)?;
    Ok(&mut *ptr)
}

pub(crate) unsafe fn release<T: Native>(ptr: *mut T) -> Result<()> {
    if ptr.is_null() {
        return Err(BridgeError::NullHandle(T::KIND));
    }
    #[cfg(feature = "audit")]
    {
        let mut ledger = LEDGER.lock().unwrap_or_else(PoisonError::into_inner);
        match ledger.get(&(ptr as usize)) {
            Some(kind) if *kind == T::KIND => {
                ledger.remove(&(ptr as usize));
            }
            _ => {
                return Err(BridgeError::StaleHandle {
                    kind: T::KIND,
                    addr: ptr as usize,
                })
            }
        }
    }
    drop(Box::from_raw(ptr));
    LIVE[T::KIND as usize].fetch_sub(1, Ordering::SeqCst);
    tracing::trace!(kind = %T::KIND, addr = ?ptr, "handle released");
    Ok(())
}

/// Boxes `value` into `out`. The null check comes first so nothing leaks.
pub(crate) unsafe fn write_handle<T: Native>(out: *mut *mut T, value: T) -> Result<()> {
    if out.is_null() {
        return Err(BridgeError::NullPointer("out"));
    }
    out.write(into_raw(value));
    Ok(())
}

macro_rules! define_handles {
    ($($kind:ident => $ty:ty, $alias:ident, $close:ident;)*) => {
        $(
            impl Native for $ty {
                const KIND: HandleKind = HandleKind::$kind;
            }

            pub type $alias = *mut $ty;

            #[doc = concat!("Releases a ", stringify!($alias), ".")]
            ///
            /// # Safety
            /// `handle` must come from this library and must not be used afterwards.
            #[no_mangle]
            pub unsafe extern "C" fn $close(handle: $alias) -> Status {
                ffi_guard(stringify!($close), || release(handle))
            }
        )*
    };
}

define_handles! {
    Tensor => crate::engine::Tensor, TensorHandle, ct_tensor_close;
    Device => crate::engine::Device, DeviceHandle, ct_device_close;
    Optimizer => crate::optim::Optimizer, OptimizerHandle, ct_optimizer_close;
    Dataset => ctorch_data::Dataset, DatasetHandle, ct_dataset_close;
    Loader => crate::data::Loader, LoaderHandle, ct_loader_close;
    Iterator => crate::data::BatchIterator, IteratorHandle, ct_iterator_close;
    ByteBuffer => crate::pickle::ByteBuffer, ByteBufferHandle, ct_byte_buffer_free;
    Module => crate::engine::Module, ModuleHandle, ct_module_close;
    Value => crate::engine::Value, ValueHandle, ct_ivalue_close;
}

/// Producer → release pairs for everything callers must free.
pub const OWNERSHIP: &[(&str, &str)] = &[
    // Strings
    ("<any failing call: Status>", "ct_free_string"),
    ("ct_tensor_string", "ct_free_string"),
    ("ct_backend_name", "ct_free_string"),
    ("ct_backend_info", "ct_free_string"),
    // Tensors
    ("ct_tensor_zeros", "ct_tensor_close"),
    ("ct_tensor_ones", "ct_tensor_close"),
    ("ct_tensor_empty", "ct_tensor_close"),
    ("ct_tensor_full", "ct_tensor_close"),
    ("ct_tensor_randn", "ct_tensor_close"),
    ("ct_tensor_rand", "ct_tensor_close"),
    ("ct_tensor_eye", "ct_tensor_close"),
    ("ct_tensor_arange", "ct_tensor_close"),
    ("ct_tensor_linspace", "ct_tensor_close"),
    ("ct_tensor_logspace", "ct_tensor_close"),
    ("ct_tensor_from_blob", "ct_tensor_close"),
    ("ct_tensor_to", "ct_tensor_close"),
    ("ct_tensor_cast", "ct_tensor_close"),
    ("ct_tensor_copy_to", "ct_tensor_close"),
    ("ct_tensor_pin_memory", "ct_tensor_close"),
    ("ct_tensor_detach", "ct_tensor_close"),
    ("ct_tensor_clone", "ct_tensor_close"),
    ("ct_tensor_index", "ct_tensor_close"),
    ("ct_tensor_select", "ct_tensor_close"),
    ("ct_tensor_grad", "ct_tensor_close"),
    ("ct_tensor_load", "ct_tensor_close"),
    ("ct_tensor_decode", "ct_tensor_close"),
    ("ct_tensor_<op> (dispatch table)", "ct_tensor_close"),
    ("ct_tensor_split (each element)", "ct_tensor_close"),
    ("ct_tensor_topk (values and indices)", "ct_tensor_close"),
    ("ct_ivalue_to_tensor", "ct_tensor_close"),
    ("ct_iterator_batch (data and target)", "ct_tensor_close"),
    // Everything else
    ("ct_device", "ct_device_close"),
    ("ct_optimizer_sgd", "ct_optimizer_close"),
    ("ct_optimizer_adam", "ct_optimizer_close"),
    ("ct_mnist_dataset", "ct_dataset_close"),
    ("ct_loader", "ct_loader_close"),
    ("ct_loader_begin", "ct_iterator_close"),
    ("ct_tensor_encode", "ct_byte_buffer_free"),
    ("ct_module_load", "ct_module_close"),
    ("ct_module_forward", "ct_ivalue_close"),
    ("ct_ivalue_to_tuple (each element)", "ct_ivalue_close"),
];

/// Reports how many handles of `kind` (a [`HandleKind`] code) are live.
///
/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_live_handles(kind: i32, out: *mut i64) -> Status {
    ffi_guard("ct_live_handles", || {
        let kind = HandleKind::from_code(kind)
            .ok_or_else(|| BridgeError::Invalid(format!("unknown handle kind {kind}")))?;
        write_out(out, live_count(kind), "out")
    })
}
