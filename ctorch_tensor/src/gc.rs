//! Cooperative flag the host raises around its own garbage collection so that
//! finalizers can tell a collector-driven close from an explicit one.
//!
//! One process-wide flag; the last write wins. It is not a counter, so two
//! `ct_prepare_gc` calls are undone by a single `ct_finish_gc`.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ffi_guard, write_out, Status};

static GC_PREPARED: AtomicBool = AtomicBool::new(false);

pub fn is_prepared() -> bool {
    GC_PREPARED.load(Ordering::SeqCst)
}

fn set_prepared(prepared: bool) {
    let was = GC_PREPARED.swap(prepared, Ordering::SeqCst);
    tracing::debug!(was, now = prepared, "gc flag");
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_gc_prepared(out: *mut bool) -> Status {
    ffi_guard("ct_gc_prepared", || write_out(out, is_prepared(), "out"))
}

#[no_mangle]
pub extern "C" fn ct_prepare_gc() -> Status {
    ffi_guard("ct_prepare_gc", || {
        set_prepared(true);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn ct_finish_gc() -> Status {
    ffi_guard("ct_finish_gc", || {
        set_prepared(false);
        Ok(())
    })
}
