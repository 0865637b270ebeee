mod common;

use std::ffi::CStr;
use std::ptr;

use common::{err, ok};
use ctorch_tensor::backend::{ct_backend_info, ct_backend_name};
use ctorch_tensor::device::{ct_cuda_is_available, ct_cudnn_is_available, ct_set_num_threads};
use ctorch_tensor::{ct_free_string, OWNERSHIP};

fn owned(produce: unsafe extern "C" fn(*mut *mut libc::c_char) -> ctorch_tensor::Status) -> String {
    let mut s = ptr::null_mut();
    ok(unsafe { produce(&mut s) });
    let text = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
    unsafe { ct_free_string(s) };
    text
}

#[test]
fn backend_reports_engine_as_json() {
    let name = owned(ct_backend_name);
    let info: serde_json::Value = serde_json::from_str(&owned(ct_backend_info)).unwrap();
    assert_eq!(info["engine"], name.as_str());
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(info["audit"], cfg!(feature = "audit"));

    let mut cuda = true;
    ok(unsafe { ct_cuda_is_available(&mut cuda) });
    assert_eq!(info["cuda_available"], cuda);
    let mut cudnn = true;
    ok(unsafe { ct_cudnn_is_available(&mut cudnn) });
    assert_eq!(info["cudnn_available"], cudnn);
    if !cfg!(feature = "torch") {
        assert!(!cuda && !cudnn);
    }
}

#[test]
fn string_producers_are_paired_with_ct_free_string() {
    for producer in ["ct_tensor_string", "ct_backend_name", "ct_backend_info"] {
        let release = OWNERSHIP
            .iter()
            .find(|(p, _)| *p == producer)
            .map(|(_, r)| *r);
        assert_eq!(release, Some("ct_free_string"), "{producer}");
    }
    assert!(OWNERSHIP.iter().any(|(p, _)| *p == "ct_loader_begin"));
    let module = OWNERSHIP.iter().find(|(p, _)| *p == "ct_module_load");
    assert_eq!(module.map(|(_, r)| *r), Some("ct_module_close"));
}

#[test]
fn thread_count_must_be_positive() {
    err(ct_set_num_threads(0));
    ok(ct_set_num_threads(2));
}

#[test]
fn null_out_pointers_do_not_leak_strings() {
    let msg = err(unsafe { ct_backend_name(ptr::null_mut()) });
    assert_eq!(msg, "null pointer passed for out");
}
