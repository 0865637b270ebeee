mod common;

use std::ptr;

use common::{
    close, cpu, cstr, err, f32_tensor, f32_values, i64_tensor, i64_values, ok, shape, take, FLOAT,
};
use ctorch_tensor::handle::ct_device_close;
use ctorch_tensor::{init, ops, tensor};

#[test]
fn add_two_vectors() {
    let a = f32_tensor(&[1.0, 2.0, 3.0, 4.0], &[4]);
    let b = f32_tensor(&[10.0, 20.0, 30.0, 40.0], &[4]);
    let mut sum = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_add(a, b, 1.0, &mut sum) });
    assert_eq!(f32_values(sum), vec![11.0, 22.0, 33.0, 44.0]);

    let mut diff = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_sub(b, a, 2.0, &mut diff) });
    assert_eq!(f32_values(diff), vec![8.0, 16.0, 24.0, 32.0]);

    for t in [a, b, sum, diff] {
        close(t);
    }
}

#[test]
fn in_place_ops_accept_the_same_handle_twice() {
    let a = f32_tensor(&[1.0, 2.0], &[2]);
    ok(unsafe { ops::ct_tensor_add_(a, a, 1.0) });
    assert_eq!(f32_values(a), vec![2.0, 4.0]);
    ok(unsafe { ops::ct_tensor_mul_(a, a) });
    assert_eq!(f32_values(a), vec![4.0, 16.0]);
    close(a);
}

#[test]
fn negative_dimension_is_reported() {
    let dev = cpu();
    let dims = [2i64, -3];
    let mut t = ptr::null_mut();
    let msg = err(unsafe { tensor::ct_tensor_zeros(dims.as_ptr(), 2, FLOAT, dev, false, &mut t) });
    assert!(msg.to_lowercase().contains("negative dimension"), "{msg}");
    assert!(t.is_null());

    let msg = err(unsafe { tensor::ct_tensor_zeros(dims.as_ptr(), 2, 99, dev, false, &mut t) });
    assert!(msg.contains("99"), "{msg}");
    ok(unsafe { ct_device_close(dev) });
}

#[test]
fn oversized_tensors_are_reported_not_fatal() {
    let dev = cpu();
    let mut t = ptr::null_mut();
    let huge = [1i64 << 40];
    err(unsafe { tensor::ct_tensor_zeros(huge.as_ptr(), 1, FLOAT, dev, false, &mut t) });
    assert!(t.is_null());

    err(unsafe { tensor::ct_tensor_arange(0.0, 1e13, 1.0, FLOAT, dev, false, &mut t) });
    assert!(t.is_null());

    let overflowing = [1i64 << 40, 1i64 << 40];
    err(unsafe { tensor::ct_tensor_ones(overflowing.as_ptr(), 2, FLOAT, dev, false, &mut t) });
    assert!(t.is_null());

    // The bridge keeps working afterwards.
    let small = [2i64];
    ok(unsafe { tensor::ct_tensor_zeros(small.as_ptr(), 1, FLOAT, dev, false, &mut t) });
    assert_eq!(f32_values(t), vec![0.0, 0.0]);
    close(t);
    ok(unsafe { ct_device_close(dev) });
}

#[test]
fn null_handles_are_errors() {
    let mut out = ptr::null_mut();
    let msg = err(unsafe { ops::ct_tensor_relu(ptr::null_mut(), &mut out) });
    assert_eq!(msg, "null tensor handle");
    let a = f32_tensor(&[1.0], &[1]);
    let msg = err(unsafe { ops::ct_tensor_relu(a, ptr::null_mut()) });
    assert_eq!(msg, "null pointer passed for out");
    close(a);
}

#[test]
fn views_report_shapes() {
    let t = f32_tensor(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[2, 3]);
    let mut tr = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_transpose(t, 0, 1, &mut tr) });
    assert_eq!(shape(tr), vec![3, 2]);
    assert_eq!(f32_values(tr), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

    let dims = [3i64, -1];
    let mut reshaped = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_reshape(t, dims.as_ptr(), dims.len(), &mut reshaped) });
    assert_eq!(shape(reshaped), vec![3, 2]);

    let mut unsq = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_unsqueeze(t, 0, &mut unsq) });
    assert_eq!(shape(unsq), vec![1, 2, 3]);

    let mut bad = ptr::null_mut();
    assert!(take(unsafe { ops::ct_tensor_transpose(t, 0, 5, &mut bad) }).is_some());

    for h in [t, tr, reshaped, unsq] {
        close(h);
    }
}

#[test]
fn split_and_stack() {
    let t = f32_tensor(&[0.0, 1.0, 2.0, 3.0, 4.0], &[5]);
    let mut parts = [ptr::null_mut(); 3];
    let mut n = 0usize;
    let msg = err(unsafe { ops::ct_tensor_split(t, 2, 0, parts.as_mut_ptr(), 2, &mut n) });
    assert!(msg.contains("buffer too small"), "{msg}");
    assert!(parts.iter().all(|p| p.is_null()));

    ok(unsafe { ops::ct_tensor_split(t, 2, 0, parts.as_mut_ptr(), parts.len(), &mut n) });
    assert_eq!(n, 3);
    assert_eq!(f32_values(parts[2]), vec![4.0]);

    let pair = [parts[0], parts[1]];
    let mut stacked = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_stack(pair.as_ptr(), pair.len(), 0, &mut stacked) });
    assert_eq!(shape(stacked), vec![2, 2]);
    assert_eq!(f32_values(stacked), vec![0.0, 1.0, 2.0, 3.0]);

    for h in parts.into_iter().chain([t, stacked]) {
        close(h);
    }
}

#[test]
fn predicates_and_reductions() {
    let a = f32_tensor(&[1.0, 5.0, 3.0, 2.0], &[2, 2]);
    let b = f32_tensor(&[1.0, 5.0, 3.0, 2.000001], &[2, 2]);
    let mut same = true;
    ok(unsafe { ops::ct_tensor_equal(a, b, &mut same) });
    assert!(!same);
    ok(unsafe { ops::ct_tensor_allclose(a, b, 1e-5, 1e-8, false, &mut same) });
    assert!(same);

    let mut idx = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_argmax(a, true, 1, false, &mut idx) });
    assert_eq!(i64_values(idx), vec![1, 0]);
    let mut flat = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_argmin(a, false, 0, false, &mut flat) });
    assert_eq!(i64_values(flat), vec![0]);

    let mut total = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_sum(a, &mut total) });
    let mut value = 0.0;
    ok(unsafe { tensor::ct_tensor_item_f64(total, &mut value) });
    assert_eq!(value, 11.0);

    for h in [a, b, idx, flat, total] {
        close(h);
    }
}

#[test]
fn topk_writes_values_and_indices() {
    let t = f32_tensor(&[1.0, 5.0, 3.0, 7.0, 2.0, 0.0], &[2, 3]);
    let (mut values, mut indices) = (ptr::null_mut(), ptr::null_mut());
    ok(unsafe { ops::ct_tensor_topk(t, 2, -1, true, true, &mut values, &mut indices) });
    assert_eq!(shape(values), vec![2, 2]);
    assert_eq!(f32_values(values), vec![5.0, 3.0, 7.0, 2.0]);
    assert_eq!(i64_values(indices), vec![1, 2, 0, 1]);

    let mut lone = ptr::null_mut();
    let msg = err(unsafe { ops::ct_tensor_topk(t, 1, 0, true, true, &mut lone, ptr::null_mut()) });
    assert_eq!(msg, "null pointer passed for indices");
    assert!(lone.is_null());
    err(unsafe { ops::ct_tensor_topk(t, 4, 1, true, true, &mut lone, &mut indices) });

    for h in [t, values, indices] {
        close(h);
    }
}

#[test]
fn index_select_gathers_columns() {
    let t = f32_tensor(&[1.0, 5.0, 3.0, 7.0, 2.0, 0.0], &[2, 3]);
    let index = i64_tensor(&[2, 0], &[2]);
    let mut picked = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_index_select(t, 1, index, &mut picked) });
    assert_eq!(shape(picked), vec![2, 2]);
    assert_eq!(f32_values(picked), vec![3.0, 1.0, 0.0, 7.0]);

    let outside = i64_tensor(&[3], &[1]);
    let mut bad = ptr::null_mut();
    err(unsafe { ops::ct_tensor_index_select(t, 1, outside, &mut bad) });
    assert!(bad.is_null());

    for h in [t, index, picked, outside] {
        close(h);
    }
}

#[test]
fn classification_losses() {
    let logits = f32_tensor(&[0.0, 0.0, 0.0, 0.0], &[2, 2]);
    let classes = i64_tensor(&[0, 1], &[2]);
    let mut ce = ptr::null_mut();
    let mean = cstr("mean");
    ok(unsafe { ops::ct_tensor_cross_entropy(logits, classes, mean.as_ptr(), &mut ce) });
    let mut value = 0.0;
    ok(unsafe { tensor::ct_tensor_item_f64(ce, &mut value) });
    assert!((value - 2f64.ln()).abs() < 1e-6, "{value}");

    let probs = f32_tensor(&[0.5, 0.5], &[2]);
    let labels = f32_tensor(&[1.0, 0.0], &[2]);
    let mut bce = ptr::null_mut();
    let sum = cstr("sum");
    ok(unsafe { ops::ct_tensor_binary_cross_entropy(probs, labels, sum.as_ptr(), &mut bce) });
    ok(unsafe { tensor::ct_tensor_item_f64(bce, &mut value) });
    assert!((value - 2.0 * 2f64.ln()).abs() < 1e-6, "{value}");

    let outside = f32_tensor(&[1.5, 0.5], &[2]);
    let mut bad = ptr::null_mut();
    err(unsafe { ops::ct_tensor_binary_cross_entropy(outside, labels, sum.as_ptr(), &mut bad) });
    assert!(bad.is_null());

    for h in [logits, classes, ce, probs, labels, bce, outside] {
        close(h);
    }
}

#[test]
fn losses_validate_the_reduction_tag() {
    let input = f32_tensor(&[1.0, 2.0], &[2]);
    let target = f32_tensor(&[0.0, 0.0], &[2]);
    let mut out = ptr::null_mut();
    ok(unsafe { ops::ct_tensor_mse_loss(input, target, cstr("mean").as_ptr(), &mut out) });
    let mut value = 0.0;
    ok(unsafe { tensor::ct_tensor_item_f64(out, &mut value) });
    assert_eq!(value, 2.5);
    close(out);

    let mut bad = ptr::null_mut();
    let avg = cstr("avg");
    let msg = err(unsafe { ops::ct_tensor_mse_loss(input, target, avg.as_ptr(), &mut bad) });
    assert!(msg.contains("avg"), "{msg}");
    close(input);
    close(target);
}

#[test]
fn tensor_string_is_freed_by_ct_free_string() {
    let t = f32_tensor(&[1.5, 2.5], &[2]);
    let mut s = ptr::null_mut();
    ok(unsafe { tensor::ct_tensor_string(t, &mut s) });
    let text = unsafe { std::ffi::CStr::from_ptr(s) }.to_string_lossy().into_owned();
    unsafe { ctorch_tensor::ct_free_string(s) };
    assert!(text.contains("1.5"), "{text}");
    close(t);
}

#[test]
fn kaiming_uniform_stays_within_bound() {
    let dev = cpu();
    let dims = [10i64, 20];
    let mut w = ptr::null_mut();
    ok(unsafe { tensor::ct_tensor_empty(dims.as_ptr(), 2, FLOAT, dev, false, &mut w) });
    let (mut fan_in, mut fan_out) = (0i64, 0i64);
    ok(unsafe { init::ct_calculate_fan_in_and_fan_out(w, &mut fan_in, &mut fan_out) });
    assert_eq!((fan_in, fan_out), (20, 10));

    ok(unsafe {
        init::ct_init_kaiming_uniform_(
            w,
            5f64.sqrt(),
            cstr("fan_in").as_ptr(),
            cstr("leaky_relu").as_ptr(),
        )
    });
    let bound = 1.0 / 20f32.sqrt();
    assert!(f32_values(w).iter().all(|v| v.abs() <= bound + 1e-6));

    let msg = err(unsafe {
        init::ct_init_kaiming_uniform_(w, 0.0, cstr("fan_avg").as_ptr(), cstr("relu").as_ptr())
    });
    assert!(msg.contains("fan_avg"), "{msg}");
    close(w);
    ok(unsafe { ct_device_close(dev) });
}
