mod common;

use common::ok;
use ctorch_tensor::gc::{ct_finish_gc, ct_gc_prepared, ct_prepare_gc};

fn prepared() -> bool {
    let mut flag = true;
    ok(unsafe { ct_gc_prepared(&mut flag) });
    flag
}

// One test only: the flag is process-wide.
#[test]
fn gc_flag_is_last_write_wins() {
    assert!(!prepared());
    ok(ct_prepare_gc());
    assert!(prepared());
    ok(ct_finish_gc());
    assert!(!prepared());

    ok(ct_prepare_gc());
    ok(ct_prepare_gc());
    ok(ct_finish_gc());
    assert!(!prepared());

    ok(ct_finish_gc());
    assert!(!prepared());
}
