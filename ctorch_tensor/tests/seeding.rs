mod common;

use std::ptr;

use common::{close, cpu, f32_values, ok, FLOAT};
use ctorch_tensor::handle::ct_device_close;
use ctorch_tensor::{init, tensor};

// Separate binary: the generator is process-wide.
#[test]
fn manual_seed_replays_samples() {
    let dev = cpu();
    let dims = [16i64];
    let draw = || {
        let mut t = ptr::null_mut();
        ok(unsafe { tensor::ct_tensor_randn(dims.as_ptr(), 1, FLOAT, dev, false, &mut t) });
        let values = f32_values(t);
        close(t);
        values
    };

    ok(init::ct_manual_seed(1234));
    let first = draw();
    let second = draw();
    ok(init::ct_manual_seed(1234));
    assert_eq!(draw(), first);
    assert_ne!(first, second);

    ok(unsafe { ct_device_close(dev) });
}
