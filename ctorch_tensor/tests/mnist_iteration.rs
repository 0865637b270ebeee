mod common;

use std::path::Path;
use std::ptr;

use common::{close, cstr, err, f32_values, i64_values, ok, shape};
use ctorch_data::{synthesize, Split};
use ctorch_tensor::data::{self, LoaderOptions};
use ctorch_tensor::handle::{ct_dataset_close, ct_iterator_close, ct_loader_close};
use ctorch_tensor::{DatasetHandle, IteratorHandle, LoaderHandle};

fn open(root: &Path) -> DatasetHandle {
    let root = cstr(root.to_str().unwrap());
    let mut ds = ptr::null_mut();
    ok(unsafe { data::ct_mnist_dataset(root.as_ptr(), true, &mut ds) });
    ds
}

fn loader(ds: DatasetHandle, options: LoaderOptions) -> LoaderHandle {
    let mut l = ptr::null_mut();
    ok(unsafe { data::ct_loader(ds, options, &mut l) });
    l
}

fn begin(l: LoaderHandle) -> IteratorHandle {
    let mut it = ptr::null_mut();
    ok(unsafe { data::ct_loader_begin(l, &mut it) });
    it
}

/// Batch sizes of one full pass, following the `next` protocol.
fn pass(it: IteratorHandle) -> Vec<i64> {
    let mut sizes = Vec::new();
    let mut at_end = true;
    ok(unsafe { data::ct_iterator_is_end(it, &mut at_end) });
    while !at_end {
        let (mut d, mut t) = (ptr::null_mut(), ptr::null_mut());
        ok(unsafe { data::ct_iterator_batch(it, &mut d, &mut t) });
        sizes.push(shape(t)[0]);
        close(d);
        close(t);
        let mut more = false;
        ok(unsafe { data::ct_iterator_next(it, &mut more) });
        at_end = !more;
    }
    sizes
}

#[test]
fn hundred_samples_in_batches_of_seven() {
    let dir = tempfile::tempdir().unwrap();
    synthesize(dir.path().join("MNIST").join("raw"), Split::Train, 100, 28, 28, true).unwrap();
    let ds = open(dir.path());

    let mut size = 0i64;
    ok(unsafe { data::ct_dataset_size(ds, &mut size) });
    assert_eq!(size, 100);
    let (mean, std) = ([0.1307f64], [0.3081f64]);
    ok(unsafe { data::ct_dataset_normalize(ds, mean.as_ptr(), 1, std.as_ptr(), 1) });

    let mut options = LoaderOptions::new(0);
    ok(unsafe { data::ct_loader_default_options(7, &mut options) });
    let l = loader(ds, options);
    let mut count = 0i64;
    ok(unsafe { data::ct_loader_batch_count(l, &mut count) });
    assert_eq!(count, 15);

    let it = begin(l);
    let (mut d, mut t) = (ptr::null_mut(), ptr::null_mut());
    ok(unsafe { data::ct_iterator_batch(it, &mut d, &mut t) });
    assert_eq!(shape(d), vec![7, 1, 28, 28]);
    assert_eq!(i64_values(t), vec![0, 1, 2, 3, 4, 5, 6]);
    let expected = ((0.0f64 - 0.1307) / 0.3081) as f32;
    assert!((f32_values(d)[0] - expected).abs() < 1e-6);
    close(d);
    close(t);

    let sizes = pass(it);
    assert_eq!(sizes.len(), 15);
    assert_eq!(sizes.last(), Some(&2));

    let mut more = true;
    let msg = err(unsafe { data::ct_iterator_next(it, &mut more) });
    assert_eq!(msg, "iterator exhausted");
    let msg = err(unsafe { data::ct_iterator_batch(it, &mut d, &mut t) });
    assert_eq!(msg, "iterator exhausted");

    ok(unsafe { ct_iterator_close(it) });
    ok(unsafe { ct_loader_close(l) });
    ok(unsafe { ct_dataset_close(ds) });
}

#[test]
fn drop_last_and_shuffle() {
    let dir = tempfile::tempdir().unwrap();
    synthesize(dir.path(), Split::Train, 20, 4, 4, false).unwrap();
    let ds = open(dir.path());

    let l = loader(
        ds,
        LoaderOptions {
            batch_size: 6,
            shuffle: true,
            drop_last: true,
            seed: 11,
        },
    );
    // The dataset is no longer needed once the loader exists.
    ok(unsafe { ct_dataset_close(ds) });

    let it = begin(l);
    assert_eq!(pass(it), vec![6, 6, 6]);
    ok(unsafe { ct_iterator_close(it) });
    ok(unsafe { ct_loader_close(l) });
}

#[test]
fn iterator_outliving_its_loader_reports_closed() {
    let dir = tempfile::tempdir().unwrap();
    synthesize(dir.path(), Split::Train, 5, 2, 2, false).unwrap();
    let ds = open(dir.path());
    let l = loader(ds, LoaderOptions::new(2));
    let it = begin(l);
    ok(unsafe { ct_loader_close(l) });

    let mut at_end = false;
    assert_eq!(err(unsafe { data::ct_iterator_is_end(it, &mut at_end) }), "loader closed");
    let (mut d, mut t) = (ptr::null_mut(), ptr::null_mut());
    assert_eq!(err(unsafe { data::ct_iterator_batch(it, &mut d, &mut t) }), "loader closed");
    assert!(d.is_null() && t.is_null());

    ok(unsafe { ct_iterator_close(it) });
    ok(unsafe { ct_dataset_close(ds) });
}

#[test]
fn missing_dataset_and_bad_options_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let root = cstr(dir.path().join("nowhere").to_str().unwrap());
    let mut ds = ptr::null_mut();
    let msg = err(unsafe { data::ct_mnist_dataset(root.as_ptr(), false, &mut ds) });
    assert!(msg.contains("t10k-images-idx3-ubyte"), "{msg}");
    assert!(ds.is_null());

    synthesize(dir.path(), Split::Train, 3, 2, 2, false).unwrap();
    let ds = open(dir.path());
    let mut l = ptr::null_mut();
    err(unsafe { data::ct_loader(ds, LoaderOptions::new(0), &mut l) });
    err(unsafe { data::ct_loader(ds, LoaderOptions::new(-4), &mut l) });
    assert!(l.is_null());

    let (mean, std) = ([0.5f64, 0.5], [1.0f64]);
    err(unsafe { data::ct_dataset_normalize(ds, mean.as_ptr(), 2, std.as_ptr(), 1) });
    ok(unsafe { ct_dataset_close(ds) });
}
