//! MNIST dataset, loader and iterator handles.
//!
//! An iterator shares its loader's state through an `Arc`; closing the loader
//! marks that state closed, so later iterator calls fail with
//! "loader closed" rather than touching freed memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ctorch_data::{DataError, Dataset, LoaderConfig, Mnist, Split};
use libc::c_char;

use crate::engine::Tensor;
use crate::error::{cstr_to_str, ffi_guard, slice_in, write_out, BridgeError, Result, Status};
use crate::handle::{
    borrow, borrow_mut, write_handle, DatasetHandle, IteratorHandle, LoaderHandle, TensorHandle,
};

/// Loader settings passed by value across the boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoaderOptions {
    pub batch_size: i64,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
}

impl LoaderOptions {
    /// Sequential order, short final batch kept.
    pub fn new(batch_size: i64) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
        }
    }
}

impl TryFrom<LoaderOptions> for LoaderConfig {
    type Error = BridgeError;

    fn try_from(o: LoaderOptions) -> Result<Self> {
        let batch_size = usize::try_from(o.batch_size)
            .map_err(|_| BridgeError::Invalid(format!("negative batch size {}", o.batch_size)))?;
        Ok(LoaderConfig {
            batch_size,
            shuffle: o.shuffle,
            drop_last: o.drop_last,
            seed: o.seed,
        })
    }
}

#[derive(Debug)]
struct LoaderCore {
    loader: ctorch_data::Loader,
    closed: AtomicBool,
}

#[derive(Debug)]
pub struct Loader {
    core: Arc<LoaderCore>,
}

impl Loader {
    pub fn new(dataset: &Dataset, options: LoaderOptions) -> Result<Self> {
        let loader = ctorch_data::Loader::new(dataset, options.try_into()?)?;
        Ok(Self {
            core: Arc::new(LoaderCore {
                loader,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn batch_count(&self) -> usize {
        self.core.loader.batch_count()
    }

    pub fn begin(&self) -> BatchIterator {
        BatchIterator {
            core: Arc::clone(&self.core),
            cursor: self.core.loader.begin(),
            current: None,
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.core.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct BatchIterator {
    core: Arc<LoaderCore>,
    cursor: ctorch_data::Cursor,
    current: Option<(usize, Tensor, Tensor)>,
}

fn exhausted(err: DataError) -> BridgeError {
    match err {
        DataError::BatchOutOfRange { .. } => BridgeError::IteratorExhausted,
        other => other.into(),
    }
}

impl BatchIterator {
    fn live(&self) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            Err(BridgeError::LoaderClosed)
        } else {
            Ok(())
        }
    }

    pub fn is_end(&self) -> Result<bool> {
        self.live()?;
        Ok(self.cursor.is_end())
    }

    /// Advances to the next batch; `false` once the pass is over.
    pub fn advance(&mut self) -> Result<bool> {
        self.live()?;
        self.cursor.advance().map_err(exhausted)
    }

    /// Data `[B, 1, H, W]` (`f32`) and targets `[B]` (`i64`) of the current
    /// batch. Repeated calls at one position share storage.
    pub fn batch(&mut self) -> Result<(Tensor, Tensor)> {
        self.live()?;
        let position = self.cursor.position();
        let cached = matches!(&self.current, Some((p, _, _)) if *p == position);
        if !cached {
            let batch = self.cursor.batch(&self.core.loader).map_err(exhausted)?;
            let shape: Vec<i64> = batch.data_shape.iter().map(|&d| d as i64).collect();
            let data = Tensor::from_f32s(&batch.data, &shape)?;
            let target = Tensor::from_i64s(&batch.targets, &[batch.targets.len() as i64])?;
            self.current = Some((position, data, target));
        }
        match &self.current {
            Some((_, data, target)) => Ok((data.shallow_clone(), target.shallow_clone())),
            None => Err(BridgeError::IteratorExhausted),
        }
    }
}

/// Loads the training (`train`) or test split of MNIST from `root`,
/// `root/raw` or `root/MNIST/raw`; plain or gzipped IDX files.
///
/// # Safety
/// `root` NUL-terminated; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_mnist_dataset(
    root: *const c_char,
    train: bool,
    out: *mut DatasetHandle,
) -> Status {
    ffi_guard("ct_mnist_dataset", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        let root = cstr_to_str(root, "root")?;
        let mnist = Mnist::load(root, Split::from_train_flag(train))?;
        write_handle(out, Dataset::new(mnist))
    })
}

/// Appends a per-channel normalisation. Loaders created earlier keep the
/// pipeline they were built with.
///
/// # Safety
/// `ds` must be live; `mean` and `std` must hold `mean_len`/`std_len` values.
#[no_mangle]
pub unsafe extern "C" fn ct_dataset_normalize(
    ds: DatasetHandle,
    mean: *const f64,
    mean_len: usize,
    std: *const f64,
    std_len: usize,
) -> Status {
    ffi_guard("ct_dataset_normalize", || {
        let mean = slice_in(mean, mean_len, "mean")?.to_vec();
        let std = slice_in(std, std_len, "std")?.to_vec();
        borrow_mut(ds)?.normalize(mean, std)?;
        Ok(())
    })
}

/// # Safety
/// `ds` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_dataset_size(ds: DatasetHandle, out: *mut i64) -> Status {
    ffi_guard("ct_dataset_size", || write_out(out, borrow(ds)?.len() as i64, "out"))
}

/// # Safety
/// `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_loader_default_options(
    batch_size: i64,
    out: *mut LoaderOptions,
) -> Status {
    ffi_guard("ct_loader_default_options", || {
        write_out(out, LoaderOptions::new(batch_size), "out")
    })
}

/// Builds a loader over a snapshot of `ds`; the dataset may be closed afterwards.
///
/// # Safety
/// `ds` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_loader(
    ds: DatasetHandle,
    options: LoaderOptions,
    out: *mut LoaderHandle,
) -> Status {
    ffi_guard("ct_loader", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        let loader = Loader::new(borrow(ds)?, options)?;
        write_handle(out, loader)
    })
}

/// # Safety
/// `loader` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_loader_batch_count(loader: LoaderHandle, out: *mut i64) -> Status {
    ffi_guard("ct_loader_batch_count", || {
        write_out(out, borrow(loader)?.batch_count() as i64, "out")
    })
}

/// Starts a pass. The iterator is positioned at the first batch, or at the
/// end when there is none.
///
/// # Safety
/// `loader` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_loader_begin(loader: LoaderHandle, out: *mut IteratorHandle) -> Status {
    ffi_guard("ct_loader_begin", || {
        if out.is_null() {
            return Err(BridgeError::NullPointer("out"));
        }
        write_handle(out, borrow(loader)?.begin())
    })
}

/// # Safety
/// `it` must be live; `has_more` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_iterator_next(it: IteratorHandle, has_more: *mut bool) -> Status {
    ffi_guard("ct_iterator_next", || {
        if has_more.is_null() {
            return Err(BridgeError::NullPointer("has_more"));
        }
        let more = borrow_mut(it)?.advance()?;
        write_out(has_more, more, "has_more")
    })
}

/// # Safety
/// `it` must be live; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn ct_iterator_is_end(it: IteratorHandle, out: *mut bool) -> Status {
    ffi_guard("ct_iterator_is_end", || write_out(out, borrow(it)?.is_end()?, "out"))
}

/// Writes handles for the current batch. Both alias the iterator's batch and
/// are closed separately with `ct_tensor_close`.
///
/// # Safety
/// `it` must be live; both outs writable.
#[no_mangle]
pub unsafe extern "C" fn ct_iterator_batch(
    it: IteratorHandle,
    data: *mut TensorHandle,
    target: *mut TensorHandle,
) -> Status {
    ffi_guard("ct_iterator_batch", || {
        if data.is_null() || target.is_null() {
            return Err(BridgeError::NullPointer(if data.is_null() { "data" } else { "target" }));
        }
        let (d, t) = borrow_mut(it)?.batch()?;
        write_handle(data, d)?;
        write_handle(target, t)
    })
}
