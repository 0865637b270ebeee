//! Dense strided CPU tensors. Every element is held as `f64` and rounded to
//! the tensor's dtype on write; views share one `RwLock`ed storage.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use half::{bf16, f16};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{check_shape, wrap_dim, DType, Device, EngineError, Reduction, Result, Value};

const DEFAULT_SEED: u64 = 67_280_421_310_721;
const MAGIC: &[u8; 4] = b"CTRF";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 32;
const IGNORE_INDEX: i64 = -100;

static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::seed_from_u64(DEFAULT_SEED)));
static NUM_THREADS: AtomicUsize = AtomicUsize::new(1);

pub fn manual_seed(seed: u64) {
    let mut rng = RNG.lock().unwrap_or_else(PoisonError::into_inner);
    *rng = StdRng::seed_from_u64(seed);
}

/// Recorded for `ct_backend_info`; the reference engine runs on the caller's thread.
pub fn set_num_threads(n: i32) -> Result<()> {
    if n <= 0 {
        return Err(EngineError::Argument(format!(
            "number of threads must be positive, got {n}"
        )));
    }
    NUM_THREADS.store(n as usize, Ordering::SeqCst);
    Ok(())
}

pub fn num_threads() -> i32 {
    NUM_THREADS.load(Ordering::SeqCst) as i32
}

pub fn cuda_is_available() -> bool {
    false
}

pub fn cudnn_is_available() -> bool {
    false
}

pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    f()
}

/// TorchScript needs LibTorch; `load` always fails here.
#[derive(Debug)]
pub struct Module {
    _private: (),
}

impl Module {
    pub fn load(path: &Path, _device: Device) -> Result<Module> {
        Err(EngineError::Unsupported(format!(
            "cannot load {}: TorchScript modules need the libtorch engine",
            path.display()
        )))
    }

    pub fn forward(&self, _inputs: &[&Tensor]) -> Result<Value> {
        Err(EngineError::Unsupported(
            "TorchScript modules need the libtorch engine".to_string(),
        ))
    }
}

#[derive(bincode::Encode, bincode::Decode)]
struct Record {
    dtype: i32,
    shape: Vec<u64>,
    requires_grad: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct Tensor {
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    dtype: DType,
    requires_grad: bool,
}

fn numel_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn checked_numel(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| EngineError::Shape(format!("shape {shape:?} has too many elements")))
}

/// An empty buffer with room for `n` elements; exhaustion is an error, not an abort.
fn buffer<T>(n: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(n)
        .map_err(|_| EngineError::OutOfMemory(n.saturating_mul(std::mem::size_of::<T>())))?;
    Ok(buf)
}

fn filled(n: usize, f: impl FnMut(usize) -> f64) -> Result<Vec<f64>> {
    let mut buf = buffer(n)?;
    buf.extend((0..n).map(f));
    Ok(buf)
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1].max(1);
    }
    strides
}

fn round_to(dtype: DType, v: f64) -> f64 {
    match dtype {
        DType::Bool => {
            if v != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        DType::Byte => v as i64 as u8 as f64,
        DType::Char => v as i64 as i8 as f64,
        DType::Short => v as i64 as i16 as f64,
        DType::Int => v as i64 as i32 as f64,
        DType::Long => v as i64 as f64,
        DType::Half => f16::from_f64(v).to_f64(),
        DType::BFloat16 => bf16::from_f64(v).to_f64(),
        DType::Float => v as f32 as f64,
        _ => v,
    }
}

fn encode_value(dtype: DType, v: f64, out: &mut Vec<u8>) {
    match dtype {
        DType::Bool => out.push((v != 0.0) as u8),
        DType::Byte => out.push(v as u8),
        DType::Char => out.extend_from_slice(&(v as i8).to_ne_bytes()),
        DType::Short => out.extend_from_slice(&(v as i16).to_ne_bytes()),
        DType::Int => out.extend_from_slice(&(v as i32).to_ne_bytes()),
        DType::Long => out.extend_from_slice(&(v as i64).to_ne_bytes()),
        DType::Half => out.extend_from_slice(&f16::from_f64(v).to_ne_bytes()),
        DType::BFloat16 => out.extend_from_slice(&bf16::from_f64(v).to_ne_bytes()),
        DType::Float => out.extend_from_slice(&(v as f32).to_ne_bytes()),
        _ => out.extend_from_slice(&v.to_ne_bytes()),
    }
}

fn decode_value(dtype: DType, raw: &[u8]) -> f64 {
    match dtype {
        DType::Bool => (raw[0] != 0) as u8 as f64,
        DType::Byte => raw[0] as f64,
        DType::Char => i8::from_ne_bytes([raw[0]]) as f64,
        DType::Short => i16::from_ne_bytes([raw[0], raw[1]]) as f64,
        DType::Int => i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
        DType::Half => f16::from_ne_bytes([raw[0], raw[1]]).to_f64(),
        DType::BFloat16 => bf16::from_ne_bytes([raw[0], raw[1]]).to_f64(),
        DType::Float => f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
        DType::Long => {
            let mut b = [0u8; 8];
            b.copy_from_slice(raw);
            i64::from_ne_bytes(b) as f64
        }
        _ => {
            let mut b = [0u8; 8];
            b.copy_from_slice(raw);
            f64::from_ne_bytes(b)
        }
    }
}

fn supported(dtype: DType) -> Result<()> {
    if dtype.is_complex() || dtype.is_quantized() {
        return Err(EngineError::Unsupported(format!(
            "dtype {dtype} is not available in the reference engine"
        )));
    }
    Ok(())
}

fn check_device(device: Device) -> Result<()> {
    if device.is_cuda() {
        return Err(EngineError::Unsupported(format!(
            "device {device} is not available in the reference engine"
        )));
    }
    Ok(())
}

fn require_floating(dtype: DType, op: &str) -> Result<()> {
    if !dtype.is_floating() {
        return Err(EngineError::Argument(format!(
            "{op} expects a floating point dtype, got {dtype}"
        )));
    }
    Ok(())
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let dim_at = |s: &[usize], i: usize| {
        if i + s.len() >= n {
            s[i + s.len() - n]
        } else {
            1
        }
    };
    (0..n)
        .map(|i| {
            let (da, db) = (dim_at(a, i), dim_at(b, i));
            if da == db || db == 1 {
                Ok(da)
            } else if da == 1 {
                Ok(db)
            } else {
                Err(EngineError::Shape(format!(
                    "shapes {a:?} and {b:?} are not broadcastable"
                )))
            }
        })
        .collect()
}

fn infer_shape(spec: &[i64], numel: usize) -> Result<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    for (i, &d) in spec.iter().enumerate() {
        if d == -1 {
            if inferred.replace(i).is_some() {
                return Err(EngineError::Shape("only one dimension can be inferred".to_string()));
            }
        } else if d < 0 {
            return Err(EngineError::Shape(format!("invalid shape dimension {d}")));
        } else {
            known = known
                .checked_mul(d as usize)
                .ok_or_else(|| {
                    EngineError::Shape(format!("shape {spec:?} has too many elements"))
                })?;
        }
    }
    let mut shape: Vec<usize> = spec.iter().map(|&d| d.max(0) as usize).collect();
    match inferred {
        Some(i) if known != 0 && numel % known == 0 => shape[i] = numel / known,
        None if known == numel => {}
        _ => {
            return Err(EngineError::Shape(format!(
                "shape {spec:?} is invalid for input of size {numel}"
            )))
        }
    }
    Ok(shape)
}

impl Tensor {
    fn from_values(mut values: Vec<f64>, shape: Vec<usize>, dtype: DType) -> Tensor {
        for v in values.iter_mut() {
            *v = round_to(dtype, *v);
        }
        Tensor {
            storage: Arc::new(RwLock::new(values)),
            strides: contiguous_strides(&shape),
            shape,
            offset: 0,
            dtype,
            requires_grad: false,
        }
    }

    fn alias(&self, shape: Vec<usize>, strides: Vec<usize>, offset: usize) -> Tensor {
        Tensor {
            storage: Arc::clone(&self.storage),
            shape,
            strides,
            offset,
            dtype: self.dtype,
            requires_grad: self.requires_grad,
        }
    }

    /// Storage offsets of every element in row-major logical order.
    fn offsets(&self) -> Result<Vec<usize>> {
        let n = checked_numel(&self.shape)?;
        let mut out = buffer(n)?;
        if n == 0 {
            return Ok(out);
        }
        let ndim = self.shape.len();
        let mut idx = vec![0usize; ndim];
        loop {
            let off: usize = idx.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            out.push(self.offset + off);
            let mut d = ndim;
            loop {
                if d == 0 {
                    return Ok(out);
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < self.shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    fn values(&self) -> Result<Vec<f64>> {
        let offsets = self.offsets()?;
        let mut out = buffer(offsets.len())?;
        let data = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        out.extend(offsets.into_iter().map(|o| data[o]));
        Ok(out)
    }

    fn write_values(&self, values: &[f64]) -> Result<()> {
        let offsets = self.offsets()?;
        let mut data = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        for (o, v) in offsets.into_iter().zip(values) {
            data[o] = round_to(self.dtype, *v);
        }
        Ok(())
    }

    fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&size, (s, e))| size <= 1 || s == e)
    }

    fn expand(&self, shape: &[usize]) -> Result<Tensor> {
        if shape.len() < self.shape.len() {
            return Err(EngineError::Shape(format!(
                "cannot expand {:?} to fewer dimensions {:?}",
                self.shape, shape
            )));
        }
        let lead = shape.len() - self.shape.len();
        let mut strides = vec![0usize; shape.len()];
        for (j, (&size, &stride)) in self.shape.iter().zip(&self.strides).enumerate() {
            let target = shape[lead + j];
            strides[lead + j] = if size == target {
                stride
            } else if size == 1 {
                0
            } else {
                return Err(EngineError::Shape(format!(
                    "expanded size {target} must match existing size {size} at dimension {}",
                    lead + j
                )));
            };
        }
        Ok(self.alias(shape.to_vec(), strides, self.offset))
    }

    fn map(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Result<Tensor> {
        let mut values = self.values()?;
        for v in values.iter_mut() {
            *v = f(*v);
        }
        Ok(Tensor::from_values(values, self.shape.clone(), dtype))
    }

    fn zip_map(&self, other: &Tensor, dtype: DType, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        let shape = broadcast_shape(&self.shape, &other.shape)?;
        let mut a = self.expand(&shape)?.values()?;
        let b = other.expand(&shape)?.values()?;
        for (x, y) in a.iter_mut().zip(&b) {
            *x = f(*x, *y);
        }
        Ok(Tensor::from_values(a, shape, dtype))
    }

    fn assign_with(&mut self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<()> {
        let result = self.dtype.promote(other.dtype);
        if result.is_floating() && !self.dtype.is_floating() {
            return Err(EngineError::Argument(format!(
                "result type {result} can't be cast to the desired output type {}",
                self.dtype
            )));
        }
        let b = other.expand(&self.shape)?.values()?;
        let mut a = self.values()?;
        for (x, y) in a.iter_mut().zip(&b) {
            *x = f(*x, *y);
        }
        self.write_values(&a)
    }

    /// Splits the logical layout around `dim` into `(outer, size, inner)`.
    fn lanes(&self, dim: usize) -> (usize, usize, usize) {
        let outer = numel_of(&self.shape[..dim]);
        let size = self.shape[dim];
        let inner = numel_of(&self.shape[dim + 1..]);
        (outer, size, inner)
    }

    fn reduce_dim(
        &self,
        dim: usize,
        keepdim: bool,
        dtype: DType,
        f: impl Fn(&[f64]) -> f64,
    ) -> Result<Tensor> {
        let values = self.values()?;
        let (outer, size, inner) = self.lanes(dim);
        let mut out = buffer(outer * inner)?;
        let mut lane = buffer(size)?;
        for o in 0..outer {
            for i in 0..inner {
                lane.clear();
                lane.extend((0..size).map(|k| values[(o * size + k) * inner + i]));
                out.push(f(&lane));
            }
        }
        let mut shape = self.shape.clone();
        if keepdim {
            shape[dim] = 1;
        } else {
            shape.remove(dim);
        }
        Ok(Tensor::from_values(out, shape, dtype))
    }

    fn sample(
        shape: &[i64],
        dtype: DType,
        device: Device,
        draw: impl Fn(&mut StdRng) -> f64,
    ) -> Result<Tensor> {
        check_device(device)?;
        supported(dtype)?;
        require_floating(dtype, "random sampling")?;
        let shape = check_shape(shape)?;
        let n = checked_numel(&shape)?;
        let mut values = buffer(n)?;
        let mut rng = RNG.lock().unwrap_or_else(PoisonError::into_inner);
        values.extend((0..n).map(|_| draw(&mut *rng)));
        Ok(Tensor::from_values(values, shape, dtype))
    }

    fn draw_normal(rng: &mut StdRng, mean: f64, std: f64) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        mean + std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    // Construction

    pub fn full(shape: &[i64], value: f64, dtype: DType, device: Device) -> Result<Tensor> {
        check_device(device)?;
        supported(dtype)?;
        let shape = check_shape(shape)?;
        let values = filled(checked_numel(&shape)?, |_| value)?;
        Ok(Tensor::from_values(values, shape, dtype))
    }

    pub fn zeros(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Tensor::full(shape, 0.0, dtype, device)
    }

    pub fn ones(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Tensor::full(shape, 1.0, dtype, device)
    }

    pub fn empty(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Tensor::zeros(shape, dtype, device)
    }

    pub fn randn(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Tensor::sample(shape, dtype, device, |rng| Tensor::draw_normal(rng, 0.0, 1.0))
    }

    pub fn rand(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Tensor::sample(shape, dtype, device, |rng| rng.gen::<f64>())
    }

    pub fn eye(n: i64, m: i64, dtype: DType, device: Device) -> Result<Tensor> {
        check_device(device)?;
        supported(dtype)?;
        let shape = check_shape(&[n, m])?;
        let cols = shape[1];
        let values = filled(checked_numel(&shape)?, |i| {
            if i / cols == i % cols {
                1.0
            } else {
                0.0
            }
        })?;
        Ok(Tensor::from_values(values, shape, dtype))
    }

    pub fn arange(start: f64, end: f64, step: f64, dtype: DType, device: Device) -> Result<Tensor> {
        check_device(device)?;
        supported(dtype)?;
        if step == 0.0 {
            return Err(EngineError::Argument("step must be nonzero".to_string()));
        }
        let count = ((end - start) / step).ceil();
        if !count.is_finite() || count < 0.0 {
            return Err(EngineError::Argument(
                "upper bound and larger bound inconsistent with step sign".to_string(),
            ));
        }
        let n = count as usize;
        let values = filled(n, |i| start + i as f64 * step)?;
        Ok(Tensor::from_values(values, vec![n], dtype))
    }

    pub fn linspace(
        start: f64,
        end: f64,
        steps: i64,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        check_device(device)?;
        supported(dtype)?;
        if steps < 0 {
            return Err(EngineError::Argument("number of steps must be non-negative".to_string()));
        }
        let n = steps as usize;
        let values = filled(n, |i| {
            if n == 1 {
                start
            } else {
                start + (end - start) * i as f64 / (n - 1) as f64
            }
        })?;
        Ok(Tensor::from_values(values, vec![n], dtype))
    }

    pub fn logspace(
        start: f64,
        end: f64,
        steps: i64,
        base: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        supported(dtype)?;
        let exponents = Tensor::linspace(start, end, steps, DType::Double, device)?;
        exponents.map(dtype, |e| base.powf(e))
    }

    /// Copies native-endian element bytes of `dtype` into a new tensor.
    pub fn from_data(bytes: &[u8], shape: &[i64], dtype: DType) -> Result<Tensor> {
        supported(dtype)?;
        let shape = check_shape(shape)?;
        let expected = checked_numel(&shape)?.checked_mul(dtype.elem_size());
        if expected != Some(bytes.len()) {
            return Err(EngineError::Argument(format!(
                "byte count {} does not match a {dtype} tensor of shape {shape:?}",
                bytes.len()
            )));
        }
        let mut values = buffer(bytes.len() / dtype.elem_size())?;
        values.extend(
            bytes
                .chunks_exact(dtype.elem_size())
                .map(|raw| decode_value(dtype, raw)),
        );
        Ok(Tensor::from_values(values, shape, dtype))
    }

    pub fn from_f32s(values: &[f32], shape: &[i64]) -> Result<Tensor> {
        let data = filled(values.len(), |i| values[i] as f64)?;
        Tensor::from_values(data, vec![values.len()], DType::Float).view(shape)
    }

    pub fn from_i64s(values: &[i64], shape: &[i64]) -> Result<Tensor> {
        let data = filled(values.len(), |i| values[i] as f64)?;
        Tensor::from_values(data, vec![values.len()], DType::Long).view(shape)
    }

    pub fn zeros_like(&self) -> Result<Tensor> {
        let values = filled(checked_numel(&self.shape)?, |_| 0.0)?;
        Ok(Tensor::from_values(values, self.shape.clone(), self.dtype))
    }

    // Queries

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> Vec<i64> {
        self.shape.iter().map(|&d| d as i64).collect()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        numel_of(&self.shape)
    }

    pub fn device(&self) -> Device {
        Device::Cpu
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn item_f64(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(EngineError::Argument(format!(
                "a Tensor with {} elements cannot be converted to Scalar",
                self.numel()
            )));
        }
        Ok(self.values()?[0])
    }

    pub fn item_i64(&self) -> Result<i64> {
        Ok(self.item_f64()? as i64)
    }

    /// Contiguous native-endian element bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let values = self.values()?;
        let len = values.len().saturating_mul(self.dtype.elem_size());
        let mut out = buffer(len)?;
        for v in values {
            encode_value(self.dtype, v, &mut out);
        }
        Ok(out)
    }

    // Conversion and aliasing

    pub fn shallow_clone(&self) -> Tensor {
        self.alias(self.shape.clone(), self.strides.clone(), self.offset)
    }

    pub fn detach(&self) -> Result<Tensor> {
        let mut t = self.shallow_clone();
        t.requires_grad = false;
        Ok(t)
    }

    pub fn deep_clone(&self) -> Result<Tensor> {
        let mut t = Tensor::from_values(self.values()?, self.shape.clone(), self.dtype);
        t.requires_grad = self.requires_grad;
        Ok(t)
    }

    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        supported(dtype)?;
        if dtype == self.dtype {
            return Ok(self.shallow_clone());
        }
        self.map(dtype, |v| v)
    }

    pub fn to(&self, device: Device, dtype: DType) -> Result<Tensor> {
        check_device(device)?;
        self.cast(dtype)
    }

    pub fn copy_to(&self, device: Device) -> Result<Tensor> {
        check_device(device)?;
        self.deep_clone()
    }

    /// Host memory is the only memory here, so pinning is a plain copy.
    pub fn pin_memory(&self) -> Result<Tensor> {
        self.deep_clone()
    }

    pub fn set_data(&mut self, other: &Tensor) -> Result<()> {
        self.storage = Arc::clone(&other.storage);
        self.shape = other.shape.clone();
        self.strides = other.strides.clone();
        self.offset = other.offset;
        self.dtype = other.dtype;
        Ok(())
    }

    pub fn select(&self, dim: i64, index: i64) -> Result<Tensor> {
        if self.dim() == 0 {
            return Err(EngineError::Argument(
                "select() cannot be applied to a 0-dim tensor".to_string(),
            ));
        }
        let d = wrap_dim(dim, self.dim())?;
        let size = self.shape[d];
        let i = if index < 0 { index + size as i64 } else { index };
        if i < 0 || i >= size as i64 {
            return Err(EngineError::Index { index, dim: d, size });
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        let offset = self.offset + i as usize * strides[d];
        shape.remove(d);
        strides.remove(d);
        Ok(self.alias(shape, strides, offset))
    }

    pub fn index(&self, indices: &[i64]) -> Result<Tensor> {
        let mut t = self.shallow_clone();
        for &i in indices {
            t = t.select(0, i)?;
        }
        Ok(t)
    }

    // Autograd

    pub fn set_requires_grad(&mut self, requires_grad: bool) -> Result<()> {
        if requires_grad && !self.dtype.is_floating() {
            return Err(EngineError::Argument(
                "only Tensors of floating point dtype can require gradients".to_string(),
            ));
        }
        self.requires_grad = requires_grad;
        Ok(())
    }

    pub fn backward(&self) -> Result<()> {
        Err(EngineError::Unsupported(
            "autograd is not available in the reference engine".to_string(),
        ))
    }

    pub fn grad(&self) -> Option<Tensor> {
        None
    }

    pub fn zero_grad(&mut self) -> Result<()> {
        Ok(())
    }

    // Elementwise

    pub fn add(&self, other: &Tensor, alpha: f64) -> Result<Tensor> {
        self.zip_map(other, self.dtype.promote(other.dtype), |x, y| x + alpha * y)
    }

    pub fn sub(&self, other: &Tensor, alpha: f64) -> Result<Tensor> {
        self.zip_map(other, self.dtype.promote(other.dtype), |x, y| x - alpha * y)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_map(other, self.dtype.promote(other.dtype), |x, y| x * y)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        let dtype = self.dtype.promote(other.dtype).to_floating();
        self.zip_map(other, dtype, |x, y| x / y)
    }

    pub fn add_(&mut self, other: &Tensor, alpha: f64) -> Result<()> {
        self.assign_with(other, |x, y| x + alpha * y)
    }

    pub fn sub_(&mut self, other: &Tensor, alpha: f64) -> Result<()> {
        self.assign_with(other, |x, y| x - alpha * y)
    }

    pub fn mul_(&mut self, other: &Tensor) -> Result<()> {
        self.assign_with(other, |x, y| x * y)
    }

    pub fn div_(&mut self, other: &Tensor) -> Result<()> {
        if !self.dtype.is_floating() {
            return Err(EngineError::Argument(format!(
                "result type Float can't be cast to the desired output type {}",
                self.dtype
            )));
        }
        self.assign_with(other, |x, y| x / y)
    }

    fn scalar_dtype(&self, value: f64) -> DType {
        match self.dtype {
            DType::Bool if value.fract() == 0.0 => DType::Long,
            d if !d.is_floating() && value.fract() != 0.0 => DType::Float,
            d => d,
        }
    }

    pub fn add_scalar(&self, value: f64) -> Result<Tensor> {
        self.map(self.scalar_dtype(value), |x| x + value)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Tensor> {
        self.map(self.scalar_dtype(value), |x| x * value)
    }

    pub fn eq_tensor(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_map(other, DType::Bool, |x, y| (x == y) as u8 as f64)
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.map(self.dtype, |x| if x > 0.0 { x } else { 0.0 })
    }

    pub fn leaky_relu(&self, slope: f64) -> Result<Tensor> {
        require_floating(self.dtype, "leaky_relu")?;
        self.map(self.dtype, |x| if x > 0.0 { x } else { x * slope })
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.map(self.dtype.to_floating(), f64::tanh)
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        self.map(self.dtype.to_floating(), |x| 1.0 / (1.0 + (-x).exp()))
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.map(self.dtype.to_floating(), f64::sqrt)
    }

    pub fn log_softmax(&self, dim: i64) -> Result<Tensor> {
        let dtype = self.dtype.to_floating();
        if self.dim() == 0 {
            return self.map(dtype, |_| 0.0);
        }
        let d = wrap_dim(dim, self.dim())?;
        let values = self.values()?;
        let (outer, size, inner) = self.lanes(d);
        let mut out = filled(values.len(), |_| 0.0)?;
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * size + k) * inner + i;
                let max = (0..size)
                    .map(|k| values[at(k)])
                    .fold(f64::NEG_INFINITY, f64::max);
                let lse = (0..size).map(|k| (values[at(k)] - max).exp()).sum::<f64>().ln() + max;
                for k in 0..size {
                    out[at(k)] = values[at(k)] - lse;
                }
            }
        }
        Ok(Tensor::from_values(out, self.shape.clone(), dtype))
    }

    pub fn mm(&self, other: &Tensor) -> Result<Tensor> {
        if self.dim() != 2 || other.dim() != 2 {
            return Err(EngineError::Shape(format!(
                "mm expects 2-D tensors, got {}-D and {}-D",
                self.dim(),
                other.dim()
            )));
        }
        let (n, k) = (self.shape[0], self.shape[1]);
        let (k2, m) = (other.shape[0], other.shape[1]);
        if k != k2 {
            return Err(EngineError::Shape(format!(
                "mat1 and mat2 shapes cannot be multiplied ({n}x{k} and {k2}x{m})"
            )));
        }
        let a = self.values()?;
        let b = other.values()?;
        let mut out = filled(checked_numel(&[n, m])?, |_| 0.0)?;
        for r in 0..n {
            for c in 0..m {
                out[r * m + c] = (0..k).map(|j| a[r * k + j] * b[j * m + c]).sum();
            }
        }
        Ok(Tensor::from_values(out, vec![n, m], self.dtype.promote(other.dtype)))
    }

    // Reductions

    pub fn sum(&self) -> Result<Tensor> {
        let dtype = if self.dtype.is_floating() { self.dtype } else { DType::Long };
        Ok(Tensor::from_values(vec![self.values()?.iter().sum()], vec![], dtype))
    }

    pub fn mean(&self) -> Result<Tensor> {
        if !self.dtype.is_floating() {
            return Err(EngineError::Argument(format!(
                "mean(): input dtype must be floating point, got {}",
                self.dtype
            )));
        }
        let values = self.values()?;
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Ok(Tensor::from_values(vec![mean], vec![], self.dtype))
    }

    pub fn sum_dim(&self, dim: i64, keepdim: bool) -> Result<Tensor> {
        let dtype = if self.dtype.is_floating() { self.dtype } else { DType::Long };
        if self.dim() == 0 {
            return self.cast(dtype);
        }
        let d = wrap_dim(dim, self.dim())?;
        self.reduce_dim(d, keepdim, dtype, |lane| lane.iter().sum())
    }

    fn arg_extreme(
        &self,
        dim: Option<i64>,
        keepdim: bool,
        name: &str,
        better: fn(f64, f64) -> bool,
    ) -> Result<Tensor> {
        if self.numel() == 0 {
            return Err(EngineError::Argument(format!(
                "cannot perform reduction function {name} on a tensor with no elements"
            )));
        }
        let pick = move |lane: &[f64]| {
            let mut best = 0;
            for (i, &v) in lane.iter().enumerate() {
                if better(v, lane[best]) {
                    best = i;
                }
            }
            best as f64
        };
        match dim {
            None => Ok(Tensor::from_values(vec![pick(&self.values()?)], vec![], DType::Long)),
            Some(_) if self.dim() == 0 => Ok(Tensor::from_values(vec![0.0], vec![], DType::Long)),
            Some(dim) => {
                let d = wrap_dim(dim, self.dim())?;
                self.reduce_dim(d, keepdim, DType::Long, pick)
            }
        }
    }

    pub fn argmax(&self, dim: Option<i64>, keepdim: bool) -> Result<Tensor> {
        self.arg_extreme(dim, keepdim, "argmax", |v, best| v > best)
    }

    pub fn argmin(&self, dim: Option<i64>, keepdim: bool) -> Result<Tensor> {
        self.arg_extreme(dim, keepdim, "argmin", |v, best| v < best)
    }

    // Shape

    pub fn squeeze(&self) -> Result<Tensor> {
        let (shape, strides): (Vec<usize>, Vec<usize>) = self
            .shape
            .iter()
            .zip(&self.strides)
            .filter(|(size, _)| **size != 1)
            .map(|(size, stride)| (*size, *stride))
            .unzip();
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn squeeze_dim(&self, dim: i64) -> Result<Tensor> {
        if self.dim() == 0 {
            wrap_dim(dim, 0)?;
            return Ok(self.shallow_clone());
        }
        let d = wrap_dim(dim, self.dim())?;
        if self.shape[d] != 1 {
            return Ok(self.shallow_clone());
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.remove(d);
        strides.remove(d);
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn unsqueeze(&self, dim: i64) -> Result<Tensor> {
        let d = wrap_dim(dim, self.dim() + 1)?;
        let stride = if d < self.dim() {
            self.strides[d] * self.shape[d].max(1)
        } else {
            1
        };
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.insert(d, 1);
        strides.insert(d, stride);
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Tensor> {
        if self.dim() == 0 {
            wrap_dim(dim0, 0)?;
            wrap_dim(dim1, 0)?;
            return Ok(self.shallow_clone());
        }
        let a = wrap_dim(dim0, self.dim())?;
        let b = wrap_dim(dim1, self.dim())?;
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.swap(a, b);
        strides.swap(a, b);
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn permute(&self, dims: &[i64]) -> Result<Tensor> {
        if dims.len() != self.dim() {
            return Err(EngineError::Shape(format!(
                "permute: number of dims {} doesn't match tensor rank {}",
                dims.len(),
                self.dim()
            )));
        }
        let mut seen = vec![false; self.dim()];
        let mut shape = Vec::with_capacity(self.dim());
        let mut strides = Vec::with_capacity(self.dim());
        for &dim in dims {
            let d = wrap_dim(dim, self.dim())?;
            if std::mem::replace(&mut seen[d], true) {
                return Err(EngineError::Shape(format!("permute: repeated dim {d}")));
            }
            shape.push(self.shape[d]);
            strides.push(self.strides[d]);
        }
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn view(&self, shape: &[i64]) -> Result<Tensor> {
        let shape = infer_shape(shape, self.numel())?;
        if !self.is_contiguous() {
            return Err(EngineError::Shape(
                "view size is not compatible with input tensor's size and stride; \
                 use reshape instead"
                    .to_string(),
            ));
        }
        let strides = contiguous_strides(&shape);
        Ok(self.alias(shape, strides, self.offset))
    }

    pub fn reshape(&self, shape: &[i64]) -> Result<Tensor> {
        if self.is_contiguous() {
            return self.view(shape);
        }
        self.deep_clone()?.view(shape)
    }

    pub fn flatten(&self, start_dim: i64, end_dim: i64) -> Result<Tensor> {
        if self.dim() == 0 {
            return self.reshape(&[1]);
        }
        let s = wrap_dim(start_dim, self.dim())?;
        let e = wrap_dim(end_dim, self.dim())?;
        if s > e {
            return Err(EngineError::Argument(
                "flatten() has invalid args: start_dim cannot come after end_dim".to_string(),
            ));
        }
        let mut shape: Vec<i64> = self.size()[..s].to_vec();
        shape.push(numel_of(&self.shape[s..=e]) as i64);
        shape.extend_from_slice(&self.size()[e + 1..]);
        self.reshape(&shape)
    }

    pub fn narrow(&self, dim: i64, start: i64, length: i64) -> Result<Tensor> {
        if self.dim() == 0 {
            return Err(EngineError::Argument(
                "narrow() cannot be applied to a 0-dim tensor".to_string(),
            ));
        }
        let d = wrap_dim(dim, self.dim())?;
        let size = self.shape[d] as i64;
        let start = if start < 0 { start + size } else { start };
        if start < 0 || length < 0 || start + length > size {
            return Err(EngineError::Index {
                index: start + length.max(0),
                dim: d,
                size: size as usize,
            });
        }
        let mut shape = self.shape.clone();
        shape[d] = length as usize;
        let offset = self.offset + start as usize * self.strides[d];
        Ok(self.alias(shape, self.strides.clone(), offset))
    }

    pub fn expand_as(&self, other: &Tensor) -> Result<Tensor> {
        self.expand(&other.shape)
    }

    pub fn stack(tensors: &[&Tensor], dim: i64) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| {
                EngineError::Argument("stack expects a non-empty TensorList".to_string())
            })?;
        if let Some(bad) = tensors.iter().find(|t| t.shape != first.shape) {
            return Err(EngineError::Shape(format!(
                "stack expects each tensor to be equal size, but got {:?} and {:?}",
                first.shape, bad.shape
            )));
        }
        let d = wrap_dim(dim, first.dim() + 1)?;
        let dtype = tensors.iter().fold(first.dtype, |acc, t| acc.promote(t.dtype));
        let outer = numel_of(&first.shape[..d]);
        let inner = numel_of(&first.shape[d..]);
        let parts = tensors
            .iter()
            .map(|t| t.values())
            .collect::<Result<Vec<Vec<f64>>>>()?;
        let mut out = buffer(checked_numel(&[outer, inner, parts.len()])?)?;
        for o in 0..outer {
            for part in &parts {
                out.extend_from_slice(&part[o * inner..(o + 1) * inner]);
            }
        }
        let mut shape = first.shape.clone();
        shape.insert(d, tensors.len());
        Ok(Tensor::from_values(out, shape, dtype))
    }

    pub fn split(&self, split_size: i64, dim: i64) -> Result<Vec<Tensor>> {
        if self.dim() == 0 {
            return Err(EngineError::Argument(
                "split() cannot be applied to a 0-dim tensor".to_string(),
            ));
        }
        let d = wrap_dim(dim, self.dim())?;
        let size = self.shape[d] as i64;
        if split_size <= 0 && size > 0 {
            return Err(EngineError::Argument(format!(
                "split_size must be positive, got {split_size}"
            )));
        }
        if size == 0 {
            return Ok(vec![self.shallow_clone()]);
        }
        let mut out = Vec::new();
        let mut start = 0;
        while start < size {
            let len = split_size.min(size - start);
            out.push(self.narrow(d as i64, start, len)?);
            start += len;
        }
        Ok(out)
    }

    /// The `k` largest (or smallest) entries along `dim` with their indices.
    /// Results always come back sorted.
    pub fn topk(&self, k: i64, dim: i64, largest: bool, _sorted: bool) -> Result<(Tensor, Tensor)> {
        let d = wrap_dim(dim, self.dim())?;
        let (outer, size, inner) = if self.dim() == 0 { (1, 1, 1) } else { self.lanes(d) };
        if k < 0 || k as usize > size {
            return Err(EngineError::Argument(format!(
                "selected index k out of range: k = {k}, size = {size}"
            )));
        }
        let k = k as usize;
        let values = self.values()?;
        let len = checked_numel(&[outer, k, inner])?;
        let mut top = filled(len, |_| 0.0)?;
        let mut picked = filled(len, |_| 0.0)?;
        let mut order: Vec<usize> = buffer(size)?;
        for o in 0..outer {
            for i in 0..inner {
                let at = |j: usize| values[(o * size + j) * inner + i];
                order.clear();
                order.extend(0..size);
                // NaN sorts above every number, as in torch.
                order.sort_by(|&x, &y| {
                    let ord = at(x)
                        .partial_cmp(&at(y))
                        .unwrap_or_else(|| at(x).is_nan().cmp(&at(y).is_nan()));
                    if largest {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                for (rank, &j) in order[..k].iter().enumerate() {
                    let slot = (o * k + rank) * inner + i;
                    top[slot] = at(j);
                    picked[slot] = j as f64;
                }
            }
        }
        let mut shape = self.shape.clone();
        if let Some(extent) = shape.get_mut(d) {
            *extent = k;
        }
        Ok((
            Tensor::from_values(top, shape.clone(), self.dtype),
            Tensor::from_values(picked, shape, DType::Long),
        ))
    }

    /// Gathers the slices of `dim` named by the 1-D integer tensor `index`.
    pub fn index_select(&self, dim: i64, index: &Tensor) -> Result<Tensor> {
        if !matches!(index.dtype, DType::Long | DType::Int) {
            return Err(EngineError::Argument(format!(
                "index_select(): expected dtype int32 or int64 for index, got {}",
                index.dtype
            )));
        }
        if index.dim() > 1 {
            return Err(EngineError::Shape(format!(
                "index_select(): index should have at most one dimension, got {:?}",
                index.shape
            )));
        }
        if self.dim() == 0 {
            return Err(EngineError::Argument(
                "index_select() cannot be applied to a 0-dim tensor".to_string(),
            ));
        }
        let d = wrap_dim(dim, self.dim())?;
        let (outer, size, inner) = self.lanes(d);
        let picks = index.values()?;
        let mut rows = buffer(picks.len())?;
        for &p in &picks {
            let p = p as i64;
            if p < 0 || p >= size as i64 {
                return Err(EngineError::Index { index: p, dim: d, size });
            }
            rows.push(p as usize);
        }
        let values = self.values()?;
        let mut out = buffer(checked_numel(&[outer, rows.len(), inner])?)?;
        for o in 0..outer {
            for &row in &rows {
                let start = (o * size + row) * inner;
                out.extend_from_slice(&values[start..start + inner]);
            }
        }
        let mut shape = self.shape.clone();
        shape[d] = rows.len();
        Ok(Tensor::from_values(out, shape, self.dtype))
    }

    // Comparison

    pub fn equal(&self, other: &Tensor) -> Result<bool> {
        Ok(self.shape == other.shape && self.values()? == other.values()?)
    }

    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64, equal_nan: bool) -> Result<bool> {
        let shape = broadcast_shape(&self.shape, &other.shape)?;
        let a = self.expand(&shape)?.values()?;
        let b = other.expand(&shape)?.values()?;
        Ok(a.iter().zip(&b).all(|(&x, &y)| {
            if x.is_nan() || y.is_nan() {
                return equal_nan && x.is_nan() && y.is_nan();
            }
            x == y || (x - y).abs() <= atol + rtol * y.abs()
        }))
    }

    // Losses

    fn reduce(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
        reduction: Reduction,
        count: usize,
    ) -> Tensor {
        match reduction {
            Reduction::None => Tensor::from_values(values, shape, dtype),
            Reduction::Sum => Tensor::from_values(vec![values.iter().sum()], vec![], dtype),
            Reduction::Mean => {
                let total: f64 = values.iter().sum();
                Tensor::from_values(vec![total / count as f64], vec![], dtype)
            }
        }
    }

    pub fn mse_loss(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        let dtype = self.dtype.promote(target.dtype).to_floating();
        let diff = self.zip_map(target, DType::Double, |x, y| (x - y) * (x - y))?;
        let count = diff.numel();
        Ok(Tensor::reduce(diff.values()?, diff.shape, dtype, reduction, count))
    }

    /// `self` holds log-probabilities `[N, C]`; `target` holds class indices `[N]`.
    pub fn nll_loss(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        if target.dtype != DType::Long {
            return Err(EngineError::Argument(format!(
                "nll_loss expects int64 targets, got {}",
                target.dtype
            )));
        }
        let (n, c) = match (self.dim(), target.dim()) {
            (2, 1) if self.shape[0] == target.shape[0] => (self.shape[0], self.shape[1]),
            (1, 0) => (1, self.shape[0]),
            _ => {
                return Err(EngineError::Shape(format!(
                    "nll_loss expects input [N, C] and target [N], got {:?} and {:?}",
                    self.shape, target.shape
                )))
            }
        };
        let input = self.values()?;
        let classes = target.values()?;
        let mut losses = Vec::with_capacity(n);
        let mut counted = 0;
        for (row, &class) in classes.iter().enumerate() {
            let class = class as i64;
            if class == IGNORE_INDEX {
                losses.push(0.0);
                continue;
            }
            if class < 0 || class >= c as i64 {
                return Err(EngineError::Index {
                    index: class,
                    dim: 1,
                    size: c,
                });
            }
            counted += 1;
            losses.push(-input[row * c + class as usize]);
        }
        Ok(Tensor::reduce(
            losses,
            target.shape.clone(),
            self.dtype.to_floating(),
            reduction,
            counted,
        ))
    }

    /// `log_softmax` over the class dimension followed by `nll_loss`.
    pub fn cross_entropy(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        let class_dim = if self.dim() == 1 { 0 } else { 1 };
        self.log_softmax(class_dim)?.nll_loss(target, reduction)
    }

    /// `self` holds probabilities in `[0, 1]`; `target` has the same shape.
    /// Log terms are clamped at -100.
    pub fn binary_cross_entropy(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        if self.shape != target.shape {
            return Err(EngineError::Shape(format!(
                "target size {:?} is different from the input size {:?}",
                target.shape, self.shape
            )));
        }
        let input = self.values()?;
        if input.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(EngineError::Argument(
                "all elements of input should be between 0 and 1".to_string(),
            ));
        }
        let labels = target.values()?;
        let mut losses = buffer(input.len())?;
        losses.extend(input.iter().zip(&labels).map(|(&p, &y)| {
            -(y * p.ln().max(-100.0) + (1.0 - y) * (1.0 - p).ln().max(-100.0))
        }));
        let count = losses.len();
        let dtype = self.dtype.promote(target.dtype).to_floating();
        Ok(Tensor::reduce(losses, self.shape.clone(), dtype, reduction, count))
    }

    // In-place initialisation

    pub fn fill_(&mut self, value: f64) -> Result<()> {
        let values = filled(self.numel(), |_| value)?;
        self.write_values(&values)
    }

    pub fn zero_(&mut self) -> Result<()> {
        self.fill_(0.0)
    }

    pub fn uniform_(&mut self, low: f64, high: f64) -> Result<()> {
        require_floating(self.dtype, "uniform_")?;
        if low > high {
            return Err(EngineError::Argument(format!(
                "uniform_ expects low <= high, got [{low}, {high})"
            )));
        }
        let mut values = buffer(self.numel())?;
        {
            let mut rng = RNG.lock().unwrap_or_else(PoisonError::into_inner);
            values.extend((0..self.numel()).map(|_| low + (high - low) * rng.gen::<f64>()));
        }
        self.write_values(&values)
    }

    pub fn normal_(&mut self, mean: f64, std: f64) -> Result<()> {
        require_floating(self.dtype, "normal_")?;
        if std < 0.0 {
            return Err(EngineError::Argument(format!(
                "normal_ expects std >= 0.0, got {std}"
            )));
        }
        let mut values = buffer(self.numel())?;
        {
            let mut rng = RNG.lock().unwrap_or_else(PoisonError::into_inner);
            values.extend((0..self.numel()).map(|_| Tensor::draw_normal(&mut *rng, mean, std)));
        }
        self.write_values(&values)
    }

    // Persistence

    /// `CTRF` magic, little-endian format version, SHA-256 of the payload,
    /// then the bincode payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let record = Record {
            dtype: self.dtype.code(),
            shape: self.shape.iter().map(|&d| d as u64).collect(),
            requires_grad: self.requires_grad,
            data: self.to_bytes()?,
        };
        let payload = bincode::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        let digest = Sha256::digest(&payload);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Tensor> {
        if bytes.len() < HEADER_LEN {
            return Err(EngineError::Codec(format!(
                "buffer of {} bytes is shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        if &bytes[..4] != MAGIC {
            return Err(EngineError::Codec("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(EngineError::Codec(format!(
                "unsupported format version {version}"
            )));
        }
        let payload = &bytes[HEADER_LEN..];
        if Sha256::digest(payload).as_slice() != &bytes[6..HEADER_LEN] {
            return Err(EngineError::Codec("payload digest mismatch".to_string()));
        }
        let (record, used): (Record, usize) =
            bincode::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| EngineError::Codec(e.to_string()))?;
        if used != payload.len() {
            return Err(EngineError::Codec("trailing bytes after record".to_string()));
        }
        let shape: Vec<i64> = record.shape.iter().map(|&d| d as i64).collect();
        let mut t = Tensor::from_data(&record.data, &shape, DType::from_code(record.dtype)?)?;
        t.requires_grad = record.requires_grad;
        Ok(t)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.encode()?).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Tensor> {
        let bytes = fs::read(path).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Tensor::decode(&bytes)
    }
}

fn render(values: &[f64], shape: &[usize], dtype: DType, indent: usize, out: &mut String) {
    if shape.is_empty() {
        let v = values[0];
        let s = match dtype {
            DType::Bool => (if v != 0.0 { "True" } else { "False" }).to_string(),
            d if d.is_floating() => format!("{v:.4}"),
            _ => format!("{}", v as i64),
        };
        out.push_str(&s);
        return;
    }
    out.push('[');
    let step = numel_of(&shape[1..]);
    for i in 0..shape[0] {
        if i > 0 {
            out.push(',');
            if shape.len() > 1 {
                out.push('\n');
                out.push_str(&" ".repeat(indent + 1));
            } else {
                out.push(' ');
            }
        }
        render(&values[i * step..(i + 1) * step], &shape[1..], dtype, indent + 1, out);
    }
    out.push(']');
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values().map_err(|_| fmt::Error)?;
        let mut body = String::new();
        render(&values, &self.shape, self.dtype, 7, &mut body);
        write!(f, "tensor({body}")?;
        if !matches!(self.dtype, DType::Float | DType::Long | DType::Bool) {
            write!(f, ", dtype={}", self.dtype)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: &[f32], shape: &[i64]) -> Tensor {
        Tensor::from_f32s(values, shape).unwrap()
    }

    fn floats(t: &Tensor) -> Vec<f64> {
        t.values().unwrap()
    }

    #[test]
    fn negative_dimension_is_rejected() {
        let err = Tensor::zeros(&[2, -1], DType::Float, Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("negative dimension"), "{err}");
    }

    #[test]
    fn element_counts_are_checked_before_allocating() {
        let err = Tensor::zeros(&[1 << 40, 1 << 40], DType::Float, Device::Cpu).unwrap_err();
        assert!(matches!(err, EngineError::Shape(_)), "{err}");
        assert!(matches!(buffer::<f64>(usize::MAX), Err(EngineError::OutOfMemory(_))));
        assert!(t(&[1.0], &[1]).view(&[1 << 62, 1 << 62, -1]).is_err());
    }

    #[test]
    fn cuda_and_complex_are_unsupported() {
        assert!(Tensor::zeros(&[2], DType::Float, Device::Cuda(0)).is_err());
        assert!(Tensor::zeros(&[2], DType::ComplexFloat, Device::Cpu).is_err());
    }

    #[test]
    fn broadcasting_add_with_alpha() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&[10.0, 20.0], &[2]);
        let c = a.add(&b, 0.5).unwrap();
        assert_eq!(c.size(), vec![2, 2]);
        assert_eq!(floats(&c), vec![6.0, 12.0, 8.0, 14.0]);
    }

    #[test]
    fn transpose_is_a_view_sharing_storage() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let mut tr = a.transpose(0, 1).unwrap();
        assert_eq!(floats(&tr), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(tr.view(&[6]).is_err());
        assert_eq!(tr.reshape(&[6]).unwrap().size(), vec![6]);
        tr.fill_(0.0).unwrap();
        assert_eq!(floats(&a), vec![0.0; 6]);
    }

    #[test]
    fn integer_mean_is_an_error_and_sum_widens() {
        let a = Tensor::arange(0.0, 4.0, 1.0, DType::Int, Device::Cpu).unwrap();
        assert!(a.mean().is_err());
        let s = a.sum().unwrap();
        assert_eq!(s.dtype(), DType::Long);
        assert_eq!(s.item_i64().unwrap(), 6);
    }

    #[test]
    fn reductions_and_argmax_along_dims() {
        let a = t(&[1.0, 5.0, 3.0, 7.0, 2.0, 0.0], &[2, 3]);
        assert_eq!(floats(&a.sum_dim(1, false).unwrap()), vec![9.0, 9.0]);
        assert_eq!(a.sum_dim(0, true).unwrap().size(), vec![1, 3]);
        assert_eq!(floats(&a.argmax(Some(1), false).unwrap()), vec![1.0, 0.0]);
        assert_eq!(a.argmin(None, false).unwrap().item_i64().unwrap(), 5);
    }

    #[test]
    fn log_softmax_rows_exponentiate_to_one() {
        let a = t(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3]);
        let ls = floats(&a.log_softmax(-1).unwrap());
        for row in ls.chunks(3) {
            let total: f64 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn stack_and_split() {
        let a = t(&[1.0, 2.0], &[2]);
        let b = t(&[3.0, 4.0], &[2]);
        let s = Tensor::stack(&[&a, &b], 1).unwrap();
        assert_eq!(s.size(), vec![2, 2]);
        assert_eq!(floats(&s), vec![1.0, 3.0, 2.0, 4.0]);
        let parts = Tensor::arange(0.0, 5.0, 1.0, DType::Float, Device::Cpu)
            .unwrap()
            .split(2, 0)
            .unwrap();
        let sizes: Vec<i64> = parts.iter().map(|p| p.size()[0]).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(floats(&parts[2]), vec![4.0]);
    }

    #[test]
    fn losses_follow_reduction() {
        let input = t(&[1.0, 2.0], &[2]);
        let target = t(&[0.0, 0.0], &[2]);
        assert_eq!(input.mse_loss(&target, Reduction::Mean).unwrap().item_f64().unwrap(), 2.5);
        assert_eq!(input.mse_loss(&target, Reduction::Sum).unwrap().item_f64().unwrap(), 5.0);

        let logp = t(&[-0.5, -1.0, -2.0, -0.25], &[2, 2]);
        let classes = Tensor::from_i64s(&[1, 0], &[2]).unwrap();
        let loss = logp.nll_loss(&classes, Reduction::Mean).unwrap();
        assert_eq!(loss.item_f64().unwrap(), 1.5);
        let bad = Tensor::from_i64s(&[2, 0], &[2]).unwrap();
        assert!(logp.nll_loss(&bad, Reduction::Sum).is_err());
    }

    #[test]
    fn topk_and_index_select() {
        let a = t(&[1.0, 5.0, 3.0, 7.0, 2.0, 0.0], &[2, 3]);
        let (values, indices) = a.topk(2, 1, true, true).unwrap();
        assert_eq!(values.size(), vec![2, 2]);
        assert_eq!(floats(&values), vec![5.0, 3.0, 7.0, 2.0]);
        assert_eq!(floats(&indices), vec![1.0, 2.0, 0.0, 1.0]);
        assert_eq!(indices.dtype(), DType::Long);

        let (low, at) = a.topk(1, 0, false, true).unwrap();
        assert_eq!(floats(&low), vec![1.0, 2.0, 0.0]);
        assert_eq!(floats(&at), vec![0.0, 1.0, 1.0]);
        assert!(a.topk(4, 1, true, true).is_err());

        let picked = a.index_select(1, &Tensor::from_i64s(&[2, 0], &[2]).unwrap()).unwrap();
        assert_eq!(picked.size(), vec![2, 2]);
        assert_eq!(floats(&picked), vec![3.0, 1.0, 0.0, 7.0]);
        assert!(a.index_select(1, &Tensor::from_i64s(&[3], &[1]).unwrap()).is_err());
        assert!(a.index_select(0, &t(&[0.0], &[1])).is_err());
    }

    #[test]
    fn classification_losses() {
        let logits = t(&[0.0, 0.0, 0.0, 0.0], &[2, 2]);
        let classes = Tensor::from_i64s(&[0, 1], &[2]).unwrap();
        let ce = logits.cross_entropy(&classes, Reduction::Mean).unwrap();
        assert!((ce.item_f64().unwrap() - 2f64.ln()).abs() < 1e-6);

        let probs = t(&[0.5, 1.0], &[2]);
        let labels = t(&[1.0, 1.0], &[2]);
        let bce = probs.binary_cross_entropy(&labels, Reduction::Sum).unwrap();
        assert!((bce.item_f64().unwrap() - 2f64.ln()).abs() < 1e-6);
        let clamped = t(&[1.0], &[1]).binary_cross_entropy(&t(&[0.0], &[1]), Reduction::Sum);
        assert_eq!(clamped.unwrap().item_f64().unwrap(), 100.0);
        assert!(t(&[1.5], &[1]).binary_cross_entropy(&t(&[1.0], &[1]), Reduction::Mean).is_err());
        assert!(probs.binary_cross_entropy(&t(&[1.0], &[1]), Reduction::Mean).is_err());
    }

    #[test]
    fn modules_need_libtorch() {
        let err = Module::load(Path::new("model.pt"), Device::Cpu).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)), "{err}");
    }

    #[test]
    fn half_precision_rounds_on_write() {
        let a = Tensor::full(&[1], 1.0 / 3.0, DType::Half, Device::Cpu).unwrap();
        let v = a.item_f64().unwrap();
        assert_ne!(v, 1.0 / 3.0);
        assert!((v - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn codec_rejects_tampering() {
        let a = t(&[1.0, 2.0, 3.0], &[3]);
        let mut bytes = a.encode().unwrap();
        assert!(Tensor::decode(&bytes).unwrap().equal(&a).unwrap());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Tensor::decode(&bytes).is_err());
        assert!(Tensor::decode(b"CTRF").is_err());
    }

    #[test]
    fn display_matches_torch_layout() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(a.to_string(), "tensor([[1.0000, 2.0000],\n        [3.0000, 4.0000]])");
        let b = Tensor::from_i64s(&[3], &[]).unwrap();
        assert_eq!(b.to_string(), "tensor(3)");
    }

    #[test]
    fn sampling_requires_floating_dtype() {
        assert!(Tensor::randn(&[2], DType::Long, Device::Cpu).is_err());
        assert!(Tensor::rand(&[2], DType::Int, Device::Cpu).is_err());
    }
}
