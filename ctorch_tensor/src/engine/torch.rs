//! LibTorch engine. Every call goes through the fallible `f_*` variants so
//! that C++ exceptions surface as `EngineError::Native`.

use std::fmt;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tch::{Kind, TchError};

use super::{DType, Device, EngineError, Reduction, Result, Value};

impl From<TchError> for EngineError {
    fn from(err: TchError) -> Self {
        EngineError::Native(err.to_string())
    }
}

fn kind_of(dtype: DType) -> Kind {
    match dtype {
        DType::Byte => Kind::Uint8,
        DType::Char => Kind::Int8,
        DType::Short => Kind::Int16,
        DType::Int => Kind::Int,
        DType::Long => Kind::Int64,
        DType::Half => Kind::Half,
        DType::Float => Kind::Float,
        DType::Double => Kind::Double,
        DType::ComplexHalf => Kind::ComplexHalf,
        DType::ComplexFloat => Kind::ComplexFloat,
        DType::ComplexDouble => Kind::ComplexDouble,
        DType::Bool => Kind::Bool,
        DType::QInt8 => Kind::QInt8,
        DType::QUInt8 => Kind::QUInt8,
        DType::QInt32 => Kind::QInt32,
        DType::BFloat16 => Kind::BFloat16,
    }
}

fn device_of(device: Device) -> tch::Device {
    match device {
        Device::Cpu => tch::Device::Cpu,
        Device::Cuda(idx) => tch::Device::Cuda(idx),
    }
}

fn reduction_of(reduction: Reduction) -> tch::Reduction {
    match reduction {
        Reduction::None => tch::Reduction::None,
        Reduction::Mean => tch::Reduction::Mean,
        Reduction::Sum => tch::Reduction::Sum,
    }
}

fn options(dtype: DType, device: Device) -> (Kind, tch::Device) {
    (kind_of(dtype), device_of(device))
}

pub fn manual_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}

pub fn set_num_threads(n: i32) -> Result<()> {
    if n <= 0 {
        return Err(EngineError::Argument(format!(
            "number of threads must be positive, got {n}"
        )));
    }
    tch::set_num_threads(n);
    Ok(())
}

pub fn num_threads() -> i32 {
    tch::get_num_threads()
}

pub fn cuda_is_available() -> bool {
    tch::Cuda::is_available()
}

pub fn cudnn_is_available() -> bool {
    tch::Cuda::cudnn_is_available()
}

pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    tch::no_grad(f)
}

#[derive(Debug)]
pub struct Tensor(tch::Tensor);

/// A TorchScript module loaded with `torch::jit::load`.
pub struct Module(tch::CModule);

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Module")
    }
}

impl Module {
    pub fn load(path: &Path, device: Device) -> Result<Module> {
        Ok(Module(tch::CModule::load_on_device(path, device_of(device))?))
    }

    pub fn forward(&self, inputs: &[&Tensor]) -> Result<Value> {
        let inputs: Vec<tch::IValue> = inputs
            .iter()
            .map(|t| tch::IValue::Tensor(t.0.shallow_clone()))
            .collect();
        Ok(value_of(self.0.forward_is(&inputs)?))
    }
}

fn value_of(value: tch::IValue) -> Value {
    match value {
        tch::IValue::Tensor(t) => Value::Tensor(Tensor(t)),
        tch::IValue::Tuple(items) => Value::Tuple(items.into_iter().map(value_of).collect()),
        other => {
            let text = format!("{other:?}");
            let kind = text.split(['(', ' ', '{']).next().unwrap_or("Object");
            Value::Other(kind.to_string())
        }
    }
}

impl Tensor {
    // Construction

    pub fn full(shape: &[i64], value: f64, dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_full(shape, value, options(dtype, device))?))
    }

    pub fn zeros(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_zeros(shape, options(dtype, device))?))
    }

    pub fn ones(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_ones(shape, options(dtype, device))?))
    }

    pub fn empty(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_empty(shape, options(dtype, device))?))
    }

    pub fn randn(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_randn(shape, options(dtype, device))?))
    }

    pub fn rand(shape: &[i64], dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_rand(shape, options(dtype, device))?))
    }

    pub fn eye(n: i64, m: i64, dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_eye_m(n, m, options(dtype, device))?))
    }

    pub fn arange(start: f64, end: f64, step: f64, dtype: DType, device: Device) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_arange_start_step(
            start,
            end,
            step,
            options(dtype, device),
        )?))
    }

    pub fn linspace(
        start: f64,
        end: f64,
        steps: i64,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_linspace(
            start,
            end,
            steps,
            options(dtype, device),
        )?))
    }

    pub fn logspace(
        start: f64,
        end: f64,
        steps: i64,
        base: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_logspace(
            start,
            end,
            steps,
            base,
            options(dtype, device),
        )?))
    }

    pub fn from_data(bytes: &[u8], shape: &[i64], dtype: DType) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_from_data_size(bytes, shape, kind_of(dtype))?))
    }

    pub fn from_f32s(values: &[f32], shape: &[i64]) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_from_slice(values)?.f_view(shape)?))
    }

    pub fn from_i64s(values: &[i64], shape: &[i64]) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::f_from_slice(values)?.f_view(shape)?))
    }

    pub fn zeros_like(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_zeros_like()?))
    }

    // Queries

    pub fn dim(&self) -> usize {
        self.0.dim()
    }

    pub fn size(&self) -> Vec<i64> {
        self.0.size()
    }

    pub fn dtype(&self) -> DType {
        DType::from_code(self.0.kind().c_int()).unwrap_or(DType::Float)
    }

    pub fn numel(&self) -> usize {
        self.0.numel()
    }

    pub fn device(&self) -> Device {
        match self.0.device() {
            tch::Device::Cuda(idx) => Device::Cuda(idx),
            _ => Device::Cpu,
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad()
    }

    pub fn item_f64(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(EngineError::Argument(format!(
                "a Tensor with {} elements cannot be converted to Scalar",
                self.numel()
            )));
        }
        Ok(self.0.f_reshape([-1])?.f_double_value(&[0])?)
    }

    pub fn item_i64(&self) -> Result<i64> {
        if self.numel() != 1 {
            return Err(EngineError::Argument(format!(
                "a Tensor with {} elements cannot be converted to Scalar",
                self.numel()
            )));
        }
        Ok(self.0.f_reshape([-1])?.f_int64_value(&[0])?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let host = self
            .0
            .f_to_device_(tch::Device::Cpu, self.0.kind(), false, false)?
            .f_contiguous()?;
        let numel = host.numel();
        let len = numel.saturating_mul(self.dtype().elem_size());
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| EngineError::OutOfMemory(len))?;
        out.resize(len, 0u8);
        host.f_copy_data_u8(&mut out, numel)?;
        Ok(out)
    }

    // Conversion and aliasing

    pub fn shallow_clone(&self) -> Tensor {
        Tensor(self.0.shallow_clone())
    }

    pub fn detach(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_detach()?))
    }

    pub fn deep_clone(&self) -> Result<Tensor> {
        let mut out = self.0.f_empty_like()?;
        out.f_copy_(&self.0)?;
        Ok(Tensor(out))
    }

    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        Ok(Tensor(self.0.f_to_kind(kind_of(dtype))?))
    }

    pub fn to(&self, device: Device, dtype: DType) -> Result<Tensor> {
        Ok(Tensor(self.0.f_to_device_(
            device_of(device),
            kind_of(dtype),
            false,
            false,
        )?))
    }

    pub fn copy_to(&self, device: Device) -> Result<Tensor> {
        Ok(Tensor(self.0.f_to_device_(
            device_of(device),
            self.0.kind(),
            false,
            true,
        )?))
    }

    pub fn pin_memory(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_pin_memory(None)?))
    }

    pub fn set_data(&mut self, other: &Tensor) -> Result<()> {
        Ok(self.0.f_set_data(&other.0)?)
    }

    pub fn select(&self, dim: i64, index: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_select(dim, index)?))
    }

    pub fn index(&self, indices: &[i64]) -> Result<Tensor> {
        let mut t = self.0.shallow_clone();
        for &i in indices {
            t = t.f_select(0, i)?;
        }
        Ok(Tensor(t))
    }

    // Autograd

    pub fn set_requires_grad(&mut self, requires_grad: bool) -> Result<()> {
        self.0.f_requires_grad_(requires_grad)?;
        Ok(())
    }

    /// `tch` has no fallible backward, so a C++ exception arrives as a panic.
    pub fn backward(&self) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| self.0.backward())).map_err(|payload| {
            let msg = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "backward failed".to_string());
            EngineError::Native(msg)
        })
    }

    pub fn grad(&self) -> Option<Tensor> {
        let grad = self.0.grad();
        if grad.defined() {
            Some(Tensor(grad))
        } else {
            None
        }
    }

    pub fn zero_grad(&mut self) -> Result<()> {
        self.0.zero_grad();
        Ok(())
    }

    // Elementwise

    pub fn add(&self, other: &Tensor, alpha: f64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_add(&other.0.f_mul_scalar(alpha)?)?))
    }

    pub fn sub(&self, other: &Tensor, alpha: f64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_sub(&other.0.f_mul_scalar(alpha)?)?))
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_mul(&other.0)?))
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_div(&other.0)?))
    }

    pub fn add_(&mut self, other: &Tensor, alpha: f64) -> Result<()> {
        self.0.f_add_(&other.0.f_mul_scalar(alpha)?)?;
        Ok(())
    }

    pub fn sub_(&mut self, other: &Tensor, alpha: f64) -> Result<()> {
        self.0.f_sub_(&other.0.f_mul_scalar(alpha)?)?;
        Ok(())
    }

    pub fn mul_(&mut self, other: &Tensor) -> Result<()> {
        self.0.f_mul_(&other.0)?;
        Ok(())
    }

    pub fn div_(&mut self, other: &Tensor) -> Result<()> {
        self.0.f_div_(&other.0)?;
        Ok(())
    }

    pub fn add_scalar(&self, value: f64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_add_scalar(value)?))
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_mul_scalar(value)?))
    }

    pub fn eq_tensor(&self, other: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_eq_tensor(&other.0)?))
    }

    pub fn relu(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_relu()?))
    }

    pub fn leaky_relu(&self, slope: f64) -> Result<Tensor> {
        let pos = self.0.f_clamp_min(0.0)?;
        let neg = self.0.f_clamp_max(0.0)?.f_mul_scalar(slope)?;
        Ok(Tensor(pos.f_add(&neg)?))
    }

    pub fn tanh(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_tanh()?))
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_sigmoid()?))
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_sqrt()?))
    }

    pub fn log_softmax(&self, dim: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_log_softmax(dim, None::<Kind>)?))
    }

    pub fn mm(&self, other: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_mm(&other.0)?))
    }

    // Reductions

    pub fn sum(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_sum(None::<Kind>)?))
    }

    pub fn mean(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_mean(None::<Kind>)?))
    }

    pub fn sum_dim(&self, dim: i64, keepdim: bool) -> Result<Tensor> {
        Ok(Tensor(self.0.f_sum_dim_intlist(
            [dim].as_slice(),
            keepdim,
            None::<Kind>,
        )?))
    }

    pub fn argmax(&self, dim: Option<i64>, keepdim: bool) -> Result<Tensor> {
        Ok(Tensor(self.0.f_argmax(dim, keepdim)?))
    }

    pub fn argmin(&self, dim: Option<i64>, keepdim: bool) -> Result<Tensor> {
        Ok(Tensor(self.0.f_argmin(dim, keepdim)?))
    }

    // Shape

    pub fn squeeze(&self) -> Result<Tensor> {
        Ok(Tensor(self.0.f_squeeze()?))
    }

    pub fn squeeze_dim(&self, dim: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_squeeze_dim(dim)?))
    }

    pub fn unsqueeze(&self, dim: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_unsqueeze(dim)?))
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_transpose(dim0, dim1)?))
    }

    pub fn permute(&self, dims: &[i64]) -> Result<Tensor> {
        Ok(Tensor(self.0.f_permute(dims)?))
    }

    pub fn view(&self, shape: &[i64]) -> Result<Tensor> {
        Ok(Tensor(self.0.f_view(shape)?))
    }

    pub fn reshape(&self, shape: &[i64]) -> Result<Tensor> {
        Ok(Tensor(self.0.f_reshape(shape)?))
    }

    pub fn flatten(&self, start_dim: i64, end_dim: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_flatten(start_dim, end_dim)?))
    }

    pub fn narrow(&self, dim: i64, start: i64, length: i64) -> Result<Tensor> {
        Ok(Tensor(self.0.f_narrow(dim, start, length)?))
    }

    pub fn expand_as(&self, other: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_expand_as(&other.0)?))
    }

    pub fn stack(tensors: &[&Tensor], dim: i64) -> Result<Tensor> {
        let inner: Vec<&tch::Tensor> = tensors.iter().map(|t| &t.0).collect();
        Ok(Tensor(tch::Tensor::f_stack(&inner, dim)?))
    }

    pub fn split(&self, split_size: i64, dim: i64) -> Result<Vec<Tensor>> {
        Ok(self
            .0
            .f_split(split_size, dim)?
            .into_iter()
            .map(Tensor)
            .collect())
    }

    pub fn topk(&self, k: i64, dim: i64, largest: bool, sorted: bool) -> Result<(Tensor, Tensor)> {
        let (values, indices) = self.0.f_topk(k, dim, largest, sorted)?;
        Ok((Tensor(values), Tensor(indices)))
    }

    pub fn index_select(&self, dim: i64, index: &Tensor) -> Result<Tensor> {
        Ok(Tensor(self.0.f_index_select(dim, &index.0)?))
    }

    // Comparison

    pub fn equal(&self, other: &Tensor) -> Result<bool> {
        Ok(self.0.f_equal(&other.0)?)
    }

    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64, equal_nan: bool) -> Result<bool> {
        Ok(self.0.f_allclose(&other.0, rtol, atol, equal_nan)?)
    }

    // Losses

    pub fn mse_loss(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        Ok(Tensor(self.0.f_mse_loss(&target.0, reduction_of(reduction))?))
    }

    pub fn nll_loss(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        Ok(Tensor(self.0.f_nll_loss(
            &target.0,
            None::<tch::Tensor>,
            reduction_of(reduction),
            -100,
        )?))
    }

    pub fn cross_entropy(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        Ok(Tensor(self.0.f_cross_entropy_loss(
            &target.0,
            None::<tch::Tensor>,
            reduction_of(reduction),
            -100,
            0.0,
        )?))
    }

    pub fn binary_cross_entropy(&self, target: &Tensor, reduction: Reduction) -> Result<Tensor> {
        Ok(Tensor(self.0.f_binary_cross_entropy(
            &target.0,
            None::<tch::Tensor>,
            reduction_of(reduction),
        )?))
    }

    // In-place initialisation

    pub fn fill_(&mut self, value: f64) -> Result<()> {
        self.0.f_fill_(value)?;
        Ok(())
    }

    pub fn zero_(&mut self) -> Result<()> {
        self.0.f_zero_()?;
        Ok(())
    }

    pub fn uniform_(&mut self, low: f64, high: f64) -> Result<()> {
        self.0.f_uniform_(low, high)?;
        Ok(())
    }

    pub fn normal_(&mut self, mean: f64, std: f64) -> Result<()> {
        self.0.f_normal_(mean, std)?;
        Ok(())
    }

    // Persistence

    /// LibTorch stream format; device tensors are moved to host first.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let host = self
            .0
            .f_to_device_(tch::Device::Cpu, self.0.kind(), false, false)?;
        let mut out = Vec::new();
        host.save_to_stream(&mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::load_from_stream(Cursor::new(bytes))?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        Ok(self.0.save(path)?)
    }

    pub fn load(path: &Path) -> Result<Tensor> {
        Ok(Tensor(tch::Tensor::load(path)?))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
