//! The tensor engine the bridge wraps.
//!
//! With the `torch` feature this is LibTorch through `tch`; otherwise a dense
//! CPU reference engine with the same surface. Both export `Tensor`, `Module`,
//! `manual_seed`, `set_num_threads`, `num_threads`, `no_grad` and the
//! CUDA/cuDNN availability checks.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub mod dtype;

#[cfg(not(feature = "torch"))]
mod reference;
#[cfg(not(feature = "torch"))]
pub use reference::{
    cuda_is_available, cudnn_is_available, manual_seed, no_grad, num_threads, set_num_threads,
    Module, Tensor,
};

#[cfg(feature = "torch")]
mod torch;
#[cfg(feature = "torch")]
pub use torch::{
    cuda_is_available, cudnn_is_available, manual_seed, no_grad, num_threads, set_num_threads,
    Module, Tensor,
};

pub use dtype::DType;

/// Name of the compiled engine, as reported by `ct_backend_name`.
#[cfg(feature = "torch")]
pub const ENGINE_NAME: &str = "libtorch";
#[cfg(not(feature = "torch"))]
pub const ENGINE_NAME: &str = "reference";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown dtype code {0}")]
    UnknownDType(i32),

    #[error("invalid shape: {0}")]
    Shape(String),

    #[error("dimension out of range (expected to be in range of [{low}, {high}], but got {dim})")]
    Dim { dim: i64, low: i64, high: i64 },

    #[error("index {index} is out of bounds for dimension {dim} with size {size}")]
    Index { index: i64, dim: usize, size: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("codec: {0}")]
    Codec(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An error raised by LibTorch itself.
    #[error("{0}")]
    Native(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl Device {
    /// Accepts `cpu`, `cuda` and `cuda:N`.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == "cpu" {
            return Ok(Device::Cpu);
        }
        if spec == "cuda" {
            return Ok(Device::Cuda(0));
        }
        if let Some(rest) = spec.strip_prefix("cuda:") {
            let idx: usize = rest
                .parse()
                .map_err(|_| EngineError::Argument(format!("invalid cuda device index '{rest}'")))?;
            return Ok(Device::Cuda(idx));
        }
        Err(EngineError::Argument(format!("unknown device spec '{spec}'")))
    }

    pub fn is_cuda(self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    None,
    Mean,
    Sum,
}

impl FromStr for Reduction {
    type Err = EngineError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "none" => Ok(Reduction::None),
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            other => Err(EngineError::Argument(format!(
                "unknown reduction '{other}' (expected none, mean or sum)"
            ))),
        }
    }
}

/// A value returned by a scripted module's `forward`.
#[derive(Debug)]
pub enum Value {
    Tensor(Tensor),
    Tuple(Vec<Value>),
    /// Anything else, by kind name (`Int`, `Double`, `GenericList`, ...).
    Other(String),
}

impl Value {
    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Value::Tuple(_))
    }

    fn kind(&self) -> &str {
        match self {
            Value::Tensor(_) => "Tensor",
            Value::Tuple(_) => "Tuple",
            Value::Other(kind) => kind,
        }
    }

    /// Copies the value; tensors inside alias the originals.
    pub fn shallow_clone(&self) -> Value {
        match self {
            Value::Tensor(t) => Value::Tensor(t.shallow_clone()),
            Value::Tuple(items) => Value::Tuple(items.iter().map(Value::shallow_clone).collect()),
            Value::Other(kind) => Value::Other(kind.clone()),
        }
    }

    pub fn to_tensor(&self) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t.shallow_clone()),
            other => Err(EngineError::Argument(format!(
                "expected Tensor but got {}",
                other.kind()
            ))),
        }
    }

    pub fn to_tuple(&self) -> Result<Vec<Value>> {
        match self {
            Value::Tuple(items) => Ok(items.iter().map(Value::shallow_clone).collect()),
            other => Err(EngineError::Argument(format!(
                "expected Tuple but got {}",
                other.kind()
            ))),
        }
    }
}

/// Resolves a possibly negative `dim` against a tensor of rank `ndim`.
#[cfg_attr(feature = "torch", allow(dead_code))]
pub(crate) fn wrap_dim(dim: i64, ndim: usize) -> Result<usize> {
    let n = ndim.max(1) as i64;
    if dim < -n || dim >= n {
        return Err(EngineError::Dim {
            dim,
            low: -n,
            high: n - 1,
        });
    }
    Ok(if dim < 0 { (dim + n) as usize } else { dim as usize })
}

/// Rejects negative sizes in a constructor's shape.
#[cfg_attr(feature = "torch", allow(dead_code))]
pub(crate) fn check_shape(shape: &[i64]) -> Result<Vec<usize>> {
    shape
        .iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                EngineError::Shape(format!(
                    "trying to create tensor with negative dimension {d}: {shape:?}"
                ))
            })
        })
        .collect()
}

/// `fan_in`/`fan_out` as torch.nn.init computes them for weights of `shape`.
pub fn fan_in_and_fan_out(shape: &[i64]) -> Result<(i64, i64)> {
    if shape.len() < 2 {
        return Err(EngineError::Argument(
            "fan in and fan out can not be computed for tensor with fewer than 2 dimensions"
                .to_string(),
        ));
    }
    let receptive: i64 = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}
