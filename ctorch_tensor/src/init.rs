//! Parameter initialisers in the manner of `torch.nn.init`, plus the global seed.

use std::fmt;
use std::str::FromStr;

use libc::c_char;

use crate::engine::{self, fan_in_and_fan_out};
use crate::error::{cstr_to_str, ffi_guard, write_out, BridgeError, Result, Status};
use crate::handle::{borrow, borrow_mut, TensorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanMode {
    FanIn,
    FanOut,
}

impl FromStr for FanMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fan_in" => Ok(FanMode::FanIn),
            "fan_out" => Ok(FanMode::FanOut),
            other => Err(BridgeError::Invalid(format!("unknown fan mode '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nonlinearity {
    Linear,
    Conv1d,
    Conv2d,
    Conv3d,
    ConvTranspose1d,
    ConvTranspose2d,
    ConvTranspose3d,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
}

impl Nonlinearity {
    /// Recommended gain; `param` is the negative slope for `leaky_relu`.
    pub fn gain(self, param: f64) -> f64 {
        match self {
            Nonlinearity::Tanh => 5.0 / 3.0,
            Nonlinearity::Relu => 2f64.sqrt(),
            Nonlinearity::LeakyRelu => (2.0 / (1.0 + param * param)).sqrt(),
            _ => 1.0,
        }
    }
}

impl FromStr for Nonlinearity {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "linear" => Nonlinearity::Linear,
            "conv1d" => Nonlinearity::Conv1d,
            "conv2d" => Nonlinearity::Conv2d,
            "conv3d" => Nonlinearity::Conv3d,
            "conv_transpose1d" => Nonlinearity::ConvTranspose1d,
            "conv_transpose2d" => Nonlinearity::ConvTranspose2d,
            "conv_transpose3d" => Nonlinearity::ConvTranspose3d,
            "sigmoid" => Nonlinearity::Sigmoid,
            "tanh" => Nonlinearity::Tanh,
            "relu" => Nonlinearity::Relu,
            "leaky_relu" => Nonlinearity::LeakyRelu,
            other => {
                return Err(BridgeError::Invalid(format!("unknown nonlinearity '{other}'")))
            }
        })
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FanMode::FanIn => "fan_in",
            FanMode::FanOut => "fan_out",
        })
    }
}

/// Bound of the uniform distribution used by `kaiming_uniform_`.
pub fn kaiming_bound(
    shape: &[i64],
    a: f64,
    mode: FanMode,
    nonlinearity: Nonlinearity,
) -> Result<f64> {
    let (fan_in, fan_out) = fan_in_and_fan_out(shape)?;
    let fan = match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    };
    if fan <= 0 {
        return Err(BridgeError::Invalid(format!("{mode} is zero for shape {shape:?}")));
    }
    let std = nonlinearity.gain(a) / (fan as f64).sqrt();
    Ok(3f64.sqrt() * std)
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_init_zeros_(t: TensorHandle) -> Status {
    ffi_guard("ct_init_zeros_", || {
        let t = borrow_mut(t)?;
        engine::no_grad(|| t.zero_())?;
        Ok(())
    })
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_init_ones_(t: TensorHandle) -> Status {
    ffi_guard("ct_init_ones_", || {
        let t = borrow_mut(t)?;
        engine::no_grad(|| t.fill_(1.0))?;
        Ok(())
    })
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_init_uniform_(t: TensorHandle, low: f64, high: f64) -> Status {
    ffi_guard("ct_init_uniform_", || {
        let t = borrow_mut(t)?;
        engine::no_grad(|| t.uniform_(low, high))?;
        Ok(())
    })
}

/// # Safety
/// `t` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_init_normal_(t: TensorHandle, mean: f64, std: f64) -> Status {
    ffi_guard("ct_init_normal_", || {
        let t = borrow_mut(t)?;
        engine::no_grad(|| t.normal_(mean, std))?;
        Ok(())
    })
}

/// He initialisation. `mode` is `fan_in` or `fan_out`; `nonlinearity` names
/// the activation that follows (`leaky_relu` uses `a` as its slope).
///
/// # Safety
/// `t` must be live; the tags must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn ct_init_kaiming_uniform_(
    t: TensorHandle,
    a: f64,
    mode: *const c_char,
    nonlinearity: *const c_char,
) -> Status {
    ffi_guard("ct_init_kaiming_uniform_", || {
        let mode: FanMode = cstr_to_str(mode, "mode")?.parse()?;
        let nonlinearity: Nonlinearity = cstr_to_str(nonlinearity, "nonlinearity")?.parse()?;
        let tensor = borrow_mut(t)?;
        if tensor.numel() == 0 {
            tracing::warn!("kaiming_uniform_ on a zero-element tensor is a no-op");
            return Ok(());
        }
        let bound = kaiming_bound(&tensor.size(), a, mode, nonlinearity)?;
        engine::no_grad(|| tensor.uniform_(-bound, bound))?;
        Ok(())
    })
}

/// # Safety
/// `t` must be live; both outs writable.
#[no_mangle]
pub unsafe extern "C" fn ct_calculate_fan_in_and_fan_out(
    t: TensorHandle,
    fan_in: *mut i64,
    fan_out: *mut i64,
) -> Status {
    ffi_guard("ct_calculate_fan_in_and_fan_out", || {
        let (i, o) = fan_in_and_fan_out(&borrow(t)?.size())?;
        write_out(fan_in, i, "fan_in")?;
        write_out(fan_out, o, "fan_out")
    })
}

#[no_mangle]
pub extern "C" fn ct_manual_seed(seed: u64) -> Status {
    ffi_guard("ct_manual_seed", || {
        engine::manual_seed(seed);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_closed() {
        assert_eq!("fan_out".parse::<FanMode>().unwrap(), FanMode::FanOut);
        assert!("fan_avg".parse::<FanMode>().is_err());
        assert_eq!(
            "conv_transpose2d".parse::<Nonlinearity>().unwrap(),
            Nonlinearity::ConvTranspose2d
        );
        assert!("gelu".parse::<Nonlinearity>().is_err());
    }

    #[test]
    fn gains_match_torch() {
        assert_eq!(Nonlinearity::Linear.gain(0.0), 1.0);
        assert!((Nonlinearity::Relu.gain(0.0) - 2f64.sqrt()).abs() < 1e-12);
        assert!((Nonlinearity::Tanh.gain(0.0) - 5.0 / 3.0).abs() < 1e-12);
        let leaky = Nonlinearity::LeakyRelu.gain(5f64.sqrt());
        assert!((leaky - (1.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn linear_layer_bound() {
        // nn.Linear(20, 10): kaiming_uniform_(a=sqrt(5)) gives 1/sqrt(fan_in).
        let bound =
            kaiming_bound(&[10, 20], 5f64.sqrt(), FanMode::FanIn, Nonlinearity::LeakyRelu).unwrap();
        assert!((bound - 1.0 / 20f64.sqrt()).abs() < 1e-12);
        assert!(kaiming_bound(&[4], 0.0, FanMode::FanIn, Nonlinearity::Relu).is_err());
    }
}
