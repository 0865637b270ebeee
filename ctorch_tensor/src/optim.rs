//! SGD and Adam, following the LibTorch update rules, written against the
//! engine tensor API. Parameters are held as shallow clones so updates land in
//! the caller's tensors.

use crate::engine::{self, Tensor};
use crate::error::{ffi_guard, slice_in, BridgeError, Result, Status};
use crate::handle::{borrow, borrow_mut, write_handle, OptimizerHandle, TensorHandle};

const ADAM_EPS: f64 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SgdOptions {
    pub lr: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamOptions {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Rule {
    Sgd(SgdOptions),
    Adam(AdamOptions),
}

#[derive(Debug)]
enum Slot {
    Empty,
    Momentum(Tensor),
    Adam {
        step: i32,
        exp_avg: Tensor,
        exp_avg_sq: Tensor,
    },
}

#[derive(Debug)]
pub struct Optimizer {
    rule: Rule,
    params: Vec<Tensor>,
    slots: Vec<Slot>,
}

fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(BridgeError::Invalid(msg()))
    }
}

impl Optimizer {
    pub fn sgd(opts: SgdOptions) -> Result<Self> {
        check(opts.lr >= 0.0, || format!("invalid learning rate: {}", opts.lr))?;
        check(opts.momentum >= 0.0, || format!("invalid momentum value: {}", opts.momentum))?;
        check(opts.weight_decay >= 0.0, || {
            format!("invalid weight_decay value: {}", opts.weight_decay)
        })?;
        check(
            !opts.nesterov || (opts.momentum > 0.0 && opts.dampening == 0.0),
            || "nesterov momentum requires a momentum and zero dampening".to_string(),
        )?;
        Ok(Self::with_rule(Rule::Sgd(opts)))
    }

    pub fn adam(opts: AdamOptions) -> Result<Self> {
        check(opts.lr >= 0.0, || format!("invalid learning rate: {}", opts.lr))?;
        check(opts.eps >= 0.0, || format!("invalid epsilon value: {}", opts.eps))?;
        check((0.0..1.0).contains(&opts.beta1), || {
            format!("invalid beta parameter at index 0: {}", opts.beta1)
        })?;
        check((0.0..1.0).contains(&opts.beta2), || {
            format!("invalid beta parameter at index 1: {}", opts.beta2)
        })?;
        check(opts.weight_decay >= 0.0, || {
            format!("invalid weight_decay value: {}", opts.weight_decay)
        })?;
        Ok(Self::with_rule(Rule::Adam(opts)))
    }

    fn with_rule(rule: Rule) -> Self {
        Self {
            rule,
            params: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn rule(&self) -> Rule {
        self.rule
    }

    pub fn lr(&self) -> f64 {
        match self.rule {
            Rule::Sgd(o) => o.lr,
            Rule::Adam(o) => o.lr,
        }
    }

    pub fn set_lr(&mut self, lr: f64) -> Result<()> {
        check(lr >= 0.0, || format!("invalid learning rate: {lr}"))?;
        match &mut self.rule {
            Rule::Sgd(o) => o.lr = lr,
            Rule::Adam(o) => o.lr = lr,
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn add_parameters<I>(&mut self, params: I)
    where
        I: IntoIterator<Item = Tensor>,
    {
        for p in params {
            self.params.push(p);
            self.slots.push(Slot::Empty);
        }
    }

    pub fn zero_grad(&mut self) -> Result<()> {
        for p in &mut self.params {
            p.zero_grad()?;
        }
        Ok(())
    }

    /// Applies one update; returns how many parameters had a gradient.
    pub fn step(&mut self) -> Result<usize> {
        let mut updated = 0;
        for i in 0..self.params.len() {
            if let Some(grad) = self.params[i].grad() {
                engine::no_grad(|| self.update(i, &grad))?;
                updated += 1;
            }
        }
        tracing::debug!(updated, total = self.params.len(), lr = self.lr(), "optimizer step");
        Ok(updated)
    }

    pub(crate) fn update(&mut self, index: usize, grad: &Tensor) -> Result<()> {
        let param = self
            .params
            .get_mut(index)
            .ok_or_else(|| BridgeError::Invalid(format!("no parameter at index {index}")))?;
        let slot = &mut self.slots[index];
        match self.rule {
            Rule::Sgd(o) => sgd_update(&o, param, slot, grad),
            Rule::Adam(o) => adam_update(&o, param, slot, grad),
        }
    }
}

fn sgd_update(o: &SgdOptions, param: &mut Tensor, slot: &mut Slot, grad: &Tensor) -> Result<()> {
    let mut d_p = if o.weight_decay != 0.0 {
        grad.add(param, o.weight_decay)?
    } else {
        grad.shallow_clone()
    };
    if o.momentum != 0.0 {
        let buf = match slot {
            Slot::Momentum(buf) => {
                let next = buf.mul_scalar(o.momentum)?.add(&d_p, 1.0 - o.dampening)?;
                *buf = next;
                buf.shallow_clone()
            }
            _ => {
                let buf = d_p.detach()?.deep_clone()?;
                *slot = Slot::Momentum(buf.shallow_clone());
                buf
            }
        };
        d_p = if o.nesterov { d_p.add(&buf, o.momentum)? } else { buf };
    }
    param.sub_(&d_p, o.lr)?;
    Ok(())
}

fn adam_update(o: &AdamOptions, param: &mut Tensor, slot: &mut Slot, grad: &Tensor) -> Result<()> {
    let grad = if o.weight_decay != 0.0 {
        grad.add(param, o.weight_decay)?
    } else {
        grad.shallow_clone()
    };
    if !matches!(slot, Slot::Adam { .. }) {
        *slot = Slot::Adam {
            step: 0,
            exp_avg: param.zeros_like()?,
            exp_avg_sq: param.zeros_like()?,
        };
    }
    let Slot::Adam { step, exp_avg, exp_avg_sq } = slot else {
        return Err(BridgeError::Invalid("adam state missing".to_string()));
    };
    *step += 1;
    *exp_avg = exp_avg.mul_scalar(o.beta1)?.add(&grad, 1.0 - o.beta1)?;
    *exp_avg_sq = exp_avg_sq
        .mul_scalar(o.beta2)?
        .add(&grad.mul(&grad)?, 1.0 - o.beta2)?;

    let bias_correction1 = 1.0 - o.beta1.powi(*step);
    let bias_correction2 = 1.0 - o.beta2.powi(*step);
    let denom = exp_avg_sq
        .sqrt()?
        .mul_scalar(1.0 / bias_correction2.sqrt())?
        .add_scalar(o.eps)?;
    param.sub_(&exp_avg.div(&denom)?, o.lr / bias_correction1)?;
    Ok(())
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_sgd(
    lr: f64,
    momentum: f64,
    dampening: f64,
    weight_decay: f64,
    nesterov: bool,
    out: *mut OptimizerHandle,
) -> Status {
    ffi_guard("ct_optimizer_sgd", || {
        let opt = Optimizer::sgd(SgdOptions {
            lr,
            momentum,
            dampening,
            weight_decay,
            nesterov,
        })?;
        write_handle(out, opt)
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_adam(
    lr: f64,
    beta1: f64,
    beta2: f64,
    weight_decay: f64,
    out: *mut OptimizerHandle,
) -> Status {
    ffi_guard("ct_optimizer_adam", || {
        let opt = Optimizer::adam(AdamOptions {
            lr,
            beta1,
            beta2,
            eps: ADAM_EPS,
            weight_decay,
        })?;
        write_handle(out, opt)
    })
}

/// Registers `n` tensors. The optimizer keeps its own reference; the caller
/// still closes its handles.
///
/// # Safety
/// `opt` must be live; `params` must hold `n` live tensor handles.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_add_parameters(
    opt: OptimizerHandle,
    params: *const TensorHandle,
    n: usize,
) -> Status {
    ffi_guard("ct_optimizer_add_parameters", || {
        let tensors = slice_in(params, n, "params")?
            .iter()
            .map(|&h| borrow(h).map(Tensor::shallow_clone))
            .collect::<Result<Vec<_>>>()?;
        borrow_mut(opt)?.add_parameters(tensors);
        Ok(())
    })
}

/// # Safety
/// `opt` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_zero_grad(opt: OptimizerHandle) -> Status {
    ffi_guard("ct_optimizer_zero_grad", || borrow_mut(opt)?.zero_grad())
}

/// # Safety
/// `opt` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_step(opt: OptimizerHandle) -> Status {
    ffi_guard("ct_optimizer_step", || borrow_mut(opt)?.step().map(|_| ()))
}

/// # Safety
/// `opt` must be live.
#[no_mangle]
pub unsafe extern "C" fn ct_optimizer_set_lr(opt: OptimizerHandle, lr: f64) -> Status {
    ffi_guard("ct_optimizer_set_lr", || borrow_mut(opt)?.set_lr(lr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(values: &[f32]) -> Tensor {
        Tensor::from_f32s(values, &[values.len() as i64]).unwrap()
    }

    fn assert_close(t: &Tensor, expected: &[f32]) {
        let want = param(expected);
        assert!(t.allclose(&want, 1e-5, 1e-6, false).unwrap(), "{t} != {want}");
    }

    fn sgd(lr: f64, momentum: f64) -> Optimizer {
        Optimizer::sgd(SgdOptions {
            lr,
            momentum,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        })
        .unwrap()
    }

    #[test]
    fn sgd_updates_through_shared_storage() {
        let p = param(&[1.0, 2.0]);
        let mut opt = sgd(0.1, 0.0);
        opt.add_parameters([p.shallow_clone()]);
        opt.update(0, &param(&[0.5, -0.5])).unwrap();
        assert_close(&p, &[0.95, 2.05]);
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let p = param(&[1.0]);
        let mut opt = sgd(0.1, 0.9);
        opt.add_parameters([p.shallow_clone()]);
        let g = param(&[0.5]);
        opt.update(0, &g).unwrap();
        opt.update(0, &g).unwrap();
        assert_close(&p, &[0.855]);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let p = param(&[1.0, -1.0]);
        let mut opt = Optimizer::adam(AdamOptions {
            lr: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: ADAM_EPS,
            weight_decay: 0.0,
        })
        .unwrap();
        opt.add_parameters([p.shallow_clone()]);
        opt.update(0, &param(&[3.0, -0.25])).unwrap();
        assert_close(&p, &[0.9, -0.9]);
    }

    #[test]
    fn options_are_validated() {
        assert!(Optimizer::sgd(SgdOptions {
            lr: 0.1,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: true,
        })
        .is_err());
        let mut opt = sgd(0.1, 0.0);
        assert!(opt.set_lr(-1.0).is_err());
        opt.set_lr(0.5).unwrap();
        assert_eq!(opt.lr(), 0.5);
    }

    #[test]
    fn step_skips_parameters_without_gradients() {
        let mut opt = sgd(0.1, 0.0);
        opt.add_parameters([param(&[1.0])]);
        opt.zero_grad().unwrap();
        assert_eq!(opt.step().unwrap(), 0);
    }
}
