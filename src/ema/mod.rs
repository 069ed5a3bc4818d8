//! Exponential moving average of model parameters.
//!
//! The shadow copy lives outside the module, keyed by [`ParamId`], so the
//! trained weights are never touched except through the explicit
//! store / copy-to / restore protocol (or the [`EmaSwap`] guard that wraps it).

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use burn::config::Config;
use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::tensor::{backend::Backend, Tensor};

use crate::error::{DdpmError, Result};

/// Decay law of the moving average.
#[derive(Config, Debug)]
pub struct EmaConfig {
    #[config(default = 0.9999)]
    pub max_decay: f64,
    #[config(default = 0.0)]
    pub min_decay: f64,
    #[config(default = 1.0)]
    pub inv_gamma: f64,
    #[config(default = 0.75)]
    pub power: f64,
    /// Ramp the decay up from zero instead of using `max_decay` from the start.
    #[config(default = true)]
    pub use_warmup: bool,
    /// Optimization steps during which the shadow simply tracks the weights.
    #[config(default = 0)]
    pub update_after_step: usize,
}

impl EmaConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_decay) || !(0.0..=self.max_decay).contains(&self.min_decay) {
            return Err(DdpmError::config(
                "ema_max_decay/ema_min_decay",
                format!("expected 0 <= min <= max <= 1, got {} and {}", self.min_decay, self.max_decay),
            ));
        }
        if self.inv_gamma <= 0.0 || self.power <= 0.0 {
            return Err(DdpmError::config(
                "ema_inv_gamma/ema_power",
                format!("must be positive, got {} and {}", self.inv_gamma, self.power),
            ));
        }
        Ok(())
    }

    /// Decay applied at the given (1-based) optimization step.
    ///
    /// Zero on the first update, then `1 - (1 + s / inv_gamma)^-power` during
    /// warmup, clamped to `[min_decay, max_decay]`.
    pub fn decay(&self, optimization_step: usize) -> f64 {
        let step = optimization_step as i64 - self.update_after_step as i64 - 1;
        if step <= 0 {
            return 0.0;
        }
        let decay = if self.use_warmup {
            1.0 - (1.0 + step as f64 / self.inv_gamma).powf(-self.power)
        } else {
            self.max_decay
        };
        decay.min(self.max_decay).max(self.min_decay)
    }
}

type Shadow<B> = HashMap<ParamId, Tensor<B, 1>>;

/// Shadow weights tracking a module's float parameters.
#[derive(Debug)]
pub struct ExponentialMovingAverage<B: Backend> {
    config: EmaConfig,
    shadow: Shadow<B>,
    stored: Option<Shadow<B>>,
    optimization_step: usize,
    decay: f64,
}

impl<B: Backend> ExponentialMovingAverage<B> {
    /// Start the average from the module's current weights.
    pub fn new<M: Module<B>>(config: EmaConfig, module: &M) -> Self {
        Self {
            config,
            shadow: collect(module),
            stored: None,
            optimization_step: 0,
            decay: 0.0,
        }
    }

    /// Number of updates applied so far.
    pub fn optimization_step(&self) -> usize { self.optimization_step }

    /// Decay used by the most recent update.
    pub fn decay(&self) -> f64 { self.decay }

    pub fn num_params(&self) -> usize { self.shadow.len() }

    /// `shadow <- decay * shadow + (1 - decay) * param` for every float parameter.
    pub fn step<M: Module<B>>(&mut self, module: &M) {
        self.optimization_step += 1;
        self.decay = self.config.decay(self.optimization_step);
        let mut update = Update {
            shadow: &mut self.shadow,
            decay: self.decay,
        };
        module.visit(&mut update);
    }

    /// Snapshot the module's live weights so they can be restored later.
    pub fn store<M: Module<B>>(&mut self, module: &M) {
        self.stored = Some(collect(module));
    }

    /// Overwrite the module's weights with the shadow weights.
    ///
    /// Refuses to run unless [`store`](Self::store) has captured the live weights.
    pub fn copy_to<M: Module<B>>(&self, module: &mut M) -> Result<()> {
        if self.stored.is_none() {
            return Err(DdpmError::EmaProtocol("copy_to called without a prior store"));
        }
        assign(module, &self.shadow);
        Ok(())
    }

    /// Put the stored live weights back and forget the snapshot.
    pub fn restore<M: Module<B>>(&mut self, module: &mut M) -> Result<()> {
        let stored = self
            .stored
            .take()
            .ok_or(DdpmError::EmaProtocol("restore called without a prior store"))?;
        assign(module, &stored);
        Ok(())
    }

    /// Store, then swap the shadow weights in for the lifetime of the guard.
    pub fn swap_in<'a, M: Module<B>>(&'a mut self, module: &'a mut M) -> Result<EmaSwap<'a, B, M>> {
        self.store(module);
        self.copy_to(module)?;
        Ok(EmaSwap { ema: self, module })
    }

    /// A copy of `template` carrying the shadow weights.
    pub fn shadow_module<M: Module<B>>(&self, template: &M) -> M {
        template.clone().map(&mut Assign { source: &self.shadow })
    }

    /// Replace the shadow weights with those of `module`, e.g. after loading a checkpoint.
    pub fn load_shadow<M: Module<B>>(&mut self, module: &M) {
        self.shadow = collect(module);
    }

    /// Restore the update counter persisted alongside the shadow weights.
    pub fn set_optimization_step(&mut self, step: usize) {
        self.optimization_step = step;
        self.decay = self.config.decay(step);
    }
}

/// Guard holding a module whose weights were swapped for the EMA shadow.
///
/// The live weights are restored when the guard is dropped, including on
/// early return and unwinding.
pub struct EmaSwap<'a, B: Backend, M: Module<B>> {
    ema: &'a mut ExponentialMovingAverage<B>,
    module: &'a mut M,
}

impl<B: Backend, M: Module<B>> Deref for EmaSwap<'_, B, M> {
    type Target = M;

    fn deref(&self) -> &M { &*self.module }
}

impl<B: Backend, M: Module<B>> DerefMut for EmaSwap<'_, B, M> {
    fn deref_mut(&mut self) -> &mut M { &mut *self.module }
}

impl<B: Backend, M: Module<B>> Drop for EmaSwap<'_, B, M> {
    fn drop(&mut self) {
        if let Err(err) = self.ema.restore(&mut *self.module) {
            tracing::error!("failed to restore live weights after EMA swap: {err}");
        }
    }
}

fn collect<B: Backend, M: Module<B>>(module: &M) -> Shadow<B> {
    let mut out = HashMap::new();
    module.visit(&mut Collect { out: &mut out });
    out
}

fn assign<B: Backend, M: Module<B>>(module: &mut M, source: &Shadow<B>) {
    *module = module.clone().map(&mut Assign { source });
}

fn flatten<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, 1> {
    let numel = tensor.shape().num_elements();
    tensor.reshape([numel])
}

struct Collect<'a, B: Backend> {
    out: &'a mut Shadow<B>,
}

impl<B: Backend> ModuleVisitor<B> for Collect<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.out.insert(param.id, flatten(param.val()));
    }
}

struct Update<'a, B: Backend> {
    shadow: &'a mut Shadow<B>,
    decay: f64,
}

impl<B: Backend> ModuleVisitor<B> for Update<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let current = flatten(param.val());
        let next = match self.shadow.remove(&param.id) {
            Some(shadow) => shadow.mul_scalar(self.decay) + current.mul_scalar(1.0 - self.decay),
            None => current,
        };
        self.shadow.insert(param.id, next);
    }
}

struct Assign<'a, B: Backend> {
    source: &'a Shadow<B>,
}

impl<B: Backend> ModuleMapper<B> for Assign<'_, B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        match self.source.get(&param.id) {
            Some(flat) => {
                let flat = flat.clone();
                param.map(|tensor| {
                    let dims = tensor.dims();
                    flat.reshape(dims)
                })
            }
            None => param,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_has_zero_decay() {
        let cfg = EmaConfig::new();
        assert_eq!(cfg.decay(1), 0.0);
        assert!(cfg.decay(2) > 0.0);
    }

    #[test]
    fn warmup_decay_is_monotone_and_capped() {
        let cfg = EmaConfig::new();
        let mut prev = 0.0;
        for step in 1..250_000 {
            let d = cfg.decay(step);
            assert!(d >= prev, "decay decreased at step {step}");
            assert!(d <= cfg.max_decay);
            prev = d;
        }
        assert_eq!(prev, cfg.max_decay);
    }

    #[test]
    fn without_warmup_decay_is_fixed() {
        let cfg = EmaConfig::new().with_use_warmup(false).with_max_decay(0.9);
        assert_eq!(cfg.decay(1), 0.0);
        assert_eq!(cfg.decay(2), 0.9);
        assert_eq!(cfg.decay(500), 0.9);
    }

    #[test]
    fn update_after_step_delays_averaging() {
        let cfg = EmaConfig::new().with_update_after_step(10);
        assert_eq!(cfg.decay(11), 0.0);
        assert!(cfg.decay(12) > 0.0);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let cfg = EmaConfig::new().with_min_decay(0.5).with_max_decay(0.4);
        assert!(cfg.validate().is_err());
    }
}
