use core::f64::consts::PI;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DdpmError, Result};

/// Shape of the learning-rate curve, all with linear warmup except `Constant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    Linear,
    #[default]
    Cosine,
    CosineWithRestarts,
    Polynomial,
    Constant,
    ConstantWithWarmup,
}

impl LrSchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Cosine => "cosine",
            Self::CosineWithRestarts => "cosine_with_restarts",
            Self::Polynomial => "polynomial",
            Self::Constant => "constant",
            Self::ConstantWithWarmup => "constant_with_warmup",
        }
    }
}

impl fmt::Display for LrSchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LrSchedulerKind {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "linear" => Self::Linear,
            "cosine" => Self::Cosine,
            "cosine_with_restarts" => Self::CosineWithRestarts,
            "polynomial" => Self::Polynomial,
            "constant" => Self::Constant,
            "constant_with_warmup" => Self::ConstantWithWarmup,
            other => {
                return Err(DdpmError::config(
                    "lr_scheduler",
                    format!(
                        "unsupported scheduler `{other}` (expected linear, cosine, cosine_with_restarts, \
                         polynomial, constant or constant_with_warmup)"
                    ),
                ))
            }
        })
    }
}

const POLYNOMIAL_LR_END: f64 = 1e-7;
const POLYNOMIAL_POWER: f64 = 1.0;

/// Learning rate as a function of the optimization step.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    kind: LrSchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LrSchedule {
    pub fn new(kind: LrSchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn current_step(&self) -> usize { self.current_step }

    pub fn set_current_step(&mut self, step: usize) { self.current_step = step; }

    /// Learning rate for the next optimizer step.
    pub fn lr(&self) -> f64 { self.lr_at(self.current_step) }

    pub fn step(&mut self) { self.current_step += 1; }

    pub fn lr_at(&self, step: usize) -> f64 {
        match self.kind {
            LrSchedulerKind::Polynomial => self.polynomial(step),
            _ => self.base_lr * self.factor(step),
        }
    }

    /// Multiplier applied to the base rate.
    pub fn factor(&self, step: usize) -> f64 {
        if self.kind == LrSchedulerKind::Constant {
            return 1.0;
        }
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = (step - self.warmup_steps) as f64 / decay_steps;
        match self.kind {
            LrSchedulerKind::Constant | LrSchedulerKind::ConstantWithWarmup => 1.0,
            LrSchedulerKind::Linear => (self.total_steps.saturating_sub(step) as f64 / decay_steps).max(0.0),
            LrSchedulerKind::Cosine => (0.5 * (1.0 + (PI * progress).cos())).max(0.0),
            LrSchedulerKind::CosineWithRestarts => {
                if progress >= 1.0 {
                    0.0
                } else {
                    (0.5 * (1.0 + (PI * (progress % 1.0)).cos())).max(0.0)
                }
            }
            LrSchedulerKind::Polynomial => self.polynomial(step) / self.base_lr,
        }
    }

    fn polynomial(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        if step > self.total_steps {
            return POLYNOMIAL_LR_END;
        }
        let range = self.base_lr - POLYNOMIAL_LR_END;
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let remaining = 1.0 - (step - self.warmup_steps) as f64 / decay_steps;
        range * remaining.powf(POLYNOMIAL_POWER) + POLYNOMIAL_LR_END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_is_linear_from_zero() {
        let s = LrSchedule::new(LrSchedulerKind::Cosine, 1e-4, 10, 100);
        assert_eq!(s.lr_at(0), 0.0);
        assert!(close(s.lr_at(5), 5e-5));
        assert!(close(s.lr_at(10), 1e-4));
    }

    #[test]
    fn cosine_reaches_zero_at_end() {
        let s = LrSchedule::new(LrSchedulerKind::Cosine, 1.0, 0, 100);
        assert!(close(s.lr_at(50), 0.5));
        assert!(s.lr_at(100) < 1e-12);
    }

    #[test]
    fn linear_decays_to_zero() {
        let s = LrSchedule::new(LrSchedulerKind::Linear, 1.0, 10, 110);
        assert!(close(s.lr_at(60), 0.5));
        assert_eq!(s.lr_at(200), 0.0);
    }

    #[test]
    fn constant_ignores_warmup() {
        let s = LrSchedule::new(LrSchedulerKind::Constant, 2.0, 10, 100);
        assert_eq!(s.lr_at(0), 2.0);
    }

    #[test]
    fn polynomial_ends_at_floor() {
        let s = LrSchedule::new(LrSchedulerKind::Polynomial, 1e-3, 0, 10);
        assert!(close(s.lr_at(10), POLYNOMIAL_LR_END));
        assert!(close(s.lr_at(50), POLYNOMIAL_LR_END));
    }

    #[test]
    fn step_advances_the_curve() {
        let mut s = LrSchedule::new(LrSchedulerKind::ConstantWithWarmup, 1.0, 4, 10);
        s.step();
        s.step();
        assert!(close(s.lr(), 0.5));
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("warmup_cosine".parse::<LrSchedulerKind>().is_err());
    }
}
