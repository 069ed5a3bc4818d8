use core::fmt;
use core::str::FromStr;

use burn::config::Config;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use super::linspace;
use crate::error::{DdpmError, Result};

/// Law used to lay out the per-step noise variances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas evenly spaced between `beta_start` and `beta_end`.
    #[default]
    Linear,
    /// Square roots of the betas evenly spaced, then squared.
    ScaledLinear,
    /// Cosine schedule of Nichol & Dhariwal, each beta capped at 0.999.
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

impl BetaSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::ScaledLinear => "scaled_linear",
            Self::SquaredCosCapV2 => "squaredcos_cap_v2",
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BetaSchedule {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredCosCapV2),
            other => Err(DdpmError::config(
                "beta_schedule",
                format!("unsupported beta schedule `{other}` (expected linear, scaled_linear or squaredcos_cap_v2)"),
            )),
        }
    }
}

/// Construction parameters for a [`NoiseSchedule`].
#[derive(Config, Debug)]
pub struct NoiseScheduleConfig {
    /// Number of discrete diffusion steps `T`.
    #[config(default = 1000)]
    pub num_train_timesteps: usize,
    #[config(default = 1e-4)]
    pub beta_start: f64,
    #[config(default = 0.02)]
    pub beta_end: f64,
    #[config(default = "BetaSchedule::Linear")]
    pub beta_schedule: BetaSchedule,
}

impl NoiseScheduleConfig {
    /// Build the schedule, rejecting degenerate parameters.
    pub fn init(&self) -> Result<NoiseSchedule> {
        NoiseSchedule::new(self.clone())
    }
}

const COSINE_MAX_BETA: f64 = 0.999;

/// Precomputed variance schedule over `T` discrete diffusion steps.
///
/// Immutable once built. `alphas_cumprod` is strictly decreasing in `t` and
/// lies in `(0, 1]`.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let steps = config.num_train_timesteps;
        if steps == 0 {
            return Err(DdpmError::config("num_train_timesteps", "must be at least 1"));
        }
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => {
                check_beta_range(config.beta_start, config.beta_end)?;
                linspace(config.beta_start, config.beta_end, steps)
            }
            BetaSchedule::ScaledLinear => {
                check_beta_range(config.beta_start, config.beta_end)?;
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), steps)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => cosine_betas(steps),
        };
        Ok(Self::from_betas(betas))
    }

    fn from_betas(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut acc = 1.0;
        for a in &alphas {
            acc *= a;
            alphas_cumprod.push(acc);
        }
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        Self {
            betas,
            alphas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        }
    }

    pub fn num_train_timesteps(&self) -> usize { self.betas.len() }
    pub fn betas(&self) -> &[f64] { &self.betas }
    pub fn alphas(&self) -> &[f64] { &self.alphas }
    pub fn alphas_cumprod(&self) -> &[f64] { &self.alphas_cumprod }

    /// Fails when `t` is outside `[0, T)`.
    pub fn check_timestep(&self, t: usize) -> Result<()> {
        if t < self.num_train_timesteps() {
            Ok(())
        } else {
            Err(DdpmError::Tensor(format!(
                "timestep {t} out of range [0, {})",
                self.num_train_timesteps()
            )))
        }
    }

    /// Cumulative signal retention `alpha_bar_t`.
    pub fn alpha_bar(&self, t: usize) -> Result<f64> {
        self.check_timestep(t)?;
        Ok(self.alphas_cumprod[t])
    }

    /// Signal-to-noise ratio `alpha_bar_t / (1 - alpha_bar_t)`.
    pub fn snr(&self, t: usize) -> Result<f64> {
        let ab = self.alpha_bar(t)?;
        Ok(ab / (1.0 - ab))
    }

    /// Gather `values[t_i]` for every batch element and reshape to
    /// `[batch, 1, .., 1]` so it broadcasts against a rank-`D` batch.
    pub fn extract<B: Backend, const D: usize>(
        &self,
        values: &[f64],
        timesteps: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let mut gathered = Vec::with_capacity(timesteps.len());
        for &t in timesteps {
            self.check_timestep(t)?;
            gathered.push(values[t] as f32);
        }
        let mut shape = [1usize; D];
        shape[0] = timesteps.len();
        Ok(Tensor::<B, 1>::from_floats(gathered.as_slice(), device).reshape(shape))
    }

    pub fn sqrt_alpha_bar<B: Backend, const D: usize>(
        &self,
        timesteps: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        self.extract(&self.sqrt_alphas_cumprod, timesteps, device)
    }

    pub fn sqrt_one_minus_alpha_bar<B: Backend, const D: usize>(
        &self,
        timesteps: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        self.extract(&self.sqrt_one_minus_alphas_cumprod, timesteps, device)
    }

    /// Per-sample SNR weights, broadcastable over a rank-`D` batch.
    pub fn snr_weights<B: Backend, const D: usize>(
        &self,
        timesteps: &[usize],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let snr: Vec<f64> = self.alphas_cumprod.iter().map(|ab| ab / (1.0 - ab)).collect();
        self.extract(&snr, timesteps, device)
    }
}

fn check_beta_range(start: f64, end: f64) -> Result<()> {
    if !(start > 0.0 && start <= end && end < 1.0) {
        return Err(DdpmError::config(
            "beta_start/beta_end",
            format!("expected 0 < beta_start <= beta_end < 1, got {start} and {end}"),
        ));
    }
    Ok(())
}

fn cosine_betas(steps: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * core::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..steps)
        .map(|i| {
            let t1 = i as f64 / steps as f64;
            let t2 = (i + 1) as f64 / steps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(COSINE_MAX_BETA)
        })
        .collect()
}
