use core::fmt;
use core::str::FromStr;

use burn::config::Config;
use burn::optim::AdamWConfig;
use serde::{Deserialize, Serialize};

use super::LrSchedulerKind;
use crate::diffusion::{DdpmSchedulerConfig, NoiseScheduleConfig, PredictionType};
use crate::ema::EmaConfig;
use crate::error::{DdpmError, Result};
use crate::model::UNet2DConfig;

/// Numeric precision of the training compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixedPrecision {
    #[default]
    No,
    Fp16,
    Bf16,
}

impl fmt::Display for MixedPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::No => "no",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        })
    }
}

impl FromStr for MixedPrecision {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(Self::No),
            "fp16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            other => Err(DdpmError::config(
                "mixed_precision",
                format!("unsupported mixed precision `{other}` (expected no, fp16 or bf16)"),
            )),
        }
    }
}

/// Everything a training run needs besides the data and the device.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: UNet2DConfig,
    pub noise_schedule: NoiseScheduleConfig,
    pub optimizer: AdamWConfig,
    /// Run directory: checkpoints, exported pipeline and logs live below it.
    pub output_dir: String,
    #[config(default = "EmaConfig::new()")]
    pub ema: EmaConfig,
    #[config(default = false)]
    pub use_ema: bool,
    #[config(default = 64)]
    pub resolution: usize,
    #[config(default = 16)]
    pub train_batch_size: usize,
    #[config(default = 16)]
    pub eval_batch_size: usize,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 10)]
    pub save_images_epochs: usize,
    #[config(default = 10)]
    pub save_model_epochs: usize,
    #[config(default = 1)]
    pub gradient_accumulation_steps: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = "LrSchedulerKind::Cosine")]
    pub lr_scheduler: LrSchedulerKind,
    #[config(default = 500)]
    pub lr_warmup_steps: usize,
    /// Global gradient-norm clipping threshold.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    #[config(default = "PredictionType::Epsilon")]
    pub prediction_type: PredictionType,
    #[config(default = 1000)]
    pub ddpm_num_inference_steps: usize,
    #[config(default = 500)]
    pub checkpointing_steps: usize,
    #[config(default = "None")]
    pub checkpoints_total_limit: Option<usize>,
    /// `"latest"`, a checkpoint directory name or a path whose last component is one.
    #[config(default = "None")]
    pub resume_from_checkpoint: Option<String>,
    #[config(default = "MixedPrecision::No")]
    pub mixed_precision: MixedPrecision,
    /// Seed shared by the backend RNG, data order and timestep sampling.
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Reject inconsistent settings before any work is done.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("train_batch_size", self.train_batch_size),
            ("eval_batch_size", self.eval_batch_size),
            ("num_epochs", self.num_epochs),
            ("save_images_epochs", self.save_images_epochs),
            ("save_model_epochs", self.save_model_epochs),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("checkpointing_steps", self.checkpointing_steps),
            ("ddpm_num_inference_steps", self.ddpm_num_inference_steps),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(DdpmError::config(field, "must be at least 1"));
            }
        }
        if self.checkpoints_total_limit == Some(0) {
            return Err(DdpmError::config("checkpoints_total_limit", "must be at least 1 when set"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(DdpmError::config("learning_rate", format!("must be positive, got {}", self.learning_rate)));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(DdpmError::config("max_grad_norm", format!("must be positive, got {}", self.max_grad_norm)));
        }
        if self.ddpm_num_inference_steps > self.noise_schedule.num_train_timesteps {
            return Err(DdpmError::config(
                "ddpm_num_inference_steps",
                format!(
                    "{} exceeds the {} training timesteps",
                    self.ddpm_num_inference_steps, self.noise_schedule.num_train_timesteps
                ),
            ));
        }
        if self.model.sample_size != self.resolution {
            return Err(DdpmError::config(
                "resolution",
                format!("{} does not match the model sample size {}", self.resolution, self.model.sample_size),
            ));
        }
        self.model.validate()?;
        self.noise_schedule.init()?;
        if self.use_ema {
            self.ema.validate()?;
        }
        Ok(())
    }

    /// Sampler configuration exported alongside the weights.
    pub fn scheduler_config(&self) -> DdpmSchedulerConfig {
        DdpmSchedulerConfig::new(self.noise_schedule.clone()).with_prediction_type(self.prediction_type)
    }
}
