use core::fmt;
use core::str::FromStr;

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use super::NoiseSchedule;
use crate::error::{DdpmError, Result};

/// What the denoiser is trained to output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The injected noise.
    #[default]
    Epsilon,
    /// The clean sample `x_0`.
    Sample,
}

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Epsilon => "epsilon",
            Self::Sample => "sample",
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionType {
    type Err = DdpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "sample" => Ok(Self::Sample),
            other => Err(DdpmError::config(
                "prediction_type",
                format!("unsupported prediction type `{other}` (expected epsilon or sample)"),
            )),
        }
    }
}

/// Training loss for one batch.
///
/// * `Epsilon`: mean squared error between `prediction` and `noise`.
/// * `Sample`: squared error against `clean`, each element weighted by the
///   SNR of its sample's timestep, then averaged over every element. The
///   weights are not renormalized, so the loss scale follows the sampled SNRs.
pub fn diffusion_loss<B: Backend, const D: usize>(
    prediction: Tensor<B, D>,
    clean: Tensor<B, D>,
    noise: Tensor<B, D>,
    timesteps: &[usize],
    schedule: &NoiseSchedule,
    prediction_type: PredictionType,
) -> Result<Tensor<B, 1>> {
    match prediction_type {
        PredictionType::Epsilon => {
            check_same_shape(&prediction, &noise)?;
            Ok(MseLoss::new().forward(prediction, noise, Reduction::Mean))
        }
        PredictionType::Sample => {
            check_same_shape(&prediction, &clean)?;
            let weights = schedule.snr_weights::<B, D>(timesteps, &prediction.device())?;
            Ok(weighted_mse(prediction, clean, weights))
        }
    }
}

/// `mean(weights * (prediction - target)^2)` with `weights` broadcast over the batch.
pub fn weighted_mse<B: Backend, const D: usize>(
    prediction: Tensor<B, D>,
    target: Tensor<B, D>,
    weights: Tensor<B, D>,
) -> Tensor<B, 1> {
    let squared = (prediction - target).powf_scalar(2.0);
    (squared * weights).mean()
}

fn check_same_shape<B: Backend, const D: usize>(a: &Tensor<B, D>, b: &Tensor<B, D>) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(DdpmError::Tensor(format!(
            "prediction shape {:?} does not match target shape {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}
