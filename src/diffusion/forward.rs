use burn::tensor::{backend::Backend, Distribution, Int, Tensor};
use rand::Rng;

use super::NoiseSchedule;
use crate::error::{DdpmError, Result};

/// Closed-form forward diffusion:
/// `x_t = sqrt(alpha_bar_t) * x_0 + sqrt(1 - alpha_bar_t) * noise`, per batch element.
pub fn add_noise<B: Backend, const D: usize>(
    schedule: &NoiseSchedule,
    clean: Tensor<B, D>,
    noise: Tensor<B, D>,
    timesteps: &[usize],
) -> Result<Tensor<B, D>> {
    let dims = clean.dims();
    if dims != noise.dims() {
        return Err(DdpmError::Tensor(format!(
            "noise shape {:?} does not match sample shape {:?}",
            noise.dims(),
            dims
        )));
    }
    if dims[0] != timesteps.len() {
        return Err(DdpmError::Tensor(format!(
            "{} timesteps for a batch of {}",
            timesteps.len(),
            dims[0]
        )));
    }
    let device = clean.device();
    let signal = schedule.sqrt_alpha_bar::<B, D>(timesteps, &device)?;
    let sigma = schedule.sqrt_one_minus_alpha_bar::<B, D>(timesteps, &device)?;
    Ok(clean * signal + noise * sigma)
}

/// Standard-normal noise with the shape and device of `like`.
pub fn sample_noise<B: Backend, const D: usize>(like: &Tensor<B, D>) -> Tensor<B, D> {
    Tensor::random_like(like, Distribution::Normal(0.0, 1.0))
}

/// One timestep per batch element, uniform over `[0, T)`.
pub fn sample_timesteps<R: Rng + ?Sized>(rng: &mut R, batch_size: usize, num_train_timesteps: usize) -> Vec<usize> {
    (0..batch_size).map(|_| rng.gen_range(0..num_train_timesteps)).collect()
}

/// Integer timestep tensor fed to the denoiser.
pub fn timesteps_tensor<B: Backend>(timesteps: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i32> = timesteps.iter().map(|&t| t as i32).collect();
    Tensor::from_ints(values.as_slice(), device)
}

/// A clean batch after one forward-diffusion draw.
#[derive(Debug, Clone)]
pub struct NoisedBatch<B: Backend, const D: usize> {
    pub noisy: Tensor<B, D>,
    pub noise: Tensor<B, D>,
    pub timesteps: Vec<usize>,
}

/// Draw fresh noise and timesteps for `clean` and diffuse it.
pub fn noise_batch<B: Backend, const D: usize, R: Rng + ?Sized>(
    schedule: &NoiseSchedule,
    clean: Tensor<B, D>,
    rng: &mut R,
) -> Result<NoisedBatch<B, D>> {
    let noise = sample_noise(&clean);
    let timesteps = sample_timesteps(rng, clean.dims()[0], schedule.num_train_timesteps());
    let noisy = add_noise(schedule, clean, noise.clone(), &timesteps)?;
    Ok(NoisedBatch { noisy, noise, timesteps })
}
