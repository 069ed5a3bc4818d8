use core::marker::PhantomData;

use burn::config::Config;
use burn::tensor::{backend::Backend, Distribution, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{host_normal, DiffusionScheduler, NoiseSchedule, NoiseScheduleConfig, PredictionType};
use crate::error::Result;

/// Sampling-side configuration, persisted next to exported weights.
#[derive(Config, Debug)]
pub struct DdpmSchedulerConfig {
    pub noise_schedule: NoiseScheduleConfig,
    #[config(default = "PredictionType::Epsilon")]
    pub prediction_type: PredictionType,
    /// Clamp the predicted clean sample to `[-clip_sample_range, clip_sample_range]`.
    #[config(default = true)]
    pub clip_sample: bool,
    #[config(default = 1.0)]
    pub clip_sample_range: f64,
}

impl DdpmSchedulerConfig {
    pub fn init<B: Backend, const D: usize>(&self) -> Result<DdpmScheduler<B, D>> {
        let schedule = self.noise_schedule.init()?;
        Ok(DdpmScheduler::new(schedule, self.prediction_type)
            .with_clip_sample(self.clip_sample.then_some(self.clip_sample_range)))
    }
}

/// Ancestral DDPM sampler with the "fixed small" posterior variance.
pub struct DdpmScheduler<B: Backend, const D: usize> {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    clip_sample: Option<f64>,
    timesteps: Vec<usize>,
    step_ratio: usize,
    step_index: usize,
    generator: Option<StdRng>,
    _b: PhantomData<B>,
}

impl<B: Backend, const D: usize> DdpmScheduler<B, D> {
    pub fn new(schedule: NoiseSchedule, prediction_type: PredictionType) -> Self {
        let steps = schedule.num_train_timesteps();
        let mut s = Self {
            schedule,
            prediction_type,
            clip_sample: Some(1.0),
            timesteps: Vec::new(),
            step_ratio: 1,
            step_index: 0,
            generator: None,
            _b: PhantomData,
        };
        <Self as DiffusionScheduler<B, D>>::set_timesteps(&mut s, steps);
        s
    }

    pub fn with_clip_sample(mut self, range: Option<f64>) -> Self {
        self.clip_sample = range;
        self
    }

    /// Draw the variance noise from a seeded host generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.generator = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn schedule(&self) -> &NoiseSchedule { &self.schedule }
    pub fn prediction_type(&self) -> PredictionType { self.prediction_type }

    /// Initial pure-noise sample, drawn from the seeded generator when present.
    pub fn initial_noise(&mut self, shape: [usize; D], device: &B::Device) -> Tensor<B, D> {
        match self.generator.as_mut() {
            Some(rng) => host_normal(rng, shape, device),
            None => Tensor::random(shape, Distribution::Normal(0.0, 1.0), device),
        }
    }

    fn alpha_bar_or_one(&self, t: i64) -> f64 {
        if t < 0 { 1.0 } else { self.schedule.alphas_cumprod()[t as usize] }
    }
}

impl<B: Backend, const D: usize> DiffusionScheduler<B, D> for DdpmScheduler<B, D> {
    fn timesteps(&self) -> &[usize] { &self.timesteps }

    fn set_timesteps(&mut self, n: usize) {
        let total = self.schedule.num_train_timesteps();
        let n = n.clamp(1, total);
        let ratio = total / n;
        self.step_ratio = ratio;
        self.timesteps = (0..n).rev().map(|i| i * ratio).collect();
        self.step_index = 0;
    }

    fn num_train_timesteps(&self) -> usize { self.schedule.num_train_timesteps() }

    fn reset(&mut self) { self.step_index = 0; }

    fn step_index(&self) -> usize { self.step_index }

    fn step(&mut self, model_output: Tensor<B, D>, timestep: usize, sample: Tensor<B, D>) -> Tensor<B, D> {
        let t = timestep.min(self.schedule.num_train_timesteps() - 1) as i64;
        let prev_t = t - self.step_ratio as i64;

        let alpha_prod_t = self.alpha_bar_or_one(t);
        let alpha_prod_prev = self.alpha_bar_or_one(prev_t);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let mut pred_original = match self.prediction_type {
            PredictionType::Epsilon => (sample.clone() - model_output.mul_scalar(beta_prod_t.sqrt() as f32))
                .div_scalar(alpha_prod_t.sqrt() as f32),
            PredictionType::Sample => model_output,
        };
        if let Some(range) = self.clip_sample {
            pred_original = pred_original.clamp(-range as f32, range as f32);
        }

        let coef_original = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let coef_current = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mut prev_sample = pred_original.mul_scalar(coef_original as f32) + sample.mul_scalar(coef_current as f32);

        if t > 0 {
            let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
            let shape = prev_sample.dims();
            let device = prev_sample.device();
            let noise = match self.generator.as_mut() {
                Some(rng) => host_normal::<B, D, _>(rng, shape, &device),
                None => Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
            };
            prev_sample = prev_sample + noise.mul_scalar(variance.sqrt() as f32);
        }
        self.step_index += 1;
        prev_sample
    }

    fn scale_noise(&self, sample: Tensor<B, D>, timestep: usize, noise: Tensor<B, D>) -> Tensor<B, D> {
        let t = timestep.min(self.schedule.num_train_timesteps() - 1);
        let alpha_bar = self.schedule.alphas_cumprod()[t];
        sample.mul_scalar(alpha_bar.sqrt() as f32) + noise.mul_scalar((1.0 - alpha_bar).sqrt() as f32)
    }
}
