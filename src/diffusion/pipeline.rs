use burn::tensor::{backend::Backend, Tensor};

use super::{timesteps_tensor, DdpmScheduler, DiffusionScheduler};
use crate::model::Denoiser;

/// A lightweight, reusable diffusion pipeline that drives a scheduler.
pub struct DiffusionPipeline<S> {
    pub scheduler: S,
}

impl<S> DiffusionPipeline<S> {
    pub fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    /// Run with a single model prediction function: `predict(sample, timestep)`.
    pub fn run_single<B: Backend, const D: usize, F>(
        &mut self,
        mut sample: Tensor<B, D>,
        num_steps: usize,
        mut predict: F,
    ) -> Tensor<B, D>
    where
        S: DiffusionScheduler<B, D>,
        F: FnMut(Tensor<B, D>, usize) -> Tensor<B, D>,
    {
        self.scheduler.set_timesteps(num_steps);
        self.scheduler.reset();
        let timesteps = self.scheduler.timesteps().to_vec();
        for t in timesteps {
            let pred = predict(sample.clone(), t);
            sample = self.scheduler.step(pred, t, sample);
        }
        sample
    }
}

impl<B: Backend> DiffusionPipeline<DdpmScheduler<B, 4>> {
    /// Sample `batch_size` images from pure noise. Output is `[B, C, H, W]` in `[0, 1]`.
    pub fn generate<M: Denoiser<B>>(
        &mut self,
        model: &M,
        batch_size: usize,
        channels: usize,
        resolution: usize,
        num_steps: usize,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let noise = self.scheduler.initial_noise([batch_size, channels, resolution, resolution], device);
        let sample = self.run_single(noise, num_steps, |x, t| {
            let timesteps = timesteps_tensor::<B>(&vec![t; batch_size], device);
            model.denoise(x, timesteps)
        });
        sample.div_scalar(2.0).add_scalar(0.5).clamp(0.0, 1.0)
    }
}
