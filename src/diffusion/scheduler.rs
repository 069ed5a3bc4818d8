use burn::tensor::{backend::Backend, Tensor};

/// Discrete-time reverse-process scheduler.
pub trait DiffusionScheduler<B: Backend, const D: usize> {
    /// Inference timesteps, in the order they are visited.
    fn timesteps(&self) -> &[usize];
    fn set_timesteps(&mut self, n: usize);
    fn num_train_timesteps(&self) -> usize;
    fn reset(&mut self);
    fn step_index(&self) -> usize;
    /// Advance `sample` from `timestep` to the previous inference timestep.
    fn step(&mut self, model_output: Tensor<B, D>, timestep: usize, sample: Tensor<B, D>) -> Tensor<B, D>;
    /// Forward-diffuse `sample` to `timestep` with the given `noise`.
    fn scale_noise(&self, sample: Tensor<B, D>, timestep: usize, noise: Tensor<B, D>) -> Tensor<B, D>;
}
