use burn::tensor::{backend::Backend, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

/// Evenly spaced values over `[start, end]`, endpoints included.
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps <= 1 { return vec![start]; }
    let delta = (end - start) / (steps as f64 - 1.0);
    (0..steps).map(|i| start + delta * i as f64).collect()
}

/// Standard-normal tensor drawn from a host generator instead of the backend RNG.
///
/// Used where sampling has to be reproducible independently of the training
/// stream, e.g. periodic preview images.
pub fn host_normal<B: Backend, const D: usize, R: Rng + ?Sized>(
    rng: &mut R,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let numel = shape.iter().product::<usize>();
    let values: Vec<f32> = (0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape(shape)
}
