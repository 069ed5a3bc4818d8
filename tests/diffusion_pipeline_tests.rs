use burn::backend::NdArray;
use burn::module::{Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor};

use burn_ddpm::diffusion::{DdpmScheduler, DiffusionPipeline, NoiseScheduleConfig, PredictionType};
use burn_ddpm::model::Denoiser;

type TB = NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

fn pipeline(seed: u64) -> DiffusionPipeline<DdpmScheduler<TB, 4>> {
    let schedule = NoiseScheduleConfig::new().with_num_train_timesteps(50).init().unwrap();
    DiffusionPipeline::new(DdpmScheduler::new(schedule, PredictionType::Epsilon).with_seed(seed))
}

/// Predicts `gain * noisy`, zero by default.
#[derive(Module, Debug)]
struct NoNoise<B: Backend> {
    gain: Param<Tensor<B, 1>>,
}

fn no_noise() -> NoNoise<TB> {
    NoNoise {
        gain: Param::from_tensor(Tensor::zeros([1], &device())),
    }
}

impl<B: Backend> Denoiser<B> for NoNoise<B> {
    fn denoise(&self, noisy: Tensor<B, 4>, _timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        noisy * self.gain.val().reshape([1, 1, 1, 1])
    }
}

#[test]
fn pipeline_run_single_visits_every_timestep() {
    let mut pipe = pipeline(0);
    let sample = Tensor::<TB, 4>::random([2, 1, 4, 4], Distribution::Default, &device());
    let mut seen = Vec::new();
    let out = pipe.run_single(sample, 5, |x, t| {
        seen.push(t);
        x.zeros_like()
    });
    assert_eq!(out.dims(), [2, 1, 4, 4]);
    assert_eq!(seen, vec![40, 30, 20, 10, 0]);
}

#[test]
fn generate_returns_images_in_unit_range() {
    let mut pipe = pipeline(3);
    let images = pipe.generate(&no_noise(), 3, 1, 4, 5, &device());
    assert_eq!(images.dims(), [3, 1, 4, 4]);
    let values = images.into_data().to_vec::<f32>().unwrap();
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn generation_is_reproducible_for_a_seed() {
    let a = pipeline(9).generate(&no_noise(), 2, 1, 4, 5, &device());
    let b = pipeline(9).generate(&no_noise(), 2, 1, 4, 5, &device());
    assert_eq!(a.into_data(), b.into_data());
}
