use burn::backend::NdArray;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, ElementConversion, Tensor};

use burn_ddpm::diffusion::{diffusion_loss, weighted_mse, NoiseScheduleConfig, PredictionType};
use burn_ddpm::DdpmError;

type TB = NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

fn normal(shape: [usize; 4]) -> Tensor<TB, 4> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device())
}

fn scalar(t: Tensor<TB, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

#[test]
fn exact_noise_prediction_has_zero_loss() {
    let schedule = NoiseScheduleConfig::new().init().unwrap();
    let noise = normal([2, 3, 4, 4]);
    let loss = diffusion_loss(
        noise.clone(),
        normal([2, 3, 4, 4]),
        noise,
        &[10, 20],
        &schedule,
        PredictionType::Epsilon,
    )
    .unwrap();
    assert!(scalar(loss).abs() < 1e-12);
}

#[test]
fn epsilon_loss_is_mean_squared_error() {
    let schedule = NoiseScheduleConfig::new().init().unwrap();
    let pred = normal([2, 1, 3, 3]);
    let noise = normal([2, 1, 3, 3]);
    let expected = scalar((pred.clone() - noise.clone()).powf_scalar(2.0).mean());
    let loss = diffusion_loss(pred, normal([2, 1, 3, 3]), noise, &[0, 1], &schedule, PredictionType::Epsilon).unwrap();
    assert!((scalar(loss) - expected).abs() < 1e-5);
}

#[test]
fn doubling_weights_doubles_the_loss() {
    let pred = normal([2, 2, 2, 2]);
    let target = normal([2, 2, 2, 2]);
    let ones = Tensor::<TB, 4>::ones([2, 1, 1, 1], &device());
    let once = scalar(weighted_mse(pred.clone(), target.clone(), ones.clone()));
    let twice = scalar(weighted_mse(pred, target, ones.mul_scalar(2.0)));
    assert!((twice - 2.0 * once).abs() < 1e-5 * once.max(1.0));
}

#[test]
fn sample_loss_is_weighted_by_unnormalized_snr() {
    let schedule = NoiseScheduleConfig::new().init().unwrap();
    let clean = Tensor::<TB, 4>::ones([1, 1, 2, 2], &device());
    let pred = Tensor::<TB, 4>::zeros([1, 1, 2, 2], &device());
    let noise = normal([1, 1, 2, 2]);
    let loss = diffusion_loss(pred, clean, noise, &[500], &schedule, PredictionType::Sample).unwrap();
    let snr = schedule.snr(500).unwrap();
    assert!((scalar(loss) - snr).abs() < 1e-4 * snr.max(1.0));
}

#[test]
fn shape_mismatch_is_reported() {
    let schedule = NoiseScheduleConfig::new().init().unwrap();
    let err = diffusion_loss(
        normal([2, 1, 2, 2]),
        normal([2, 1, 2, 2]),
        normal([2, 1, 4, 4]),
        &[0, 0],
        &schedule,
        PredictionType::Epsilon,
    )
    .unwrap_err();
    assert!(matches!(err, DdpmError::Tensor(_)));
}

#[test]
fn unknown_prediction_type_is_a_config_error() {
    let err = "v_prediction".parse::<PredictionType>().unwrap_err();
    assert!(matches!(err, DdpmError::Config { .. }));
    assert_eq!("sample".parse::<PredictionType>().unwrap(), PredictionType::Sample);
}
