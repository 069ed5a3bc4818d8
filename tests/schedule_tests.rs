use burn::backend::NdArray;
use burn::tensor::backend::Backend;

use burn_ddpm::diffusion::{BetaSchedule, NoiseSchedule, NoiseScheduleConfig};
use burn_ddpm::DdpmError;

type TB = NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

fn linear() -> NoiseSchedule {
    NoiseScheduleConfig::new().init().unwrap()
}

#[test]
fn alphas_cumprod_strictly_decreasing_in_unit_interval() {
    for law in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredCosCapV2] {
        let schedule = NoiseScheduleConfig::new().with_beta_schedule(law).init().unwrap();
        let ab = schedule.alphas_cumprod();
        assert_eq!(ab.len(), 1000);
        assert!(ab.iter().all(|v| *v > 0.0 && *v <= 1.0), "{law}: value outside (0, 1]");
        assert!(ab.windows(2).all(|w| w[1] < w[0]), "{law}: not strictly decreasing");
    }
}

#[test]
fn first_alpha_bar_is_one_minus_beta_start() {
    let schedule = linear();
    assert!((schedule.alpha_bar(0).unwrap() - (1.0 - 1e-4)).abs() < 1e-12);
    assert!((schedule.betas()[999] - 0.02).abs() < 1e-12);
}

#[test]
fn cosine_betas_are_capped() {
    let schedule = NoiseScheduleConfig::new()
        .with_beta_schedule(BetaSchedule::SquaredCosCapV2)
        .init()
        .unwrap();
    assert!(schedule.betas().iter().all(|b| *b <= 0.999));
}

#[test]
fn snr_matches_definition() {
    let schedule = linear();
    let ab = schedule.alpha_bar(500).unwrap();
    assert!((schedule.snr(500).unwrap() - ab / (1.0 - ab)).abs() < 1e-9);
}

#[test]
fn extract_broadcasts_per_sample() {
    let schedule = linear();
    let out = schedule.sqrt_alpha_bar::<TB, 4>(&[0, 999], &device()).unwrap();
    assert_eq!(out.dims(), [2, 1, 1, 1]);
    let values = out.into_data().to_vec::<f32>().unwrap();
    assert!((values[0] as f64 - schedule.alpha_bar(0).unwrap().sqrt()).abs() < 1e-6);
    assert!((values[1] as f64 - schedule.alpha_bar(999).unwrap().sqrt()).abs() < 1e-6);
}

#[test]
fn out_of_range_timestep_is_rejected() {
    let schedule = linear();
    assert!(schedule.alpha_bar(1000).is_err());
    assert!(schedule.sqrt_alpha_bar::<TB, 4>(&[3, 1000], &device()).is_err());
}

#[test]
fn unknown_law_names_the_value() {
    let err = "quadratic".parse::<BetaSchedule>().unwrap_err();
    assert!(matches!(err, DdpmError::Config { .. }));
    assert!(err.to_string().contains("quadratic"));
}

#[test]
fn degenerate_betas_are_rejected() {
    assert!(NoiseScheduleConfig::new().with_beta_start(0.03).init().is_err());
    assert!(NoiseScheduleConfig::new().with_num_train_timesteps(0).init().is_err());
}
