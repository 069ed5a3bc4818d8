use std::panic::{catch_unwind, AssertUnwindSafe};

use burn::backend::NdArray;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::ops::FloatElem;
use burn::tensor::{Tensor, Tolerance};

use burn_ddpm::ema::{EmaConfig, ExponentialMovingAverage};
use burn_ddpm::DdpmError;

type TB = NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

fn linear() -> Linear<TB> {
    LinearConfig::new(3, 2).init(&device())
}

/// Same parameters (and ids) as `linear`, every value moved by `delta`.
fn shifted(linear: &Linear<TB>, delta: f32) -> Linear<TB> {
    let mut out = linear.clone();
    out.weight = out.weight.map(|w| w.add_scalar(delta));
    out.bias = out.bias.map(|b| b.map(|t| t.add_scalar(delta)));
    out
}

fn weight(linear: &Linear<TB>) -> Tensor<TB, 2> {
    linear.weight.val()
}

#[test]
fn decay_warms_up_monotonically() {
    let config = EmaConfig::new();
    assert_eq!(config.decay(1), 0.0);
    let mut prev = 0.0;
    for step in 2..2_000 {
        let decay = config.decay(step);
        assert!(decay >= prev && decay <= config.max_decay);
        prev = decay;
    }
}

#[test]
fn first_update_copies_the_weights() {
    let base = linear();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &base);
    assert_eq!(ema.num_params(), 2);

    let moved = shifted(&base, 1.0);
    ema.step(&moved);
    assert_eq!(ema.decay(), 0.0);
    weight(&ema.shadow_module(&base))
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&weight(&moved).into_data(), Tolerance::default());
}

#[test]
fn update_blends_with_the_configured_decay() {
    let base = linear();
    let config = EmaConfig::new().with_use_warmup(false).with_max_decay(0.5);
    let mut ema = ExponentialMovingAverage::new(config, &base);

    let w1 = shifted(&base, 1.0);
    let w2 = shifted(&base, 3.0);
    ema.step(&w1);
    ema.step(&w2);
    assert_eq!(ema.optimization_step(), 2);
    assert_eq!(ema.decay(), 0.5);

    let expected = weight(&base).add_scalar(2.0);
    weight(&ema.shadow_module(&base))
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&expected.into_data(), Tolerance::default());
}

#[test]
fn store_copy_restore_round_trips_exactly() {
    let mut model = linear();
    let original = weight(&model).into_data();
    let target = shifted(&model, 2.0);
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    ema.step(&target);

    ema.store(&model);
    ema.copy_to(&mut model).unwrap();
    weight(&model)
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&weight(&target).into_data(), Tolerance::default());
    ema.restore(&mut model).unwrap();
    assert_eq!(weight(&model).into_data(), original);
}

#[test]
fn copy_without_store_is_refused() {
    let mut model = linear();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    assert!(matches!(ema.copy_to(&mut model), Err(DdpmError::EmaProtocol(_))));
    assert!(matches!(ema.restore(&mut model), Err(DdpmError::EmaProtocol(_))));
}

fn sample_then_fail(ema: &mut ExponentialMovingAverage<TB>, model: &mut Linear<TB>) -> Result<(), DdpmError> {
    let swapped = ema.swap_in(model)?;
    let _ = swapped.weight.val();
    Err(DdpmError::Tensor("sampling failed".into()))
}

#[test]
fn swap_guard_restores_on_early_return() {
    let mut model = linear();
    let original = weight(&model).into_data();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    ema.step(&shifted(&model, 5.0));

    assert!(sample_then_fail(&mut ema, &mut model).is_err());
    assert_eq!(weight(&model).into_data(), original);
}

#[test]
fn swap_guard_restores_on_panic() {
    let mut model = linear();
    let original = weight(&model).into_data();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    ema.step(&shifted(&model, 5.0));

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let swapped = ema.swap_in(&mut model).unwrap();
        let _ = swapped.weight.val();
        panic!("sampling panicked");
    }));
    assert!(outcome.is_err());
    assert_eq!(weight(&model).into_data(), original);
}

#[test]
fn swapped_module_carries_shadow_weights() {
    let mut model = linear();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    let target = shifted(&model, 4.0);
    ema.step(&target);

    let swapped = ema.swap_in(&mut model).unwrap();
    weight(&swapped)
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&weight(&target).into_data(), Tolerance::default());
}

#[test]
fn loaded_shadow_replaces_the_average() {
    let model = linear();
    let mut ema = ExponentialMovingAverage::new(EmaConfig::new(), &model);
    let restored = shifted(&model, -1.0);
    ema.load_shadow(&restored);
    ema.set_optimization_step(10);
    assert_eq!(ema.optimization_step(), 10);
    assert_eq!(ema.decay(), EmaConfig::new().decay(10));
    weight(&ema.shadow_module(&model))
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&weight(&restored).into_data(), Tolerance::default());
}
