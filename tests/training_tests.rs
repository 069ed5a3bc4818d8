use std::fs;
use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, Param};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::ops::FloatElem;
use burn::tensor::{Distribution, ElementConversion, Int, Tensor, Tolerance};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

use burn_ddpm::data::InMemoryDataset;
use burn_ddpm::diffusion::{NoiseScheduleConfig, PredictionType};
use burn_ddpm::dist::{LocalProcess, ProcessGroup};
use burn_ddpm::model::{Denoiser, UNet2DConfig};
use burn_ddpm::tracker::{JsonlTracker, NoopTracker, Tracker};
use burn_ddpm::train::{compute_loss, load_pipeline, train, CheckpointManager, LrSchedulerKind, TrainingConfig};
use burn_ddpm::{DdpmError, Result};

type TB = NdArray<f32>;
type AB = Autodiff<TB>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

/// Predicts `scale * noisy`; with `scale == 0` every prediction is zero.
#[derive(Module, Debug)]
struct ZeroNet<B: Backend> {
    scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> ZeroNet<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            scale: Param::from_tensor(Tensor::zeros([1], device)),
        }
    }
}

impl<B: Backend> Denoiser<B> for ZeroNet<B> {
    fn denoise(&self, noisy: Tensor<B, 4>, _timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        noisy * self.scale.val().reshape([1, 1, 1, 1])
    }
}

fn dataset(count: usize) -> InMemoryDataset {
    let images = (0..count)
        .map(|i| (0..16).map(|p| ((i + p) % 5) as f32 / 2.0 - 1.0).collect::<Vec<f32>>())
        .collect();
    InMemoryDataset::new(images, 1, 4).unwrap()
}

fn config(output_dir: &Path) -> TrainingConfig {
    let model = UNet2DConfig::new()
        .with_in_channels(1)
        .with_out_channels(1)
        .with_block_out_channels(vec![4, 8])
        .with_layers_per_block(1)
        .with_norm_num_groups(2)
        .with_sample_size(4);
    let schedule = NoiseScheduleConfig::new().with_num_train_timesteps(10);
    TrainingConfig::new(model, schedule, AdamWConfig::new(), output_dir.display().to_string())
        .with_resolution(4)
        .with_train_batch_size(2)
        .with_eval_batch_size(1)
        .with_num_epochs(2)
        .with_save_images_epochs(1)
        .with_save_model_epochs(1)
        .with_lr_scheduler(LrSchedulerKind::Constant)
        .with_lr_warmup_steps(0)
        .with_learning_rate(1e-2)
        .with_ddpm_num_inference_steps(2)
        .with_checkpointing_steps(2)
}

fn run(config: &TrainingConfig, data: &InMemoryDataset, tracker: &mut dyn Tracker) -> Result<burn_ddpm::train::TrainingSummary> {
    run_in(config, data, tracker, &LocalProcess)
}

fn run_in(
    config: &TrainingConfig,
    data: &InMemoryDataset,
    tracker: &mut dyn Tracker,
    group: &dyn ProcessGroup,
) -> Result<burn_ddpm::train::TrainingSummary> {
    let device = device();
    train::<AB, _, _>(config, ZeroNet::new(&device), data, None, tracker, group, &device)
}

fn checkpoint_steps(dir: &Path) -> Vec<usize> {
    CheckpointManager::new(dir, None)
        .list()
        .unwrap()
        .into_iter()
        .map(|(step, _)| step)
        .collect()
}

#[test]
fn zero_prediction_loss_is_mean_squared_noise() {
    let device = device();
    let schedule = NoiseScheduleConfig::new().init().unwrap();
    let clean = Tensor::<AB, 4>::random([4, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);
    let mut model = ZeroNet::<AB>::new(&device);
    let mut rng = StdRng::seed_from_u64(0);

    let out = compute_loss(&model, clean, &schedule, PredictionType::Epsilon, &mut rng).unwrap();
    assert_eq!(out.timesteps.len(), 4);
    assert!(out.timesteps.iter().all(|t| *t < 1000));
    let expected = out.noise.clone().powf_scalar(2.0).mean();
    out.loss
        .clone()
        .into_data()
        .assert_approx_eq::<FloatElem<TB>>(&expected.into_data(), Tolerance::default());

    let mut optim = AdamWConfig::new().init::<AB, ZeroNet<AB>>();
    let grads = GradientsParams::from_grads(out.loss.backward(), &model);
    model = optim.step(1e-3, model, grads);
    let scale = model.scale.val().into_scalar().elem::<f32>();
    assert!(scale != 0.0);
}

#[test]
fn end_to_end_run_writes_checkpoints_pipeline_and_metrics() {
    let dir = tempdir().unwrap();
    let config = config(dir.path()).with_use_ema(true).with_checkpoints_total_limit(Some(2));
    let mut tracker = JsonlTracker::new(dir.path().join("logs")).unwrap();

    let summary = run(&config, &dataset(6), &mut tracker).unwrap();
    assert_eq!(summary.global_step, 6);
    assert_eq!(summary.optimizer_steps, 6);
    assert_eq!(summary.resumed_from, None);
    assert!(summary.last_loss.is_some_and(f64::is_finite));

    assert_eq!(checkpoint_steps(dir.path()), vec![4, 6]);
    assert!(dir.path().join("checkpoint-6").join("unet_ema").join("model.mpk").is_file());

    let exported = dir.path();
    assert!(exported.join("unet").join("model.safetensors").is_file());
    assert!(exported.join("unet").join("config.json").is_file());
    assert!(exported.join("scheduler_config.json").is_file());

    let metrics = fs::read_to_string(dir.path().join("logs").join("metrics.jsonl")).unwrap();
    let rows: Vec<serde_json::Value> = metrics.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|r| r.get("loss").is_some() && r.get("ema_decay").is_some()));
    assert!(dir.path().join("logs").join("test_samples_000006.png").is_file());
}

#[test]
fn gradient_accumulation_counts_optimizer_steps() {
    let dir = tempdir().unwrap();
    let config = config(dir.path()).with_gradient_accumulation_steps(2);
    let summary = run(&config, &dataset(6), &mut NoopTracker).unwrap();
    // 3 batches per epoch, groups of 2 and 1.
    assert_eq!(summary.global_step, 4);
    assert_eq!(checkpoint_steps(dir.path()), vec![2, 4]);
}

#[test]
fn resume_from_latest_continues_the_count() {
    let dir = tempdir().unwrap();
    let first = config(dir.path()).with_use_ema(true);
    run(&first, &dataset(6), &mut NoopTracker).unwrap();

    let resumed = first
        .clone()
        .with_num_epochs(3)
        .with_resume_from_checkpoint(Some("latest".to_string()));
    let summary = run(&resumed, &dataset(6), &mut NoopTracker).unwrap();
    assert_eq!(summary.resumed_from, Some(6));
    assert_eq!(summary.optimizer_steps, 3);
    assert_eq!(summary.global_step, 9);
    assert_eq!(checkpoint_steps(dir.path()).last(), Some(&9));
}

#[test]
fn resumed_ema_continues_its_decay_schedule() {
    let dir = tempdir().unwrap();
    let first = config(dir.path()).with_use_ema(true);
    run(&first, &dataset(6), &mut NoopTracker).unwrap();

    let resumed = first
        .clone()
        .with_num_epochs(3)
        .with_resume_from_checkpoint(Some("latest".to_string()));
    let mut tracker = JsonlTracker::new(dir.path().join("resumed_logs")).unwrap();
    let summary = run(&resumed, &dataset(6), &mut tracker).unwrap();
    assert_eq!(summary.resumed_from, Some(6));
    drop(tracker);

    let metrics = fs::read_to_string(dir.path().join("resumed_logs").join("metrics.jsonl")).unwrap();
    let first_row: serde_json::Value = serde_json::from_str(metrics.lines().next().unwrap()).unwrap();
    let logged = first_row["ema_decay"].as_f64().unwrap();
    let expected = resumed.ema.decay(7);
    assert!(expected > 0.0);
    assert!((logged - expected).abs() < 1e-12, "logged {logged}, expected {expected}");
}

#[test]
fn model_snapshot_is_replaced_every_epoch() {
    let dir = tempdir().unwrap();
    let config = config(dir.path()).with_num_epochs(3).with_save_model_epochs(1);
    let device = device();
    let model = config.model.init::<AB>(&device);
    let data = dataset(4);
    let summary = train::<AB, _, _>(&config, model, &data, None, &mut NoopTracker, &LocalProcess, &device).unwrap();
    assert_eq!(summary.global_step, 6);

    let exported = load_pipeline::<TB>(dir.path(), &device).unwrap();
    assert_eq!(exported.model_config.out_channels, 1);
}

#[test]
fn resume_mid_epoch_skips_consumed_batches() {
    let dir = tempdir().unwrap();
    let first = config(dir.path()).with_checkpointing_steps(1);
    run(&first, &dataset(6), &mut NoopTracker).unwrap();
    assert_eq!(checkpoint_steps(dir.path()), vec![1, 2, 3, 4, 5, 6]);

    let resumed = first.with_resume_from_checkpoint(Some("checkpoint-4".to_string()));
    let summary = run(&resumed, &dataset(6), &mut NoopTracker).unwrap();
    assert_eq!(summary.resumed_from, Some(4));
    assert_eq!(summary.optimizer_steps, 2);
    assert_eq!(summary.global_step, 6);
}

#[test]
fn missing_checkpoint_starts_fresh() {
    let dir = tempdir().unwrap();
    let config = config(dir.path()).with_resume_from_checkpoint(Some("checkpoint-999".to_string()));
    let summary = run(&config, &dataset(6), &mut NoopTracker).unwrap();
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.global_step, 6);
}

#[test]
fn unreadable_checkpoint_starts_fresh() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("checkpoint-3")).unwrap();
    let config = config(dir.path()).with_resume_from_checkpoint(Some("latest".to_string()));
    let summary = run(&config, &dataset(6), &mut NoopTracker).unwrap();
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.optimizer_steps, 6);
}

struct FailingTracker;

impl Tracker for FailingTracker {
    fn log_scalars(&mut self, _scalars: &[(&str, f64)], _step: usize) -> Result<()> {
        Err(DdpmError::Tracker("backend offline".into()))
    }

    fn log_images(&mut self, _name: &str, _images: &[RgbImage], _step: usize) -> Result<()> {
        Err(DdpmError::Tracker("backend offline".into()))
    }
}

#[test]
fn tracker_failures_do_not_abort_training() {
    let dir = tempdir().unwrap();
    let summary = run(&config(dir.path()), &dataset(6), &mut FailingTracker).unwrap();
    assert_eq!(summary.global_step, 6);
}

struct SecondRank;

impl ProcessGroup for SecondRank {
    fn rank(&self) -> usize { 1 }
    fn world_size(&self) -> usize { 2 }
    fn barrier(&self) -> Result<()> { Ok(()) }
    fn all_reduce_mean(&self, grads: GradientsParams) -> Result<GradientsParams> { Ok(grads) }
}

#[test]
fn only_the_main_process_writes_to_disk() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run");
    let summary = run_in(&config(&output), &dataset(6), &mut NoopTracker, &SecondRank).unwrap();
    // Half of the 6 images per epoch: 2 batches of at most 2.
    assert_eq!(summary.global_step, 4);
    assert!(!output.exists());
}

#[test]
fn invalid_configuration_fails_before_training() {
    let dir = tempdir().unwrap();
    let err = run(&config(dir.path()).with_train_batch_size(0), &dataset(6), &mut NoopTracker).unwrap_err();
    assert!(matches!(err, DdpmError::Config { field: "train_batch_size", .. }));

    let err = run(&config(dir.path()).with_resolution(8), &dataset(6), &mut NoopTracker).unwrap_err();
    assert!(matches!(err, DdpmError::Config { .. }));
}

#[test]
fn exported_unet_pipeline_loads_back() {
    let dir = tempdir().unwrap();
    let config = config(dir.path()).with_num_epochs(1).with_use_ema(true);
    let device = device();
    let model = config.model.init::<AB>(&device);
    let data = dataset(2);
    train::<AB, _, _>(&config, model, &data, Some(&data), &mut NoopTracker, &LocalProcess, &device).unwrap();

    let exported = load_pipeline::<TB>(dir.path(), &device).unwrap();
    assert_eq!(exported.model_config.in_channels, 1);
    assert_eq!(exported.scheduler_config.noise_schedule.num_train_timesteps, 10);
    let scheduler = exported.scheduler_config.init::<TB, 4>().unwrap();
    let mut pipeline = burn_ddpm::diffusion::DiffusionPipeline::new(scheduler);
    let images = pipeline.generate(&exported.model, 2, 1, 4, 2, &device);
    assert_eq!(images.dims(), [2, 1, 4, 4]);
}
