use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::optim::AdamWConfig;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burn_ddpm::data::{ImageFolderDataset, ImageTransform};
use burn_ddpm::diffusion::{BetaSchedule, NoiseScheduleConfig, PredictionType};
use burn_ddpm::dist::LocalProcess;
use burn_ddpm::ema::EmaConfig;
use burn_ddpm::model::UNet2DConfig;
use burn_ddpm::tracker::TrackerKind;
use burn_ddpm::train::{train, LrSchedulerKind, MixedPrecision, TrainingConfig};
use burn_ddpm::DdpmError;

#[derive(Parser, Debug)]
#[command(name = "ddpm_train", version, about = "Train an unconditional DDPM on a folder of images")]
struct Args {
    /// Folder containing the training images
    #[arg(long, value_name = "DIR")]
    train_data_dir: Option<PathBuf>,
    /// Optional folder of held-out images; enables the per-epoch validation loss
    #[arg(long, value_name = "DIR")]
    eval_data_dir: Option<PathBuf>,
    /// JSON UNet config; defaults to the standard 4-level UNet at `--resolution`
    #[arg(long, value_name = "FILE")]
    model_config: Option<PathBuf>,
    /// Where checkpoints, the exported pipeline and logs are written
    #[arg(long, default_value = "ddpm-model-64")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 64)]
    resolution: usize,
    #[arg(long)]
    center_crop: bool,
    #[arg(long)]
    random_flip: bool,
    #[arg(long, default_value_t = 16)]
    train_batch_size: usize,
    #[arg(long, default_value_t = 16)]
    eval_batch_size: usize,
    #[arg(long, default_value_t = 100)]
    num_epochs: usize,
    #[arg(long, default_value_t = 10)]
    save_images_epochs: usize,
    #[arg(long, default_value_t = 10)]
    save_model_epochs: usize,
    #[arg(long, default_value_t = 1)]
    gradient_accumulation_steps: usize,
    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,
    /// linear, cosine, cosine_with_restarts, polynomial, constant or constant_with_warmup
    #[arg(long, default_value = "cosine")]
    lr_scheduler: String,
    #[arg(long, default_value_t = 500)]
    lr_warmup_steps: usize,
    #[arg(long, default_value_t = 0.95)]
    adam_beta1: f32,
    #[arg(long, default_value_t = 0.999)]
    adam_beta2: f32,
    #[arg(long, default_value_t = 1e-6)]
    adam_weight_decay: f32,
    #[arg(long, default_value_t = 1e-8)]
    adam_epsilon: f32,
    #[arg(long, default_value_t = 1.0)]
    max_grad_norm: f64,
    #[arg(long)]
    use_ema: bool,
    #[arg(long, default_value_t = 1.0)]
    ema_inv_gamma: f64,
    #[arg(long, default_value_t = 0.75)]
    ema_power: f64,
    #[arg(long, default_value_t = 0.9999)]
    ema_max_decay: f64,
    /// jsonl or none
    #[arg(long, default_value = "jsonl")]
    logger: String,
    /// Tracker output, relative to the output directory
    #[arg(long, default_value = "logs")]
    logging_dir: PathBuf,
    /// no, fp16 or bf16
    #[arg(long, default_value = "no")]
    mixed_precision: String,
    /// epsilon or sample
    #[arg(long, default_value = "epsilon")]
    prediction_type: String,
    #[arg(long, default_value_t = 1000)]
    ddpm_num_steps: usize,
    #[arg(long, default_value_t = 1000)]
    ddpm_num_inference_steps: usize,
    /// linear, scaled_linear or squaredcos_cap_v2
    #[arg(long, default_value = "linear")]
    ddpm_beta_schedule: String,
    #[arg(long, default_value_t = 500)]
    checkpointing_steps: usize,
    #[arg(long)]
    checkpoints_total_limit: Option<usize>,
    /// "latest" or a checkpoint directory name
    #[arg(long)]
    resume_from_checkpoint: Option<String>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let model = match &self.model_config {
            Some(path) => UNet2DConfig::load(path)
                .map_err(|err| anyhow::anyhow!("{err:?}"))
                .with_context(|| format!("load model config {}", path.display()))?,
            None => UNet2DConfig::new().with_sample_size(self.resolution),
        };
        let noise_schedule = NoiseScheduleConfig::new()
            .with_num_train_timesteps(self.ddpm_num_steps)
            .with_beta_schedule(self.ddpm_beta_schedule.parse::<BetaSchedule>()?);
        let optimizer = AdamWConfig::new()
            .with_beta_1(self.adam_beta1)
            .with_beta_2(self.adam_beta2)
            .with_weight_decay(self.adam_weight_decay)
            .with_epsilon(self.adam_epsilon);
        let ema = EmaConfig::new()
            .with_inv_gamma(self.ema_inv_gamma)
            .with_power(self.ema_power)
            .with_max_decay(self.ema_max_decay);

        let config = TrainingConfig::new(model, noise_schedule, optimizer, self.output_dir.display().to_string())
            .with_ema(ema)
            .with_use_ema(self.use_ema)
            .with_resolution(self.resolution)
            .with_train_batch_size(self.train_batch_size)
            .with_eval_batch_size(self.eval_batch_size)
            .with_num_epochs(self.num_epochs)
            .with_save_images_epochs(self.save_images_epochs)
            .with_save_model_epochs(self.save_model_epochs)
            .with_gradient_accumulation_steps(self.gradient_accumulation_steps)
            .with_learning_rate(self.learning_rate)
            .with_lr_scheduler(self.lr_scheduler.parse::<LrSchedulerKind>()?)
            .with_lr_warmup_steps(self.lr_warmup_steps)
            .with_max_grad_norm(self.max_grad_norm)
            .with_prediction_type(self.prediction_type.parse::<PredictionType>()?)
            .with_ddpm_num_inference_steps(self.ddpm_num_inference_steps)
            .with_checkpointing_steps(self.checkpointing_steps)
            .with_checkpoints_total_limit(self.checkpoints_total_limit)
            .with_resume_from_checkpoint(self.resume_from_checkpoint.clone())
            .with_mixed_precision(self.mixed_precision.parse::<MixedPrecision>()?)
            .with_seed(self.seed);
        config.validate()?;
        Ok(config)
    }
}

fn run<B: AutodiffBackend>(args: &Args, config: TrainingConfig, train_dir: &Path, device: B::Device) -> Result<()> {
    B::seed(&device, config.seed);
    let transform = ImageTransform {
        resolution: config.resolution,
        center_crop: args.center_crop,
        random_flip: args.random_flip,
    };
    let train_data = ImageFolderDataset::open(train_dir, transform)
        .with_context(|| format!("open training images in {}", train_dir.display()))?;
    let eval_data = match &args.eval_data_dir {
        Some(dir) => Some(
            ImageFolderDataset::open(dir, ImageTransform { center_crop: true, random_flip: false, ..transform })
                .with_context(|| format!("open evaluation images in {}", dir.display()))?,
        ),
        None => None,
    };

    std::fs::create_dir_all(&args.output_dir)?;
    config.save(args.output_dir.join("training_config.json"))?;
    let logger = args.logger.parse::<TrackerKind>()?;
    let mut tracker = logger.init(args.output_dir.join(&args.logging_dir))?;

    let model = config.model.init::<B>(&device);
    let summary = train::<B, _, _>(
        &config,
        model,
        &train_data,
        eval_data.as_ref(),
        tracker.as_mut(),
        &LocalProcess,
        &device,
    )?;
    tracing::info!(
        "done: {} optimization steps ({} in this run), last loss {:?}",
        summary.global_step,
        summary.optimizer_steps,
        summary.last_loss
    );
    Ok(())
}

#[cfg(feature = "wgpu")]
fn run_half(args: &Args, config: TrainingConfig, train_dir: &Path) -> Result<()> {
    use burn::backend::wgpu::{Wgpu, WgpuDevice};
    run::<Autodiff<Wgpu<half::f16>>>(args, config, train_dir, WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn run_half(_args: &Args, _config: TrainingConfig, _train_dir: &Path) -> Result<()> {
    Err(DdpmError::config("mixed_precision", "`fp16` needs a GPU backend; rebuild with the `wgpu` feature").into())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let Some(train_dir) = args.train_data_dir.clone() else {
        bail!("You must specify a training folder with --train-data-dir");
    };
    let config = args.training_config()?;

    match config.mixed_precision {
        MixedPrecision::No => run::<Autodiff<NdArray<f32>>>(&args, config, &train_dir, Default::default()),
        MixedPrecision::Fp16 => run_half(&args, config, &train_dir),
        MixedPrecision::Bf16 => {
            Err(DdpmError::config("mixed_precision", "`bf16` is not supported by the available backends").into())
        }
    }
}
