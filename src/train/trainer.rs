use std::fs;
use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::{
    clip_grad_norm, load_checkpoint, save_pipeline, CheckpointManager, EpochLayout, LoadedCheckpoint, LrSchedule,
    TrainingConfig, TrainingState,
};
use crate::data::{DataLoader, ImageDataset};
use crate::diffusion::{
    diffusion_loss, noise_batch, timesteps_tensor, DiffusionPipeline, NoiseSchedule, NoisedBatch, PredictionType,
};
use crate::dist::ProcessGroup;
use crate::ema::ExponentialMovingAverage;
use crate::error::{DdpmError, Result};
use crate::model::Denoiser;
use crate::tracker::{log_images_or_warn, log_scalars_or_warn, to_rgb8, Tracker};

/// Seed of the generator driving preview samples, fixed so previews are comparable across epochs.
const SAMPLE_SEED: u64 = 0;

/// Result of one denoising forward pass on a clean batch.
pub struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub noise: Tensor<B, 4>,
    pub timesteps: Vec<usize>,
}

/// Diffuse `clean` with fresh noise and timesteps and score the model's prediction.
pub fn compute_loss<B, M, R>(
    model: &M,
    clean: Tensor<B, 4>,
    schedule: &NoiseSchedule,
    prediction_type: PredictionType,
    rng: &mut R,
) -> Result<StepOutput<B>>
where
    B: Backend,
    M: Denoiser<B>,
    R: Rng + ?Sized,
{
    let device = clean.device();
    let NoisedBatch { noisy, noise, timesteps } = noise_batch(schedule, clean.clone(), rng)?;
    let prediction = model.denoise(noisy, timesteps_tensor::<B>(&timesteps, &device));
    let loss = diffusion_loss(prediction, clean, noise.clone(), &timesteps, schedule, prediction_type)?;
    Ok(StepOutput { loss, noise, timesteps })
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Optimization steps completed, including those restored from a checkpoint.
    pub global_step: usize,
    /// Step of the checkpoint the run resumed from.
    pub resumed_from: Option<usize>,
    /// Optimization steps executed by this run.
    pub optimizer_steps: usize,
    pub last_loss: Option<f64>,
    pub last_val_loss: Option<f64>,
}

/// Train `model` on `train_data` according to `config`.
///
/// Resumes from `config.resume_from_checkpoint` when it resolves to a loadable
/// checkpoint; otherwise starts fresh after logging a warning. Tracker errors
/// are logged and ignored; every other error aborts the run.
pub fn train<B, M, D>(
    config: &TrainingConfig,
    model: M,
    train_data: &D,
    eval_data: Option<&D>,
    tracker: &mut dyn Tracker,
    group: &dyn ProcessGroup,
    device: &B::Device,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Denoiser<B>,
    M::InnerModule: Denoiser<B::InnerBackend>,
    D: ImageDataset + ?Sized,
{
    config.validate()?;
    check_dataset(config, train_data, "train_data_dir")?;
    if let Some(eval) = eval_data {
        check_dataset(config, eval, "eval_data_dir")?;
    }

    let schedule = config.noise_schedule.init()?;
    let output_dir = PathBuf::from(&config.output_dir);
    if group.is_main_process() {
        fs::create_dir_all(&output_dir)?;
    }

    let loader =
        DataLoader::new(train_data, config.train_batch_size, true, config.seed).with_shard(group.rank(), group.world_size());
    let layout = EpochLayout::new(loader.num_batches(), config.gradient_accumulation_steps);
    let max_train_steps = layout.max_train_steps(config.num_epochs);
    let accum = layout.accumulation_steps;

    let mut model = model;
    let mut optim = config.optimizer.init::<B, M>();
    let mut lr = LrSchedule::new(config.lr_scheduler, config.learning_rate, config.lr_warmup_steps, max_train_steps);
    let mut ema = config
        .use_ema
        .then(|| ExponentialMovingAverage::new(config.ema.clone(), &model.valid()));
    let checkpoints = CheckpointManager::new(&output_dir, config.checkpoints_total_limit);

    let mut state = TrainingState::default();
    let mut resumed_from = None;
    if let Some(target) = config.resume_from_checkpoint.as_deref() {
        match checkpoints.resolve(target)? {
            None => warn!("Checkpoint '{target}' does not exist. Starting a new training run."),
            Some((step, dir)) => match load_checkpoint::<B, M, _>(&dir, &model, &optim, device) {
                Ok(LoadedCheckpoint { model: m, optimizer, ema_shadow, state: saved }) => {
                    info!("Resuming from checkpoint {}", dir.display());
                    if saved.global_step != step {
                        warn!(
                            "checkpoint {} records step {} in its state file; using {step} from its name",
                            dir.display(),
                            saved.global_step
                        );
                    }
                    model = m;
                    optim = optimizer;
                    state = TrainingState { global_step: step, ..saved };
                    lr.set_current_step(state.lr_step);
                    if let Some(ema) = ema.as_mut() {
                        match ema_shadow {
                            Some(shadow) => ema.load_shadow(&shadow),
                            None => {
                                warn!("checkpoint {} has no EMA weights, restarting the average", dir.display());
                                ema.load_shadow(&model.valid());
                            }
                        }
                        ema.set_optimization_step(state.ema_optimization_step.unwrap_or(step));
                    }
                    resumed_from = Some(step);
                }
                Err(err) => warn!("Checkpoint '{target}' could not be loaded ({err}). Starting a new training run."),
            },
        }
    }

    let resume = layout.resume_point(state.global_step);
    B::seed(device, config.seed.wrapping_add(state.global_step as u64));
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(state.global_step as u64));

    info!("***** Running training *****");
    info!("  Num examples = {}", train_data.len());
    info!("  Num Epochs = {}", config.num_epochs);
    info!("  Instantaneous batch size per device = {}", config.train_batch_size);
    info!(
        "  Total train batch size (w. parallel, distributed & accumulation) = {}",
        config.train_batch_size * group.world_size() * accum
    );
    info!("  Gradient Accumulation steps = {accum}");
    info!("  Total optimization steps = {max_train_steps}");
    if let Some(step) = resumed_from {
        info!(
            "  Resuming at step {step}: epoch {}, skipping {} batches",
            resume.first_epoch, resume.resume_step
        );
    }

    let mut summary = TrainingSummary {
        global_step: state.global_step,
        resumed_from,
        ..Default::default()
    };
    let mut last_checkpoint = resumed_from;
    let mut accumulator = GradientsAccumulator::<M>::new();

    for epoch in resume.first_epoch..config.num_epochs {
        for (step, indices) in loader.epoch_batches(epoch).iter().enumerate() {
            if resumed_from.is_some() && epoch == resume.first_epoch && step < resume.resume_step {
                continue;
            }

            let clean = loader.load_batch::<B>(indices, epoch, device)?;
            let out = compute_loss(&model, clean, &schedule, config.prediction_type, &mut rng)?;
            let loss = out.loss.clone().into_scalar().elem::<f64>();
            let grads = out.loss.div_scalar(accum as f64).backward();
            accumulator.accumulate(&model, GradientsParams::from_grads(grads, &model));

            if layout.is_sync_step(step) {
                let grads = group.all_reduce_mean(accumulator.grads())?;
                let (grads, grad_norm) = clip_grad_norm::<B, M>(&model, grads, config.max_grad_norm);
                model = optim.step(lr.lr(), model, grads);
                lr.step();
                if let Some(ema) = ema.as_mut() {
                    ema.step(&model.valid());
                }

                state.global_step += 1;
                state.epoch = epoch;
                state.lr_step = lr.current_step();
                state.ema_optimization_step = ema.as_ref().map(|e| e.optimization_step());
                summary.optimizer_steps += 1;
                debug!(step = state.global_step, loss, grad_norm, "optimization step");

                if state.global_step % config.checkpointing_steps == 0 {
                    if group.is_main_process() {
                        checkpoints.save::<B, M, _>(&model, &optim, ema.as_ref(), &state)?;
                    }
                    last_checkpoint = Some(state.global_step);
                    group.barrier()?;
                }
            }

            let mut logs = vec![("loss", loss), ("lr", lr.lr()), ("step", state.global_step as f64)];
            if let Some(ema) = ema.as_ref() {
                logs.push(("ema_decay", ema.decay()));
            }
            log_scalars_or_warn(tracker, &logs, state.global_step);
            summary.last_loss = Some(loss);
        }
        group.barrier()?;

        if let Some(eval) = eval_data {
            let val_loss = evaluate::<B::InnerBackend, _, _>(&model.valid(), eval, &schedule, config, device)?;
            info!(epoch, val_loss, "validation");
            log_scalars_or_warn(tracker, &[("val_loss", val_loss)], state.global_step);
            summary.last_val_loss = Some(val_loss);
        }

        let last_epoch = epoch + 1 == config.num_epochs;
        if group.is_main_process() {
            if epoch % config.save_images_epochs == 0 || last_epoch {
                let images = sample_images::<B::InnerBackend, _>(model.valid(), ema.as_mut(), config, device)?;
                log_images_or_warn(tracker, "test_samples", &to_rgb8(images)?, state.global_step);
            }
            if epoch % config.save_model_epochs == 0 || last_epoch {
                let mut inner = model.valid();
                let scheduler_config = config.scheduler_config();
                match ema.as_mut() {
                    Some(ema) => {
                        let swapped = ema.swap_in(&mut inner)?;
                        save_pipeline(&output_dir, &*swapped, &config.model, &scheduler_config)?;
                    }
                    None => save_pipeline(&output_dir, &inner, &config.model, &scheduler_config)?,
                }
            }
        }
        group.barrier()?;
    }

    if last_checkpoint != Some(state.global_step) {
        if group.is_main_process() {
            checkpoints.save::<B, M, _>(&model, &optim, ema.as_ref(), &state)?;
        }
        group.barrier()?;
    }

    summary.global_step = state.global_step;
    info!("training finished at step {}", state.global_step);
    Ok(summary)
}

fn check_dataset<D: ImageDataset + ?Sized>(config: &TrainingConfig, data: &D, field: &'static str) -> Result<()> {
    if data.is_empty() {
        return Err(DdpmError::config(field, "dataset contains no images"));
    }
    if data.resolution() != config.resolution {
        return Err(DdpmError::config(
            field,
            format!("images are {}px but resolution is {}", data.resolution(), config.resolution),
        ));
    }
    if data.channels() != config.model.in_channels {
        return Err(DdpmError::config(
            field,
            format!("images have {} channels but the model expects {}", data.channels(), config.model.in_channels),
        ));
    }
    Ok(())
}

/// Mean objective over `data`, without gradients.
pub fn evaluate<B, M, D>(
    model: &M,
    data: &D,
    schedule: &NoiseSchedule,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<f64>
where
    B: Backend,
    M: Denoiser<B>,
    D: ImageDataset + ?Sized,
{
    let loader = DataLoader::new(data, config.eval_batch_size, false, config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut total = 0.0;
    let mut count = 0;
    for indices in loader.epoch_batches(0) {
        let clean = loader.load_batch::<B>(&indices, 0, device)?;
        let out = compute_loss(model, clean, schedule, config.prediction_type, &mut rng)?;
        total += out.loss.into_scalar().elem::<f64>() * indices.len() as f64;
        count += indices.len();
    }
    Ok(total / count.max(1) as f64)
}

/// Preview images from the EMA weights when available, in `[0, 1]`.
fn sample_images<B, M>(
    mut model: M,
    ema: Option<&mut ExponentialMovingAverage<B>>,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    M: Denoiser<B>,
{
    let scheduler = config.scheduler_config().init::<B, 4>()?.with_seed(SAMPLE_SEED);
    let mut pipeline = DiffusionPipeline::new(scheduler);
    let (batch, channels, res, steps) = (
        config.eval_batch_size,
        config.model.in_channels,
        config.resolution,
        config.ddpm_num_inference_steps,
    );
    let images = match ema {
        Some(ema) => {
            let swapped = ema.swap_in(&mut model)?;
            pipeline.generate(&*swapped, batch, channels, res, steps, device)
        }
        None => pipeline.generate(&model, batch, channels, res, steps, device),
    };
    Ok(images)
}
