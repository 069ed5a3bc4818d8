use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burn_ddpm::diffusion::DiffusionPipeline;
use burn_ddpm::train::load_pipeline;
use burn_ddpm::tracker::{make_grid, to_rgb8};

type B = NdArray<f32>;

#[derive(Parser, Debug)]
#[command(name = "ddpm_sample", version, about = "Generate images from an exported DDPM pipeline")]
struct Args {
    /// Output directory of a training run (contains `unet/` and `scheduler_config.json`)
    #[arg(value_name = "DIR")]
    pipeline_dir: PathBuf,
    /// Where the PNG files are written
    #[arg(short = 'o', long = "out", default_value = "samples")]
    out_dir: PathBuf,
    #[arg(short = 'n', long, default_value_t = 16)]
    num_images: usize,
    #[arg(long, default_value_t = 1000)]
    num_inference_steps: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
    let args = Args::parse();
    let device = Default::default();

    let exported = load_pipeline::<B>(&args.pipeline_dir, &device)
        .with_context(|| format!("load pipeline from {}", args.pipeline_dir.display()))?;
    let scheduler = exported.scheduler_config.init::<B, 4>()?.with_seed(args.seed);
    let mut pipeline = DiffusionPipeline::new(scheduler);

    tracing::info!("sampling {} images with {} steps", args.num_images, args.num_inference_steps);
    let images = pipeline.generate(
        &exported.model,
        args.num_images,
        exported.model_config.in_channels,
        exported.model_config.sample_size,
        args.num_inference_steps,
        &device,
    );
    let images = to_rgb8(images)?;

    std::fs::create_dir_all(&args.out_dir)?;
    for (i, img) in images.iter().enumerate() {
        img.save(args.out_dir.join(format!("sample_{i:04}.png")))?;
    }
    make_grid(&images)?.save(args.out_dir.join("grid.png"))?;
    tracing::info!("wrote {} images to {}", images.len(), args.out_dir.display());
    Ok(())
}
