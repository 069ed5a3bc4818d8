use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn_store::{ModuleSnapshot, SafetensorsStore};

use crate::diffusion::DdpmSchedulerConfig;
use crate::error::{DdpmError, Result};
use crate::model::{UNet2DConfig, UNet2DModel};

const WEIGHTS_FILE: &str = "model.safetensors";
const MODEL_CONFIG_FILE: &str = "config.json";
const SCHEDULER_CONFIG_FILE: &str = "scheduler_config.json";

/// Paths of an exported sampling pipeline below `output_dir`.
#[derive(Debug, Clone)]
pub struct PipelineLayout {
    pub root: PathBuf,
}

impl PipelineLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn weights(&self) -> PathBuf { self.root.join("unet").join(WEIGHTS_FILE) }
    pub fn model_config(&self) -> PathBuf { self.root.join("unet").join(MODEL_CONFIG_FILE) }
    pub fn scheduler_config(&self) -> PathBuf { self.root.join(SCHEDULER_CONFIG_FILE) }
}

/// Export weights (usually the EMA-merged ones) plus the configs needed to sample from them.
pub fn save_pipeline<B: Backend, M: Module<B>>(
    root: &Path,
    model: &M,
    model_config: &UNet2DConfig,
    scheduler_config: &DdpmSchedulerConfig,
) -> Result<()> {
    let layout = PipelineLayout::new(root);
    fs::create_dir_all(root.join("unet"))?;
    let mut store = SafetensorsStore::from_file(layout.weights()).overwrite(true);
    model
        .save_into(&mut store)
        .map_err(|err| DdpmError::Store(format!("{err:?}")))?;
    model_config.save(layout.model_config())?;
    scheduler_config.save(layout.scheduler_config())?;
    tracing::info!("exported pipeline to {}", root.display());
    Ok(())
}

/// A pipeline read back from disk.
#[derive(Debug)]
pub struct ExportedPipeline<B: Backend> {
    pub model: UNet2DModel<B>,
    pub model_config: UNet2DConfig,
    pub scheduler_config: DdpmSchedulerConfig,
}

/// Rebuild the UNet and sampler config exported by [`save_pipeline`].
pub fn load_pipeline<B: Backend>(root: &Path, device: &B::Device) -> Result<ExportedPipeline<B>> {
    let layout = PipelineLayout::new(root);
    let model_config = UNet2DConfig::load(layout.model_config())
        .map_err(|err| DdpmError::config("model_config", format!("{err:?}")))?;
    let scheduler_config = DdpmSchedulerConfig::load(layout.scheduler_config())
        .map_err(|err| DdpmError::config("scheduler_config", format!("{err:?}")))?;
    model_config.validate()?;

    let mut model = model_config.init::<B>(device);
    let mut store = SafetensorsStore::from_file(layout.weights());
    let applied = model
        .load_from(&mut store)
        .map_err(|err| DdpmError::Store(format!("{err:?}")))?;
    if !applied.errors.is_empty() {
        return Err(DdpmError::Store(format!("{:?}", applied.errors)));
    }
    if !applied.missing.is_empty() {
        return Err(DdpmError::Store(format!("missing tensors: {:?}", applied.missing)));
    }
    Ok(ExportedPipeline {
        model,
        model_config,
        scheduler_config,
    })
}
