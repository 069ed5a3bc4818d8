use serde::{Deserialize, Serialize};

/// Progress counters persisted with every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed optimization steps.
    pub global_step: usize,
    /// Epoch the last optimization step happened in.
    pub epoch: usize,
    /// Learning-rate scheduler position.
    pub lr_step: usize,
    /// EMA updates applied, when EMA is enabled.
    pub ema_optimization_step: Option<usize>,
}

/// Where a run picks up in the data stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePoint {
    pub first_epoch: usize,
    /// Micro-batches of `first_epoch` that were already consumed.
    pub resume_step: usize,
}

/// How batches map onto optimization steps.
///
/// One optimization step consumes `accumulation_steps` micro-batches; the
/// last step of an epoch may consume fewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochLayout {
    pub batches_per_epoch: usize,
    pub accumulation_steps: usize,
}

impl EpochLayout {
    pub fn new(batches_per_epoch: usize, accumulation_steps: usize) -> Self {
        Self {
            batches_per_epoch,
            accumulation_steps: accumulation_steps.max(1),
        }
    }

    pub fn update_steps_per_epoch(&self) -> usize {
        self.batches_per_epoch.div_ceil(self.accumulation_steps)
    }

    pub fn max_train_steps(&self, num_epochs: usize) -> usize {
        self.update_steps_per_epoch() * num_epochs
    }

    /// Whether micro-batch `step` of an epoch closes an optimization step.
    pub fn is_sync_step(&self, step: usize) -> bool {
        (step + 1) % self.accumulation_steps == 0 || step + 1 == self.batches_per_epoch
    }

    /// Position reached after `global_step` optimization steps.
    pub fn resume_point(&self, global_step: usize) -> ResumePoint {
        let per_epoch = self.update_steps_per_epoch().max(1);
        let resume_global_step = global_step * self.accumulation_steps;
        ResumePoint {
            first_epoch: global_step / per_epoch,
            resume_step: resume_global_step % (per_epoch * self.accumulation_steps),
        }
    }
}
