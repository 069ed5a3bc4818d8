use burn::optim::GradientsParams;

use crate::error::Result;

/// The set of processes sharing one training run.
///
/// Only the main process writes checkpoints, snapshots and samples.
pub trait ProcessGroup {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    fn barrier(&self) -> Result<()>;

    /// Average gradients across processes before the optimizer step.
    fn all_reduce_mean(&self, grads: GradientsParams) -> Result<GradientsParams>;
}

/// Single-process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcess;

impl ProcessGroup for LocalProcess {
    fn rank(&self) -> usize { 0 }
    fn world_size(&self) -> usize { 1 }
    fn barrier(&self) -> Result<()> { Ok(()) }
    fn all_reduce_mean(&self, grads: GradientsParams) -> Result<GradientsParams> { Ok(grads) }
}
