mod unet;

pub use unet::*;

use burn::module::Module;
use burn::tensor::{backend::Backend, Int, Tensor};

/// A network mapping `(noisy batch, integer timesteps)` to a prediction with
/// the batch's shape.
pub trait Denoiser<B: Backend>: Module<B> {
    fn denoise(&self, noisy: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4>;
}
