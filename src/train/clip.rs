use core::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};

/// Scale all gradients so that their joint L2 norm is at most `max_norm`.
///
/// Returns the clipped gradients and the norm measured before clipping.
pub fn clip_grad_norm<B, M>(module: &M, mut grads: GradientsParams, max_norm: f64) -> (GradientsParams, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut norm = SquaredNorm::<B> {
        grads: &grads,
        total: 0.0,
        _b: PhantomData,
    };
    module.visit(&mut norm);
    let total = norm.total.sqrt();

    let scale = max_norm / (total + 1e-6);
    if scale < 1.0 {
        module.visit(&mut Rescale::<B> {
            grads: &mut grads,
            scale,
            _b: PhantomData,
        });
    }
    (grads, total)
}

struct SquaredNorm<'a, B> {
    grads: &'a GradientsParams,
    total: f64,
    _b: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct Rescale<'a, B> {
    grads: &'a mut GradientsParams,
    scale: f64,
    _b: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.scale));
        }
    }
}
