//! Denoising diffusion (DDPM) training on Burn.
//!
//! Noise schedule and forward process live in [`diffusion`], the parameter
//! moving average in [`ema`], and the resumable training loop in [`train`].

pub mod data;
pub mod diffusion;
pub mod dist;
pub mod ema;
pub mod error;
pub mod model;
pub mod tracker;
pub mod train;

pub use error::{DdpmError, Result};
