use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::silu;
use burn::tensor::{backend::Backend, Int, Tensor};

use super::Denoiser;
use crate::error::{DdpmError, Result};

/// Residual UNet with sinusoidal timestep conditioning.
#[derive(Config, Debug)]
pub struct UNet2DConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 3)]
    pub out_channels: usize,
    /// Channel width per resolution level, from full resolution down.
    #[config(default = "vec![128, 256, 512, 512]")]
    pub block_out_channels: Vec<usize>,
    #[config(default = 2)]
    pub layers_per_block: usize,
    #[config(default = 32)]
    pub norm_num_groups: usize,
    /// Spatial size of the square inputs the model is trained on.
    #[config(default = 64)]
    pub sample_size: usize,
}

impl UNet2DConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_out_channels.is_empty() {
            return Err(DdpmError::config("block_out_channels", "at least one level is required"));
        }
        if self.layers_per_block == 0 {
            return Err(DdpmError::config("layers_per_block", "must be at least 1"));
        }
        if self.norm_num_groups == 0 {
            return Err(DdpmError::config("norm_num_groups", "must be at least 1"));
        }
        if let Some(c) = self.block_out_channels.iter().find(|c| **c == 0 || *c % self.norm_num_groups != 0) {
            return Err(DdpmError::config(
                "block_out_channels",
                format!("{c} channels is not a positive multiple of {} groups", self.norm_num_groups),
            ));
        }
        if self.block_out_channels[0] % 2 != 0 {
            return Err(DdpmError::config(
                "block_out_channels",
                format!("base width {} must be even for the sinusoidal timestep embedding", self.block_out_channels[0]),
            ));
        }
        let factor = 1usize << (self.block_out_channels.len() - 1);
        if self.sample_size == 0 || self.sample_size % factor != 0 {
            return Err(DdpmError::config(
                "sample_size",
                format!("{} is not divisible by the total downsampling factor {factor}", self.sample_size),
            ));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet2DModel<B> {
        let channels = &self.block_out_channels;
        let base = channels[0];
        let time_dim = base * 4;
        let groups = self.norm_num_groups;
        let levels = channels.len();

        let mut down_blocks = Vec::with_capacity(levels);
        let mut in_ch = base;
        for (i, &out_ch) in channels.iter().enumerate() {
            let resnets = (0..self.layers_per_block)
                .map(|j| ResnetBlock::new(if j == 0 { in_ch } else { out_ch }, out_ch, time_dim, groups, device))
                .collect();
            let downsample = (i + 1 < levels).then(|| {
                Conv2dConfig::new([out_ch, out_ch], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            });
            down_blocks.push(DownBlock { resnets, downsample });
            in_ch = out_ch;
        }

        let deepest = channels[levels - 1];
        let mid_blocks = (0..2)
            .map(|_| ResnetBlock::new(deepest, deepest, time_dim, groups, device))
            .collect();

        let mut up_blocks = Vec::with_capacity(levels);
        let mut current = deepest;
        for i in (0..levels).rev() {
            let out_ch = channels[i];
            let resnets = (0..self.layers_per_block)
                .map(|j| {
                    let input = if j == 0 { current + out_ch } else { out_ch };
                    ResnetBlock::new(input, out_ch, time_dim, groups, device)
                })
                .collect();
            let upsample = (i > 0).then(|| {
                ConvTranspose2dConfig::new([out_ch, out_ch], [4, 4])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .init(device)
            });
            up_blocks.push(UpBlock { resnets, upsample });
            current = out_ch;
        }

        UNet2DModel {
            conv_in: conv3x3(self.in_channels, base, device),
            time_embedding: TimestepEmbedding {
                linear_1: LinearConfig::new(base, time_dim).init(device),
                linear_2: LinearConfig::new(time_dim, time_dim).init(device),
                channels: base,
            },
            down_blocks,
            mid_blocks,
            up_blocks,
            norm_out: GroupNormConfig::new(groups, base).init(device),
            conv_out: conv3x3(base, self.out_channels, device),
        }
    }
}

fn conv3x3<B: Backend>(input: usize, output: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([input, output], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Sinusoidal features `[cos(t * f_i), sin(t * f_i)]`, `f_i = 10000^(-i / half)`.
pub fn timestep_features<B: Backend>(timesteps: Tensor<B, 1, Int>, dim: usize) -> Tensor<B, 2> {
    let device = timesteps.device();
    let [batch] = timesteps.dims();
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000f32.ln()) * i as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device).reshape([1, half]);
    let args = timesteps.float().reshape([batch, 1]) * freqs;
    Tensor::cat(vec![args.clone().cos(), args.sin()], 1)
}

#[derive(Module, Debug)]
pub struct TimestepEmbedding<B: Backend> {
    linear_1: Linear<B>,
    linear_2: Linear<B>,
    channels: usize,
}

impl<B: Backend> TimestepEmbedding<B> {
    pub fn forward(&self, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let x = timestep_features(timesteps, self.channels);
        self.linear_2.forward(silu(self.linear_1.forward(x)))
    }
}

/// GroupNorm/SiLU/conv residual block with an additive timestep projection.
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    time_proj: Linear<B>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    fn new(input: usize, output: usize, time_dim: usize, groups: usize, device: &B::Device) -> Self {
        Self {
            norm1: GroupNormConfig::new(groups, input).init(device),
            conv1: conv3x3(input, output, device),
            time_proj: LinearConfig::new(time_dim, output).init(device),
            norm2: GroupNormConfig::new(groups, output).init(device),
            conv2: conv3x3(output, output, device),
            shortcut: (input != output).then(|| Conv2dConfig::new([input, output], [1, 1]).init(device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        let h = self.conv1.forward(silu(self.norm1.forward(x.clone())));
        let [batch, channels] = [h.dims()[0], h.dims()[1]];
        let t = self.time_proj.forward(silu(temb)).reshape([batch, channels, 1, 1]);
        let h = self.conv2.forward(silu(self.norm2.forward(h + t)));
        let skip = match &self.shortcut {
            Some(conv) => conv.forward(x),
            None => x,
        };
        skip + h
    }
}

#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    resnets: Vec<ResnetBlock<B>>,
    downsample: Option<Conv2d<B>>,
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    resnets: Vec<ResnetBlock<B>>,
    upsample: Option<ConvTranspose2d<B>>,
}

#[derive(Module, Debug)]
pub struct UNet2DModel<B: Backend> {
    conv_in: Conv2d<B>,
    time_embedding: TimestepEmbedding<B>,
    down_blocks: Vec<DownBlock<B>>,
    mid_blocks: Vec<ResnetBlock<B>>,
    up_blocks: Vec<UpBlock<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> UNet2DModel<B> {
    pub fn forward(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        let temb = self.time_embedding.forward(timesteps);
        let mut h = self.conv_in.forward(x);

        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for block in &self.down_blocks {
            for resnet in &block.resnets {
                h = resnet.forward(h, temb.clone());
            }
            skips.push(h.clone());
            if let Some(down) = &block.downsample {
                h = down.forward(h);
            }
        }

        for resnet in &self.mid_blocks {
            h = resnet.forward(h, temb.clone());
        }

        for (block, skip) in self.up_blocks.iter().zip(skips.into_iter().rev()) {
            h = Tensor::cat(vec![h, skip], 1);
            for resnet in &block.resnets {
                h = resnet.forward(h, temb.clone());
            }
            if let Some(up) = &block.upsample {
                h = up.forward(h);
            }
        }

        self.conv_out.forward(silu(self.norm_out.forward(h)))
    }
}

impl<B: Backend> Denoiser<B> for UNet2DModel<B> {
    fn denoise(&self, noisy: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        self.forward(noisy, timesteps)
    }
}
