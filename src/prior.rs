//! Deep Image Prior network: a skip encoder/decoder mapping a fixed random input to an image.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

const LEAKY_SLOPE: f64 = 0.2;

/// Scale applied to the uniform DIP input.
pub const INPUT_NOISE_SCALE: f32 = 0.1;

/// Decoder up-sampling. Bilinear has no backward pass on burn 0.16, so it is only
/// usable for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsampleMode {
    #[default]
    Nearest,
    Bilinear,
}

impl From<UpsampleMode> for InterpolateMode {
    fn from(mode: UpsampleMode) -> Self {
        match mode {
            UpsampleMode::Nearest => InterpolateMode::Nearest,
            UpsampleMode::Bilinear => InterpolateMode::Bilinear,
        }
    }
}

#[derive(Config, Debug)]
pub struct PriorNetworkConfig {
    /// Channels of the produced image.
    pub out_channels: usize,
    /// Channels of the random input.
    #[config(default = 32)]
    pub input_depth: usize,
    #[config(default = "vec![16, 32, 64, 128, 128]")]
    pub channels_down: Vec<usize>,
    #[config(default = "vec![16, 32, 64, 128, 128]")]
    pub channels_up: Vec<usize>,
    /// Width of every skip branch; zero disables skips.
    #[config(default = 4)]
    pub channels_skip: usize,
    #[config(default = "UpsampleMode::Nearest")]
    pub upsample_mode: UpsampleMode,
}

impl PriorNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PriorNetwork<B> {
        let depth = self.channels_down.len().min(self.channels_up.len());
        let mut levels = Vec::with_capacity(depth);
        let mut in_channels = self.input_depth;

        for i in 0..depth {
            let down = self.channels_down[i];
            let up = self.channels_up[i];
            let deeper_out = if i + 1 < depth {
                self.channels_up[i + 1]
            } else {
                down
            };
            let skip = (self.channels_skip > 0)
                .then(|| ConvBlock::new(in_channels, self.channels_skip, 1, 1, device));
            let merged = self.channels_skip + deeper_out;

            levels.push(PriorLevel {
                skip,
                down1: ConvBlock::new(in_channels, down, 3, 2, device),
                down2: ConvBlock::new(down, down, 3, 1, device),
                merge_bn: BatchNormConfig::new(merged).init(device),
                up1: ConvBlock::new(merged, up, 3, 1, device),
                up2: ConvBlock::new(up, up, 1, 1, device),
            });
            in_channels = down;
        }

        let head_in = self.channels_up.first().copied().unwrap_or(self.input_depth);
        PriorNetwork {
            levels,
            head: Conv2dConfig::new([head_in, self.out_channels], [1, 1]).init(device),
            input_depth: self.input_depth,
            upsample: Ignored(self.upsample_mode),
        }
    }
}

/// Convolution, batch norm and leaky ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let pad = kernel / 2;
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        activation::leaky_relu(self.bn.forward(self.conv.forward(x)), LEAKY_SLOPE)
    }
}

#[derive(Module, Debug)]
pub struct PriorLevel<B: Backend> {
    skip: Option<ConvBlock<B>>,
    down1: ConvBlock<B>,
    down2: ConvBlock<B>,
    merge_bn: BatchNorm<B, 2>,
    up1: ConvBlock<B>,
    up2: ConvBlock<B>,
}

#[derive(Module, Debug)]
pub struct PriorNetwork<B: Backend> {
    levels: Vec<PriorLevel<B>>,
    head: Conv2d<B>,
    input_depth: usize,
    upsample: Ignored<UpsampleMode>,
}

impl<B: Backend> PriorNetwork<B> {
    pub fn input_depth(&self) -> usize {
        self.input_depth
    }

    pub fn out_channels(&self) -> usize {
        self.head.weight.dims()[0]
    }

    pub fn upsample_mode(&self) -> UpsampleMode {
        self.upsample.0
    }

    /// Map `[B, input_depth, H, W]` to `[B, out_channels, H, W]` with values in `(0, 1)`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.levels.len());
        let mut x = input;

        for level in &self.levels {
            let [_, _, height, width] = x.dims();
            skips.push((level.skip.as_ref().map(|s| s.forward(x.clone())), [height, width]));
            x = level.down2.forward(level.down1.forward(x));
        }

        for (level, (skip, size)) in self.levels.iter().zip(skips).rev() {
            let up = interpolate(x, size, InterpolateOptions::new(self.upsample_mode().into()));
            let merged = match skip {
                Some(skip) => Tensor::cat(vec![skip, up], 1),
                None => up,
            };
            let merged = level.merge_bn.forward(merged);
            x = level.up2.forward(level.up1.forward(merged));
        }

        activation::sigmoid(self.head.forward(x))
    }
}

/// Fresh DIP input of shape `[1, depth, height, width]`, uniform in `[0, 0.1)`.
pub fn dip_input<B: Backend>(
    depth: usize,
    [height, width]: [usize; 2],
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::random([1, depth, height, width], Distribution::Uniform(0.0, 1.0), device)
        .mul_scalar(INPUT_NOISE_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::GradientsParams;

    type TestBackend = NdArray;

    fn small_config(out_channels: usize) -> PriorNetworkConfig {
        PriorNetworkConfig::new(out_channels)
            .with_input_depth(4)
            .with_channels_down(vec![4, 8, 8])
            .with_channels_up(vec![4, 8, 8])
            .with_channels_skip(2)
    }

    #[test]
    fn test_prior_output_matches_input_resolution() {
        let device = Default::default();
        let prior = small_config(3).init::<TestBackend>(&device);
        let input = dip_input::<TestBackend>(4, [12, 10], &device);
        let out = prior.forward(input);
        assert_eq!(out.dims(), [1, 3, 12, 10]);

        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_prior_without_skips_trains_on_autodiff() {
        let device = Default::default();
        let prior = small_config(1)
            .with_channels_skip(0)
            .init::<Autodiff<TestBackend>>(&device);
        let input = dip_input::<Autodiff<TestBackend>>(4, [8, 8], &device);
        let loss = prior.forward(input).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &prior);
        assert!(grads.len() > 0);
    }

    #[test]
    fn test_default_prior_trains_on_autodiff() {
        let device = Default::default();
        let config = PriorNetworkConfig::new(1);
        assert_eq!(config.upsample_mode, UpsampleMode::Nearest);

        let prior = config.init::<Autodiff<TestBackend>>(&device);
        assert_eq!(prior.upsample_mode(), UpsampleMode::Nearest);
        let input = dip_input::<Autodiff<TestBackend>>(config.input_depth, [32, 32], &device);
        let out = prior.forward(input);
        assert_eq!(out.dims(), [1, 1, 32, 32]);

        let grads = GradientsParams::from_grads(out.mean().backward(), &prior);
        assert!(grads.len() > 0);
    }

    #[test]
    fn test_bilinear_mode_survives_init() {
        let device = Default::default();
        let prior = small_config(3)
            .with_upsample_mode(UpsampleMode::Bilinear)
            .init::<TestBackend>(&device);
        assert_eq!(prior.upsample_mode(), UpsampleMode::Bilinear);
        let out = prior.forward(dip_input::<TestBackend>(4, [8, 8], &device));
        assert_eq!(out.dims(), [1, 3, 8, 8]);
    }

    #[test]
    fn test_dip_input_range() {
        let device = Default::default();
        let input = dip_input::<TestBackend>(2, [4, 4], &device);
        assert_eq!(input.dims(), [1, 2, 4, 4]);
        let values: Vec<f32> = input.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..INPUT_NOISE_SCALE).contains(v)));
    }
}
