use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

fn small_kaiming() -> Initializer {
    Initializer::KaimingUniform {
        gain: 0.1,
        fan_out_only: false,
    }
}

fn conv3x3<B: Backend>(
    channels: [usize; 2],
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(small_kaiming())
        .init(device)
}

/// Denoising network configuration.
#[derive(Config, Debug)]
pub struct UnetConfig {
    /// Image channels.
    pub channels: usize,
    /// Width of the first level; deeper levels use `2·dim` and `4·dim`.
    #[config(default = 64)]
    pub dim: usize,
    /// Concatenate a previous `x_0` estimate to the input.
    #[config(default = false)]
    pub self_condition: bool,
}

impl UnetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Unet<B> {
        let dim = self.dim;
        let time_dim = dim * 4;
        let in_channels = if self.self_condition {
            self.channels * 2
        } else {
            self.channels
        };

        Unet {
            time_mlp: TimeEmbedding::new(time_dim, device),

            down1: conv3x3([in_channels, dim], 1, device),
            down_res1: ResidualBlock::new(device, dim, time_dim),
            down2: conv3x3([dim, dim * 2], 2, device),
            down_res2: ResidualBlock::new(device, dim * 2, time_dim),
            down3: conv3x3([dim * 2, dim * 4], 2, device),
            down_res3: ResidualBlock::new(device, dim * 4, time_dim),

            mid_res1: ResidualBlock::new(device, dim * 4, time_dim),
            mid_attn: Attention::new(dim * 4, device),
            mid_res2: ResidualBlock::new(device, dim * 4, time_dim),

            up1: ConvTranspose2dConfig::new([dim * 4, dim * 2], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_initializer(small_kaiming())
                .init(device),
            up_conv1: Conv2dConfig::new([dim * 4, dim * 2], [1, 1]).init(device),
            up_res1: ResidualBlock::new(device, dim * 2, time_dim),

            up2: ConvTranspose2dConfig::new([dim * 2, dim], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_initializer(small_kaiming())
                .init(device),
            up_conv2: Conv2dConfig::new([dim * 2, dim], [1, 1]).init(device),
            up_res2: ResidualBlock::new(device, dim, time_dim),

            out_conv: conv3x3([dim, self.channels], 1, device),

            in_channels,
            out_channels: self.channels,
            time_dim,
        }
    }
}

/// Single-head self attention over spatial positions, with a residual connection.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    out: Linear<B>,
    channels: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            query: LinearConfig::new(channels, channels).init(device),
            key: LinearConfig::new(channels, channels).init(device),
            value: LinearConfig::new(channels, channels).init(device),
            out: LinearConfig::new(channels, channels).init(device),
            channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let tokens = x.clone().reshape([batch, channels, height * width]).swap_dims(1, 2);

        let q = self.query.forward(tokens.clone());
        let k = self.key.forward(tokens.clone());
        let v = self.value.forward(tokens);

        let scale = (self.channels as f32).sqrt();
        let scores = q.matmul(k.swap_dims(1, 2)) / scale;
        let weights = activation::softmax(scores, 2);

        let attended = self.out.forward(weights.matmul(v));
        let attended = attended.swap_dims(1, 2).reshape([batch, channels, height, width]);

        attended + x
    }
}

/// MLP applied on top of the sinusoidal timestep features.
#[derive(Module, Debug)]
pub struct TimeEmbedding<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
}

impl<B: Backend> TimeEmbedding<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(dim, dim * 4)
                .with_initializer(small_kaiming())
                .init(device),
            linear2: LinearConfig::new(dim * 4, dim)
                .with_initializer(small_kaiming())
                .init(device),
        }
    }

    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 2> {
        let z = self.linear1.forward(t);
        let z = activation::gelu(z);
        self.linear2.forward(z)
    }
}

/// Sinusoidal position features `[sin(t·f), cos(t·f)]` with `f_i = 10000^(-i/half)`.
pub fn sinusoidal_embedding<B: Backend>(time: Tensor<B, 1, Int>, dim: usize) -> Tensor<B, 2> {
    let device = time.device();
    let batch_size = time.dims()[0];
    let half_dim = dim / 2;

    let frequencies: Vec<f32> = (0..half_dim)
        .map(|i| {
            let exponent = (i as f32) * 4.0 * std::f32::consts::LN_10 / (half_dim as f32);
            (-exponent).exp()
        })
        .collect();

    let freqs = Tensor::<B, 1>::from_floats(frequencies.as_slice(), &device).reshape([1, half_dim]);
    let arg = time.float().reshape([batch_size, 1]) * freqs;

    Tensor::cat(vec![arg.clone().sin(), arg.cos()], 1)
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    bn2: BatchNorm<B, 2>,
    time: Linear<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(device: &B::Device, channels: usize, time_emb_dim: usize) -> Self {
        Self {
            conv1: conv3x3([channels, channels], 1, device),
            bn1: BatchNormConfig::new(channels).init(device),
            conv2: conv3x3([channels, channels], 1, device),
            bn2: BatchNormConfig::new(channels).init(device),
            time: LinearConfig::new(time_emb_dim, channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, t_emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let h = self.conv1.forward(x.clone());
        let h = self.bn1.forward(h);
        let h = activation::silu(h);

        let t = activation::silu(self.time.forward(t_emb));
        let [batch_size, channels] = t.dims();
        let h = h + t.reshape([batch_size, channels, 1, 1]);

        let h = self.conv2.forward(h);
        let h = self.bn2.forward(h);
        activation::silu(h + x)
    }
}

/// Three-level U-Net conditioned on the diffusion timestep.
///
/// Height and width must be divisible by 4.
#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    time_mlp: TimeEmbedding<B>,

    down1: Conv2d<B>,
    down_res1: ResidualBlock<B>,
    down2: Conv2d<B>,
    down_res2: ResidualBlock<B>,
    down3: Conv2d<B>,
    down_res3: ResidualBlock<B>,

    mid_res1: ResidualBlock<B>,
    mid_attn: Attention<B>,
    mid_res2: ResidualBlock<B>,

    up1: ConvTranspose2d<B>,
    up_conv1: Conv2d<B>,
    up_res1: ResidualBlock<B>,

    up2: ConvTranspose2d<B>,
    up_conv2: Conv2d<B>,
    up_res2: ResidualBlock<B>,

    out_conv: Conv2d<B>,

    in_channels: usize,
    out_channels: usize,
    time_dim: usize,
}

impl<B: Backend> Unet<B> {
    pub fn channels(&self) -> usize {
        self.out_channels
    }

    pub fn self_condition(&self) -> bool {
        self.in_channels != self.out_channels
    }

    /// Predict the objective target for `x` at timesteps `time`.
    ///
    /// When self-conditioning is enabled a missing `x_self_cond` is replaced by zeros.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        time: Tensor<B, 1, Int>,
        x_self_cond: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let x = if self.self_condition() {
            let cond = x_self_cond.unwrap_or_else(|| x.zeros_like());
            Tensor::cat(vec![cond, x], 1)
        } else {
            x
        };

        let t_emb = self.time_mlp.forward(sinusoidal_embedding(time, self.time_dim));

        let d1 = self.down_res1.forward(self.down1.forward(x), t_emb.clone());
        let d2 = self.down_res2.forward(self.down2.forward(d1.clone()), t_emb.clone());
        let d3 = self.down_res3.forward(self.down3.forward(d2.clone()), t_emb.clone());

        let m = self.mid_res1.forward(d3, t_emb.clone());
        let m = self.mid_attn.forward(m);
        let m = self.mid_res2.forward(m, t_emb.clone());

        let u1 = Tensor::cat(vec![self.up1.forward(m), d2], 1);
        let u1 = self.up_res1.forward(self.up_conv1.forward(u1), t_emb.clone());

        let u2 = Tensor::cat(vec![self.up2.forward(u1), d1], 1);
        let u2 = self.up_res2.forward(self.up_conv2.forward(u2), t_emb);

        self.out_conv.forward(u2)
    }
}
