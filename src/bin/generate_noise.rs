//! Fits a Deep Image Prior to every image in a folder and caches the learned noise.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use dip_diffusion::dip_trainer::DipTrainerConfig;
use dip_diffusion::noise_cache::{populate, NoiseCache, NoiseGenerationConfig};
use dip_diffusion::prior::PriorNetworkConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Cpu,
    Gpu,
}

#[derive(Parser)]
#[command(name = "dip-generate-noise")]
#[command(about = "Populate the learned-noise cache for an image folder")]
struct Cli {
    /// Folder scanned recursively for jpg, jpeg, png and tiff images
    #[arg(long)]
    images: PathBuf,

    /// Cache directory receiving one <stem>.safetensors per image
    #[arg(long)]
    noise_dir: PathBuf,

    /// Images are resized and centre-cropped to this size, as in training
    #[arg(long, default_value = "128")]
    image_size: usize,

    #[arg(long, default_value = "3")]
    channels: usize,

    /// Prior fitting steps per image
    #[arg(long, default_value = "100")]
    steps: usize,

    #[arg(long, default_value = "1e-4")]
    lr: f64,

    /// Depth of the random prior input
    #[arg(long, default_value = "32")]
    input_depth: usize,

    #[arg(long, value_enum, default_value = "gpu")]
    device: Device,
}

fn run<B: AutodiffBackend>(cli: &Cli, device: B::Device) -> Result<()> {
    let cache = NoiseCache::new(&cli.noise_dir)
        .with_context(|| format!("creating noise cache {}", cli.noise_dir.display()))?;
    let config = NoiseGenerationConfig::new(
        cli.image_size,
        PriorNetworkConfig::new(cli.channels).with_input_depth(cli.input_depth),
        DipTrainerConfig::new().with_learning_rate(cli.lr),
    )
    .with_channels(cli.channels)
    .with_steps(cli.steps);

    let summary = populate::<B>(&cache, &cli.images, &config, &device)
        .with_context(|| format!("generating noise for {}", cli.images.display()))?;
    println!(
        "Generated {} noise artifacts, {} already cached",
        summary.generated, summary.skipped
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.device {
        Device::Gpu => run::<Autodiff<Wgpu>>(&cli, WgpuDevice::default()),
        Device::Cpu => run::<Autodiff<NdArray>>(&cli, NdArrayDevice::Cpu),
    }
}
