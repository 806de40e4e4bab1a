//! Draws a sample grid from the EMA weights of a training milestone.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{NdArray, Wgpu};
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use dip_diffusion::checkpoint::load_ema_model;
use dip_diffusion::image_io::save_image_grid;
use dip_diffusion::noise::SamplingNoise;
use dip_diffusion::utils::grid_side;
use dip_diffusion::ExperimentConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InitialNoise {
    Gaussian,
    Prior,
}

#[derive(Parser)]
#[command(name = "dip-sample")]
#[command(about = "Sample images from a trained checkpoint")]
struct Cli {
    /// Results folder holding config.json and the checkpoints
    #[arg(long, default_value = "results")]
    results: PathBuf,

    #[arg(long, default_value = "latest")]
    milestone: String,

    #[arg(long, default_value = "16")]
    num_samples: usize,

    /// Override the experiment's sampling steps; fewer than the training steps uses DDIM
    #[arg(long)]
    sampling_timesteps: Option<usize>,

    /// Source of x_T, defaults to the experiment's setting
    #[arg(long, value_enum)]
    initial_noise: Option<InitialNoise>,

    #[arg(short, long, default_value = "samples.png")]
    output: PathBuf,

    #[arg(long, value_enum, default_value = "gpu")]
    device: Device,
}

fn run<B: Backend>(cli: &Cli, mut experiment: ExperimentConfig, device: B::Device) -> Result<()> {
    if cli.sampling_timesteps.is_some() {
        experiment.diffusion.sampling_timesteps = cli.sampling_timesteps;
    }
    match cli.initial_noise {
        Some(InitialNoise::Gaussian) => experiment.diffusion.sampling_noise = SamplingNoise::Gaussian,
        Some(InitialNoise::Prior) => experiment.diffusion.sampling_noise = SamplingNoise::LearnedPrior,
        None => {}
    }

    let diffusion = experiment.diffusion()?;
    let model = load_ema_model::<B>(&cli.results, &cli.milestone, &experiment.model, &device)
        .with_context(|| format!("loading milestone {} from {}", cli.milestone, cli.results.display()))?;

    let samples = diffusion.sample(&model, cli.num_samples, &device);
    save_image_grid(samples, grid_side(cli.num_samples).max(1), &cli.output)
        .with_context(|| format!("writing {}", cli.output.display()))?;
    println!("Saved {} samples to {}", cli.num_samples, cli.output.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let experiment = ExperimentConfig::load_from(&cli.results)
        .with_context(|| format!("reading config from {}", cli.results.display()))?;
    match cli.device {
        Device::Gpu => run::<Wgpu>(&cli, experiment, WgpuDevice::default()),
        Device::Cpu => run::<NdArray>(&cli, experiment, NdArrayDevice::Cpu),
    }
}
