//! Trains the diffusion model on images paired with their cached learned noise.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::config::Config;
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dip_diffusion::data::ImageFolder;
use dip_diffusion::noise_cache::NoiseCache;
use dip_diffusion::prior::PriorNetworkConfig;
use dip_diffusion::schedule::{BetaSchedule, Objective};
use dip_diffusion::unet::UnetConfig;
use dip_diffusion::{
    DiffusionConfig, DiffusionModel, DiffusionModelConfig, ExperimentConfig, Trainer,
    TrainerConfig,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Cpu,
    Gpu,
}

#[derive(Parser)]
#[command(name = "dip-train")]
#[command(about = "Train a diffusion model on Deep Image Prior noise")]
struct Cli {
    #[arg(long)]
    images: PathBuf,

    /// Cache written by dip-generate-noise
    #[arg(long)]
    noise_dir: PathBuf,

    /// Checkpoints, sample grids and config.json go here
    #[arg(long, default_value = "results")]
    results: PathBuf,

    /// Experiment file to use instead of the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Milestone to resume from, e.g. "3" or "latest"
    #[arg(long)]
    resume: Option<String>,

    #[arg(long, default_value = "128")]
    image_size: usize,

    #[arg(long, default_value = "3")]
    channels: usize,

    /// Base width of the U-Net
    #[arg(long, default_value = "64")]
    dim: usize,

    #[arg(long, default_value = "1000")]
    timesteps: usize,

    /// Fewer than --timesteps samples with DDIM
    #[arg(long)]
    sampling_timesteps: Option<usize>,

    /// pred_noise, pred_x0 or pred_v
    #[arg(long, default_value = "pred_v")]
    objective: Objective,

    /// linear, cosine or sigmoid
    #[arg(long, default_value = "sigmoid")]
    beta_schedule: BetaSchedule,

    #[arg(long, default_value = "16")]
    batch_size: usize,

    #[arg(long, default_value = "1")]
    gradient_accumulate_every: usize,

    #[arg(long, default_value = "1e-4")]
    lr: f64,

    #[arg(long, default_value = "100000")]
    steps: usize,

    #[arg(long, default_value = "1000")]
    save_and_sample_every: usize,

    #[arg(long, default_value = "25")]
    num_samples: usize,

    #[arg(long)]
    no_fid: bool,

    #[arg(long, default_value = "50000")]
    num_fid_samples: usize,

    #[arg(long)]
    save_best_and_latest_only: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value = "gpu")]
    device: Device,
}

impl Cli {
    fn experiment(&self) -> Result<ExperimentConfig> {
        if let Some(path) = &self.config {
            return ExperimentConfig::load(path)
                .with_context(|| format!("reading experiment file {}", path.display()));
        }

        let model = DiffusionModelConfig::new(
            UnetConfig::new(self.channels).with_dim(self.dim),
            PriorNetworkConfig::new(self.channels),
        );
        let diffusion = DiffusionConfig::new(self.image_size)
            .with_timesteps(self.timesteps)
            .with_sampling_timesteps(self.sampling_timesteps)
            .with_objective(self.objective)
            .with_beta_schedule(self.beta_schedule);
        let trainer = TrainerConfig::new()
            .with_train_batch_size(self.batch_size)
            .with_gradient_accumulate_every(self.gradient_accumulate_every)
            .with_train_lr(self.lr)
            .with_train_num_steps(self.steps)
            .with_save_and_sample_every(self.save_and_sample_every)
            .with_num_samples(self.num_samples)
            .with_calculate_fid(!self.no_fid)
            .with_num_fid_samples(self.num_fid_samples)
            .with_save_best_and_latest_only(self.save_best_and_latest_only)
            .with_seed(self.seed);
        Ok(ExperimentConfig::new(model, diffusion, trainer))
    }
}

fn run<B: AutodiffBackend>(cli: &Cli, experiment: ExperimentConfig, device: B::Device) -> Result<()> {
    experiment
        .save_to(&cli.results)
        .with_context(|| format!("writing config to {}", cli.results.display()))?;

    let diffusion = experiment.diffusion()?;
    let model = experiment.model.init::<B>(&device);
    let optim = experiment.trainer.optimizer().init::<B, DiffusionModel<B>>();
    let dataset = ImageFolder::new(
        &cli.images,
        NoiseCache::new(&cli.noise_dir)?,
        experiment.diffusion.image_size,
        experiment.model.unet.channels,
        experiment.trainer.augment_horizontal_flip,
    )
    .with_context(|| format!("indexing {}", cli.images.display()))?;

    let mut trainer = Trainer::new(
        model,
        optim,
        diffusion,
        dataset,
        experiment.trainer.clone(),
        &cli.results,
        &device,
    )?;
    if let Some(milestone) = &cli.resume {
        trainer
            .load(milestone)
            .with_context(|| format!("resuming from milestone {milestone}"))?;
        info!(milestone, step = trainer.step(), "resumed");
    }

    trainer.train()?;
    println!("Training complete, results in {}", cli.results.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let experiment = cli.experiment()?;
    match cli.device {
        Device::Gpu => run::<Autodiff<Wgpu>>(&cli, experiment, WgpuDevice::default()),
        Device::Cpu => run::<Autodiff<NdArray>>(&cli, experiment, NdArrayDevice::Cpu),
    }
}
