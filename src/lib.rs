//! Denoising diffusion whose noise is learned per image by a Deep Image Prior.
//!
//! The workflow has two stages. [`noise_cache::populate`] fits a small prior network to
//! every training image and stores the standardized residual as that image's noise.
//! [`trainer::Trainer`] then trains a [`diffusion::DiffusionModel`] on `(image, noise)`
//! pairs and samples from an EMA copy starting at prior-generated noise.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod diffusion;
pub mod dip_trainer;
pub mod ema;
pub mod error;
pub mod fid;
pub mod image_io;
pub mod noise;
pub mod noise_cache;
pub mod prior;
pub mod schedule;
pub mod trainer;
pub mod unet;
pub mod utils;

pub use config::{ExperimentConfig, TrainerConfig};
pub use diffusion::{DiffusionConfig, DiffusionModel, DiffusionModelConfig, GaussianDiffusion};
pub use error::{Error, Result};
pub use trainer::{Phase, Trainer};
