//! Training hyper-parameters and the experiment file written next to checkpoints.

use std::path::Path;

use burn::config::Config;
use burn::grad_clipping::GradientClippingConfig;
use burn::optim::AdamConfig;

use crate::diffusion::{DiffusionConfig, DiffusionModelConfig, GaussianDiffusion};
use crate::error::Result;

pub const EXPERIMENT_FILE: &str = "config.json";

#[derive(Config, Debug)]
pub struct TrainerConfig {
    #[config(default = 16)]
    pub train_batch_size: usize,
    #[config(default = 1)]
    pub gradient_accumulate_every: usize,
    #[config(default = true)]
    pub augment_horizontal_flip: bool,
    #[config(default = 1e-4)]
    pub train_lr: f64,
    #[config(default = 100000)]
    pub train_num_steps: usize,
    #[config(default = 10)]
    pub ema_update_every: usize,
    #[config(default = 0.995)]
    pub ema_decay: f64,
    #[config(default = 100)]
    pub ema_update_after_step: usize,
    #[config(default = 0.9)]
    pub adam_beta1: f32,
    #[config(default = 0.99)]
    pub adam_beta2: f32,
    #[config(default = 1000)]
    pub save_and_sample_every: usize,
    /// Must be a perfect square so the sample grid is square.
    #[config(default = 25)]
    pub num_samples: usize,
    #[config(default = true)]
    pub calculate_fid: bool,
    #[config(default = 50000)]
    pub num_fid_samples: usize,
    /// Side of the pooled grid the FID features are taken from.
    #[config(default = 4)]
    pub fid_feature_grid: usize,
    /// Keep only `best` and `latest` checkpoints instead of one per milestone.
    #[config(default = false)]
    pub save_best_and_latest_only: bool,
    /// Norm bound applied to each parameter tensor on its own, not to the global
    /// gradient norm. `None` disables clipping.
    #[config(default = "Some(1.0)")]
    pub max_grad_norm: Option<f32>,
    /// Batches decoded ahead of the training loop.
    #[config(default = 2)]
    pub prefetch: usize,
    /// Seeds the batch order; entropy when unset.
    pub seed: Option<u64>,
}

impl TrainerConfig {
    pub fn optimizer(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.adam_beta1)
            .with_beta_2(self.adam_beta2)
            .with_grad_clipping(self.max_grad_norm.map(GradientClippingConfig::Norm))
    }

    pub fn effective_batch_size(&self) -> usize {
        self.train_batch_size * self.gradient_accumulate_every
    }
}

/// Everything needed to rebuild a run, stored as `config.json` in the results folder.
#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub model: DiffusionModelConfig,
    pub diffusion: DiffusionConfig,
    pub trainer: TrainerConfig,
}

impl ExperimentConfig {
    pub fn diffusion(&self) -> Result<GaussianDiffusion> {
        GaussianDiffusion::new(self.diffusion.clone(), self.model.prior_config())
    }

    pub fn save_to(&self, folder: impl AsRef<Path>) -> Result<()> {
        self.save(folder.as_ref().join(EXPERIMENT_FILE))?;
        Ok(())
    }

    pub fn load_from(folder: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::load(folder.as_ref().join(EXPERIMENT_FILE))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::PriorNetworkConfig;
    use crate::schedule::Objective;
    use crate::unet::UnetConfig;

    #[test]
    fn test_defaults() {
        let config = TrainerConfig::new();
        assert_eq!(config.train_batch_size, 16);
        assert_eq!(config.effective_batch_size(), 16);
        assert_eq!(config.num_samples, 25);
        assert_eq!(config.max_grad_norm, Some(1.0));
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_optimizer_clips_per_parameter_norm() {
        let clipping = |config: TrainerConfig| {
            serde_json::to_value(config.optimizer()).unwrap()["grad_clipping"].clone()
        };
        assert_eq!(clipping(TrainerConfig::new()), serde_json::json!({ "Norm": 1.0 }));
        assert!(clipping(TrainerConfig::new().with_max_grad_norm(None)).is_null());
    }

    #[test]
    fn test_experiment_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let experiment = ExperimentConfig::new(
            DiffusionModelConfig::new(UnetConfig::new(3), PriorNetworkConfig::new(3)),
            DiffusionConfig::new(32).with_objective(Objective::PredNoise),
            TrainerConfig::new().with_train_num_steps(10).with_max_grad_norm(None),
        );
        experiment.save_to(dir.path()).unwrap();
        assert!(dir.path().join(EXPERIMENT_FILE).exists());

        let loaded = ExperimentConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.trainer.train_num_steps, 10);
        assert_eq!(loaded.trainer.max_grad_norm, None);
        assert_eq!(loaded.diffusion.objective, Objective::PredNoise);
        assert_eq!(loaded.model.unet.channels, 3);
        assert!(loaded.diffusion().is_ok());
    }
}
