//! Outer training loop: accumulate, step, track the EMA, sample and checkpoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::checkpoint::{load_checkpoint, save_checkpoint, TrainingState};
use crate::config::TrainerConfig;
use crate::data::{BatchStream, ImageFolder, ShuffledBatches};
use crate::diffusion::{DiffusionModel, GaussianDiffusion};
use crate::ema::Ema;
use crate::error::{Error, Result};
use crate::fid::{FidEvaluation, PooledFeatures};
use crate::image_io::save_image_grid;
use crate::utils::{divisible_by, grid_side, has_int_square_root, num_to_groups};

/// Smallest `train_batch_size * gradient_accumulate_every` accepted.
pub const MIN_EFFECTIVE_BATCH: usize = 16;
/// Smallest dataset accepted.
pub const MIN_DATASET_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Evaluating,
    Checkpointed,
}

pub struct Trainer<B: AutodiffBackend, O> {
    model: DiffusionModel<B>,
    optim: O,
    ema: Ema<B, DiffusionModel<B>>,
    diffusion: GaussianDiffusion,
    dataset: Arc<ImageFolder>,
    fid: Option<FidEvaluation<B::InnerBackend>>,
    config: TrainerConfig,
    results_folder: PathBuf,
    step: usize,
    best_fid: Option<f64>,
    phase: Phase,
    device: B::Device,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionModel<B>, B> + Clone,
{
    pub fn new(
        model: DiffusionModel<B>,
        optim: O,
        diffusion: GaussianDiffusion,
        dataset: ImageFolder,
        config: TrainerConfig,
        results_folder: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<Self> {
        if config.num_samples == 0 {
            return Err(Error::Precondition("num_samples must be positive".into()));
        }
        if !has_int_square_root(config.num_samples) {
            return Err(Error::Precondition(format!(
                "number of samples must have an integer square root, got {}",
                config.num_samples
            )));
        }
        if config.effective_batch_size() < MIN_EFFECTIVE_BATCH {
            return Err(Error::Precondition(format!(
                "effective batch size (train_batch_size x gradient_accumulate_every) must be at least {MIN_EFFECTIVE_BATCH}, got {}",
                config.effective_batch_size()
            )));
        }
        if config.save_and_sample_every == 0 {
            return Err(Error::Precondition("save_and_sample_every must be positive".into()));
        }
        if dataset.len() < MIN_DATASET_LEN {
            return Err(Error::Precondition(format!(
                "dataset has {} images, at least {MIN_DATASET_LEN} are needed",
                dataset.len()
            )));
        }
        if config.save_best_and_latest_only && !config.calculate_fid {
            return Err(Error::Precondition(
                "saving only best and latest checkpoints requires FID".into(),
            ));
        }
        if diffusion.image_size() != dataset.image_size() {
            return Err(Error::Precondition(format!(
                "diffusion image size {} differs from dataset image size {}",
                diffusion.image_size(),
                dataset.image_size()
            )));
        }
        if model.channels() != dataset.channels() {
            return Err(Error::Precondition(format!(
                "model denoises {} channels but the dataset has {}",
                model.channels(),
                dataset.channels()
            )));
        }

        let results_folder = results_folder.as_ref().to_path_buf();
        fs::create_dir_all(&results_folder)?;

        let fid: Option<FidEvaluation<B::InnerBackend>> = if config.calculate_fid {
            let features = PooledFeatures::new(dataset.channels(), config.fid_feature_grid);
            Some(FidEvaluation::new(
                Box::new(features),
                config.train_batch_size,
                config.num_fid_samples,
                &results_folder,
            )?)
        } else {
            None
        };

        let ema = Ema::new(
            &model,
            config.ema_decay,
            config.ema_update_every,
            config.ema_update_after_step,
        );

        Ok(Self {
            model,
            optim,
            ema,
            diffusion,
            dataset: Arc::new(dataset),
            fid,
            config,
            results_folder,
            step: 0,
            best_fid: None,
            phase: Phase::Idle,
            device: device.clone(),
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn best_fid(&self) -> Option<f64> {
        self.best_fid
    }

    pub fn model(&self) -> &DiffusionModel<B> {
        &self.model
    }

    pub fn ema_model(&self) -> &DiffusionModel<B::InnerBackend> {
        self.ema.model()
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn results_folder(&self) -> &Path {
        &self.results_folder
    }

    pub fn save(&self, milestone: &str) -> Result<()> {
        let state = TrainingState {
            step: self.step,
            best_fid: self.best_fid,
            ema_step: self.ema.step(),
        };
        save_checkpoint(
            &self.results_folder,
            milestone,
            &self.model,
            self.ema.model(),
            &self.optim,
            &state,
        )
    }

    /// Resume from a milestone written by [`Self::save`].
    pub fn load(&mut self, milestone: &str) -> Result<()> {
        let mut ema_model = self.ema.model().clone();
        let state = load_checkpoint(
            &self.results_folder,
            milestone,
            &self.device,
            &mut self.model,
            &mut ema_model,
            &mut self.optim,
        )?;
        self.ema.restore(ema_model, state.ema_step);
        self.step = state.step;
        self.best_fid = state.best_fid;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// One optimizer step over `gradient_accumulate_every` batches; returns the summed loss.
    fn train_step(&mut self, batches: &BatchStream) -> Result<f32> {
        self.phase = Phase::Accumulating;
        let accumulate = self.config.gradient_accumulate_every.max(1);
        let mut accumulator = GradientsAccumulator::new();
        let mut total_loss = 0.0;

        for _ in 0..accumulate {
            let batch = batches.next_batch::<B>(&self.device)?;
            let losses = self
                .diffusion
                .forward(&self.model, batch.images, Some(batch.noise))?;
            let loss = losses.loss.div_scalar(accumulate as f32);
            total_loss += loss.clone().into_scalar().elem::<f32>();

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            accumulator.accumulate(&self.model, grads);
        }

        let grads = accumulator.grads();
        self.model = self
            .optim
            .step(self.config.train_lr, self.model.clone(), grads);
        self.step += 1;
        self.ema.update(&self.model);
        self.phase = Phase::Idle;

        debug!(step = self.step, loss = total_loss, "optimizer step");
        Ok(total_loss)
    }

    /// Sample a grid from the EMA model, score it when FID is on, and checkpoint.
    fn sample_and_save(&mut self) -> Result<()> {
        self.phase = Phase::Evaluating;
        let milestone = self.step / self.config.save_and_sample_every;
        let ema_model = self.ema.model();

        let samples: Vec<Tensor<B::InnerBackend, 4>> =
            num_to_groups(self.config.num_samples, self.config.train_batch_size)
                .into_iter()
                .map(|n| self.diffusion.sample(ema_model, n, &self.device))
                .collect();
        let samples_path = self.results_folder.join(format!("sample-{milestone}.png"));
        save_image_grid(
            Tensor::cat(samples, 0),
            grid_side(self.config.num_samples),
            &samples_path,
        )?;
        info!(milestone, path = %samples_path.display(), "saved samples");

        let fid_score = match self.fid.as_mut() {
            Some(fid) => {
                let dataset = &self.dataset;
                let device = &self.device;
                let mut real_batches =
                    ShuffledBatches::new(dataset.len(), self.config.train_batch_size);
                let real = || -> Result<Tensor<B::InnerBackend, 4>> {
                    let indices = real_batches
                        .next()
                        .ok_or_else(|| Error::Loader("dataset is empty".into()))?;
                    Ok(dataset.batch::<B::InnerBackend>(&indices, device)?.images)
                };
                let diffusion = &self.diffusion;
                let sampler = |n: usize| -> Result<Tensor<B::InnerBackend, 4>> {
                    Ok(diffusion.sample(ema_model, n, device))
                };
                let score = fid.fid_score(real, sampler)?;
                info!(milestone, fid = score, "fid score");
                Some(score)
            }
            None => None,
        };

        if self.config.save_best_and_latest_only {
            if let Some(score) = fid_score {
                if self.best_fid.map_or(true, |best| score < best) {
                    self.best_fid = Some(score);
                    self.save("best")?;
                }
            }
            self.save("latest")?;
        } else {
            self.save(&milestone.to_string())?;
        }

        self.phase = Phase::Checkpointed;
        Ok(())
    }

    /// Run until `train_num_steps`, resuming from the current step.
    pub fn train(&mut self) -> Result<()> {
        let batches = match self.config.seed {
            Some(seed) => ShuffledBatches::seeded(
                self.dataset.len(),
                self.config.train_batch_size,
                seed,
            ),
            None => ShuffledBatches::new(self.dataset.len(), self.config.train_batch_size),
        };
        let stream = BatchStream::spawn(self.dataset.clone(), batches, self.config.prefetch);

        info!(
            from = self.step,
            to = self.config.train_num_steps,
            batch = self.config.train_batch_size,
            accumulate = self.config.gradient_accumulate_every,
            "training diffusion model"
        );
        let progress = ProgressBar::new(self.config.train_num_steps as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_position(self.step as u64);

        while self.step < self.config.train_num_steps {
            let loss = self.train_step(&stream)?;
            progress.set_message(format!("loss: {loss:.4}"));
            progress.inc(1);

            if self.step != 0 && divisible_by(self.step, self.config.save_and_sample_every) {
                self.sample_and_save()?;
            }
        }
        progress.finish_and_clear();

        info!(step = self.step, "training complete");
        Ok(())
    }
}
