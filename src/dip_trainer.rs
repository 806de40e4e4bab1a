//! Fits one prior network to one image and extracts the learned noise.

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::image_io::{crop_to_multiple, image_to_tensor, save_image, ImageMode};
use crate::noise_cache::NoiseCache;
use crate::prior::{dip_input, PriorNetwork};
use crate::utils::{divisible_by, standardize};

#[derive(Config, Debug)]
pub struct DipTrainerConfig {
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 0.9)]
    pub adam_beta1: f32,
    #[config(default = 0.99)]
    pub adam_beta2: f32,
    /// Decoded targets are centre-cropped to a multiple of this.
    #[config(default = 32)]
    pub crop_multiple: usize,
    #[config(default = 10000)]
    pub predict_every: usize,
    #[config(default = 10000)]
    pub save_every: usize,
}

impl DipTrainerConfig {
    pub fn optimizer(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.adam_beta1)
            .with_beta_2(self.adam_beta2)
    }
}

/// Image the prior is fitted to.
#[derive(Debug, Clone)]
pub enum DipTarget<B: Backend> {
    Path(PathBuf),
    Image(DynamicImage),
    /// `[1, C, H, W]` in `[0, 1]`, used as is.
    Tensor(Tensor<B, 4>),
}

impl<B: Backend> DipTarget<B> {
    fn into_tensor(self, crop_multiple: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
        let img = match self {
            DipTarget::Path(path) => image::open(&path).map_err(|err| {
                Error::UnsupportedImage(format!("{}: {err}", path.display()))
            })?,
            DipTarget::Image(img) => img,
            DipTarget::Tensor(tensor) => {
                let [batch, channels, _, _] = tensor.dims();
                if batch != 1 {
                    return Err(Error::UnsupportedImage(format!(
                        "target tensor must hold one image, got a batch of {batch}"
                    )));
                }
                ImageMode::from_channels(channels)?;
                return Ok(tensor.to_device(device));
            }
        };

        let img = crop_to_multiple(&img, crop_multiple as u32);
        if img.width() == 0 || img.height() == 0 {
            return Err(Error::UnsupportedImage(format!(
                "image is smaller than the crop multiple {crop_multiple}"
            )));
        }
        let mode = ImageMode::from_channels(img.color().channel_count() as usize)?;
        Ok(image_to_tensor::<B>(&img, mode, device).unsqueeze::<4>())
    }
}

#[derive(Record)]
pub struct DipCheckpoint<B: Backend> {
    pub step: usize,
    pub model: <PriorNetwork<B> as Module<B>>::Record,
    pub model_input: Tensor<B, 4>,
}

pub struct DipTrainer<B: AutodiffBackend, O> {
    model: PriorNetwork<B>,
    optim: O,
    model_input: Tensor<B, 4>,
    target: Tensor<B, 4>,
    step: usize,
    config: DipTrainerConfig,
    results_folder: PathBuf,
    device: B::Device,
}

impl<B, O> DipTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PriorNetwork<B>, B>,
{
    pub fn new(
        model: PriorNetwork<B>,
        optim: O,
        target: DipTarget<B>,
        config: DipTrainerConfig,
        results_folder: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<Self> {
        let target = target.into_tensor(config.crop_multiple, device)?;
        let [_, channels, height, width] = target.dims();
        if channels != model.out_channels() {
            return Err(Error::Precondition(format!(
                "prior produces {} channels but the target has {channels}",
                model.out_channels()
            )));
        }

        let results_folder = results_folder.as_ref().to_path_buf();
        std::fs::create_dir_all(&results_folder)?;

        Ok(Self {
            model_input: dip_input(model.input_depth(), [height, width], device),
            model,
            optim,
            target,
            step: 0,
            config,
            results_folder,
            device: device.clone(),
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn model(&self) -> &PriorNetwork<B> {
        &self.model
    }

    pub fn model_input(&self) -> &Tensor<B, 4> {
        &self.model_input
    }

    /// Fit the prior until the step counter reaches `num_steps`.
    pub fn train(&mut self, num_steps: usize) -> Result<()> {
        let progress = ProgressBar::new(num_steps as u64).with_position(self.step as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} dip [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        while self.step < num_steps {
            let output = self.model.forward(self.model_input.clone());
            let loss = (output - self.target.clone()).powf_scalar(2.0).mean();
            let loss_value: f32 = loss.clone().into_scalar().elem();

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self
                .optim
                .step(self.config.learning_rate, self.model.clone(), grads);
            self.step += 1;

            progress.set_message(format!("loss: {loss_value:.4}"));
            progress.inc(1);

            if divisible_by(self.step, self.config.predict_every) {
                self.save_image()?;
            }
            if divisible_by(self.step, self.config.save_every) {
                self.save(&(self.step / self.config.save_every).to_string())?;
            }
        }

        progress.finish_and_clear();
        debug!(step = self.step, "prior fitted");
        Ok(())
    }

    /// Output on the fixed input, without gradient tracking and with running batch-norm statistics.
    pub fn predict(&self) -> Tensor<B::InnerBackend, 4> {
        self.model.valid().forward(self.model_input.clone().inner())
    }

    /// `standardize(predict() - target)`.
    pub fn generate_noise(&self) -> Tensor<B::InnerBackend, 4> {
        standardize(self.predict() - self.target.clone().inner())
    }

    /// Write the learned noise of the target to `cache` under `stem`.
    pub fn save_noise(&self, cache: &NoiseCache, stem: &str) -> Result<PathBuf> {
        let noise = self.generate_noise();
        let [_, channels, height, width] = noise.dims();
        cache.write(stem, noise.slice([0..1]).reshape([channels, height, width]))
    }

    pub fn save_image(&self) -> Result<PathBuf> {
        let out = self.predict();
        let [_, channels, height, width] = out.dims();
        let path = self.results_folder.join(format!("dip_{}.png", self.step));
        save_image(out.slice([0..1]).reshape([channels, height, width]), &path)?;
        Ok(path)
    }

    fn checkpoint_path(&self, milestone: &str) -> PathBuf {
        self.results_folder.join(format!("dip_model_{milestone}"))
    }

    pub fn save(&self, milestone: &str) -> Result<()> {
        let record = DipCheckpoint {
            step: self.step,
            model: self.model.clone().into_record(),
            model_input: self.model_input.clone(),
        };
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        recorder.record(record, self.checkpoint_path(milestone))?;
        info!(step = self.step, milestone, "saved prior checkpoint");
        Ok(())
    }

    pub fn load(&mut self, milestone: &str) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record: DipCheckpoint<B> = recorder.load(self.checkpoint_path(milestone), &self.device)?;
        self.step = record.step;
        self.model = self.model.clone().load_record(record.model);
        self.model_input = record.model_input;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::PriorNetworkConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;
    use image::{Rgb, RgbImage};

    type B = Autodiff<NdArray>;

    fn prior_config(channels: usize) -> PriorNetworkConfig {
        PriorNetworkConfig::new(channels)
            .with_input_depth(4)
            .with_channels_down(vec![4, 8])
            .with_channels_up(vec![4, 8])
            .with_channels_skip(2)
    }

    fn build_trainer(
        target: DipTarget<B>,
        dir: &Path,
    ) -> Result<DipTrainer<B, impl Optimizer<PriorNetwork<B>, B>>> {
        let device = Default::default();
        let config = DipTrainerConfig::new()
            .with_crop_multiple(4)
            .with_learning_rate(1e-2)
            .with_predict_every(3)
            .with_save_every(3);
        let optim = config.optimizer().init();
        DipTrainer::new(prior_config(3).init(&device), optim, target, config, dir, &device)
    }

    fn target_tensor() -> Tensor<B, 4> {
        Tensor::random([1, 3, 8, 8], Distribution::Uniform(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_image_target_is_cropped() {
        let dir = tempfile::tempdir().unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 13, Rgb([10, 20, 30])));
        let trainer = build_trainer(DipTarget::Image(img), dir.path()).unwrap();
        assert_eq!(trainer.model_input().dims(), [1, 4, 12, 8]);
    }

    #[test]
    fn test_unsupported_targets() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DipTarget::Path(dir.path().join("missing.png"));
        assert!(matches!(build_trainer(missing, dir.path()), Err(Error::UnsupportedImage(_))));

        let batch = Tensor::<B, 4>::zeros([2, 3, 8, 8], &Default::default());
        assert!(matches!(
            build_trainer(DipTarget::Tensor(batch), dir.path()),
            Err(Error::UnsupportedImage(_))
        ));
    }

    #[test]
    fn test_train_advances_step_and_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = build_trainer(DipTarget::Tensor(target_tensor()), dir.path()).unwrap();

        trainer.train(6).unwrap();
        assert_eq!(trainer.step(), 6);
        assert!(dir.path().join("dip_3.png").exists());
        assert!(dir.path().join("dip_model_2.mpk").exists());
        let values: Vec<f32> = trainer.predict().into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));

        // resuming below the counter is a no-op
        trainer.train(4).unwrap();
        assert_eq!(trainer.step(), 6);
    }

    #[test]
    fn test_train_reduces_fitting_loss() {
        let dir = tempfile::tempdir().unwrap();
        let target = Tensor::<B, 4>::full([1, 3, 8, 8], 0.9, &Default::default());
        let mut trainer = build_trainer(DipTarget::Tensor(target.clone()), dir.path()).unwrap();

        let loss = |t: &DipTrainer<B, _>| -> f32 {
            let output = t.model().forward(t.model_input().clone());
            (output - target.clone()).powf_scalar(2.0).mean().into_scalar().elem()
        };
        let before = loss(&trainer);
        trainer.train(20).unwrap();
        let after = loss(&trainer);
        assert!(after < before, "loss went from {before} to {after}");
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = build_trainer(DipTarget::Tensor(target_tensor()), dir.path()).unwrap();
        trainer.train(2).unwrap();
        trainer.save("a").unwrap();
        let prediction: Vec<f32> = trainer.predict().into_data().to_vec().unwrap();
        let input: Vec<f32> = trainer.model_input().clone().into_data().to_vec().unwrap();

        let mut restored = build_trainer(DipTarget::Tensor(target_tensor()), dir.path()).unwrap();
        restored.load("a").unwrap();
        assert_eq!(restored.step(), 2);
        let restored_input: Vec<f32> = restored.model_input().clone().into_data().to_vec().unwrap();
        let restored_prediction: Vec<f32> = restored.predict().into_data().to_vec().unwrap();
        assert_eq!(input, restored_input);
        assert_eq!(prediction, restored_prediction);
    }

    #[test]
    fn test_noise_is_standardized_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = build_trainer(DipTarget::Tensor(target_tensor()), dir.path()).unwrap();
        trainer.train(1).unwrap();

        let cache = NoiseCache::new(dir.path().join("noise")).unwrap();
        let path = trainer.save_noise(&cache, "cat").unwrap();
        assert!(path.ends_with("cat.safetensors"));
        let (values, shape) = cache.read("cat").unwrap();
        assert_eq!(shape, vec![3, 8, 8]);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 1e-4);
    }
}
