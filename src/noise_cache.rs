//! Directory of learned-noise artifacts keyed by image stem.
//!
//! Each artifact is `<stem>.safetensors` holding a single f32 tensor named `noise`
//! of shape `[C, H, W]`. Existence of the file is the only completeness signal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use safetensors::tensor::{serialize, Dtype, TensorView};
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::dip_trainer::{DipTarget, DipTrainer, DipTrainerConfig};
use crate::error::{Error, Result};
use crate::image_io::{image_to_tensor, resize_and_center_crop, ImageMode};
use crate::prior::PriorNetworkConfig;

pub const NOISE_TENSOR: &str = "noise";
pub const NOISE_EXTENSION: &str = "safetensors";
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "tiff"];

#[derive(Debug, Clone)]
pub struct NoiseCache {
    dir: PathBuf,
}

impl NoiseCache {
    /// Open `dir`, creating it when missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.{NOISE_EXTENSION}"))
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.path_for(stem).is_file()
    }

    pub fn write_values(&self, stem: &str, values: &[f32], shape: &[usize]) -> Result<PathBuf> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut tensors = HashMap::new();
        tensors.insert(
            NOISE_TENSOR.to_string(),
            TensorView::new(Dtype::F32, shape.to_vec(), &bytes)?,
        );

        let path = self.path_for(stem);
        fs::write(&path, serialize(&tensors, &None)?)?;
        debug!(path = %path.display(), "wrote noise artifact");
        Ok(path)
    }

    pub fn write<B: Backend>(&self, stem: &str, noise: Tensor<B, 3>) -> Result<PathBuf> {
        let shape = noise.dims();
        let values: Vec<f32> = noise.into_data().convert::<f32>().to_vec()?;
        self.write_values(stem, &values, &shape)
    }

    /// Values and shape of the artifact for `stem`.
    pub fn read(&self, stem: &str) -> Result<(Vec<f32>, Vec<usize>)> {
        let path = self.path_for(stem);
        if !path.is_file() {
            return Err(Error::MissingNoise {
                stem: stem.to_string(),
                path,
            });
        }

        let bytes = fs::read(&path)?;
        let tensors = SafeTensors::deserialize(&bytes)?;
        let view = tensors.tensor(NOISE_TENSOR)?;
        if view.dtype() != Dtype::F32 {
            return Err(Error::TensorData(format!(
                "{} stores {:?}, expected F32",
                path.display(),
                view.dtype()
            )));
        }
        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok((values, view.shape().to_vec()))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Every image under `folder`, recursively, in path order.
pub fn find_images(folder: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut pending = vec![folder.as_ref().to_path_buf()];
    let mut images = Vec::new();
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if has_image_extension(&path) {
                images.push(path);
            }
        }
    }
    images.sort();
    Ok(images)
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// How artifacts are produced for a folder of images.
#[derive(Config, Debug)]
pub struct NoiseGenerationConfig {
    pub image_size: usize,
    #[config(default = 3)]
    pub channels: usize,
    /// Prior fitting steps per image.
    #[config(default = 100)]
    pub steps: usize,
    pub prior: PriorNetworkConfig,
    pub trainer: DipTrainerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulateSummary {
    pub generated: usize,
    pub skipped: usize,
}

/// Fit a fresh prior to every image lacking an artifact and store its learned noise.
///
/// Images are resized and centre-cropped exactly as the training dataset does, so the
/// artifacts line up with the training images pixel for pixel.
pub fn populate<B: AutodiffBackend>(
    cache: &NoiseCache,
    images_folder: impl AsRef<Path>,
    config: &NoiseGenerationConfig,
    device: &B::Device,
) -> Result<PopulateSummary> {
    let mode = ImageMode::from_channels(config.channels)?;
    let images = find_images(images_folder)?;
    let mut prior = config.prior.clone();
    prior.out_channels = config.channels;

    let progress = ProgressBar::new(images.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} generating noise [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut summary = PopulateSummary::default();
    for path in images {
        let stem = file_stem(&path);
        progress.set_message(stem.clone());
        if cache.contains(&stem) {
            summary.skipped += 1;
            progress.inc(1);
            continue;
        }

        let img = image::open(&path)
            .map_err(|err| Error::UnsupportedImage(format!("{}: {err}", path.display())))?;
        let img = resize_and_center_crop(&img, config.image_size as u32);
        let target = image_to_tensor::<B>(&img, mode, device).unsqueeze::<4>();

        let mut trainer = DipTrainer::new(
            prior.init::<B>(device),
            config.trainer.optimizer().init(),
            DipTarget::Tensor(target),
            config.trainer.clone(),
            cache.dir(),
            device,
        )?;
        trainer.train(config.steps)?;
        trainer.save_noise(cache, &stem)?;

        summary.generated += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    info!(
        generated = summary.generated,
        skipped = summary.skipped,
        dir = %cache.dir().display(),
        "noise cache populated"
    );
    Ok(summary)
}
