//! `(image, noise)` dataset, shuffled batch cycle and background prefetch.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::image_io::{center_crop, resize_shorter_edge, to_chw, ImageMode};
use crate::noise_cache::{file_stem, find_images, NoiseCache};

/// One decoded pair, both planar `[C, H, W]`.
#[derive(Debug, Clone)]
pub struct Item {
    pub image: Vec<f32>,
    pub noise: Vec<f32>,
}

/// Images paired with their learned-noise artifacts.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    paths: Vec<PathBuf>,
    noise: NoiseCache,
    image_size: usize,
    mode: ImageMode,
    augment_horizontal_flip: bool,
}

impl ImageFolder {
    pub fn new(
        folder: impl AsRef<Path>,
        noise: NoiseCache,
        image_size: usize,
        channels: usize,
        augment_horizontal_flip: bool,
    ) -> Result<Self> {
        let paths = find_images(folder.as_ref())?;
        info!(
            images = paths.len(),
            folder = %folder.as_ref().display(),
            "indexed image folder"
        );
        Ok(Self {
            paths,
            noise,
            image_size,
            mode: ImageMode::from_channels(channels)?,
            augment_horizontal_flip,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn channels(&self) -> usize {
        self.mode.channels()
    }

    fn item_shape(&self) -> [usize; 3] {
        [self.channels(), self.image_size, self.image_size]
    }

    /// Decode item `index`; a flip, when drawn, mirrors the image and its noise together.
    pub fn get(&self, index: usize) -> Result<Item> {
        let path = &self.paths[index];
        let flip = self.augment_horizontal_flip && rand::thread_rng().gen_bool(0.5);

        let img = image::open(path)?;
        let img = resize_shorter_edge(&img, self.image_size as u32);
        // the artifact was cropped unflipped, so crop before mirroring
        let img = center_crop(&img, self.image_size as u32);
        let img: DynamicImage = if flip { img.fliph() } else { img };
        let image = to_chw(&img, self.mode);

        let stem = file_stem(path);
        let (mut noise, shape) = self.noise.read(&stem)?;
        let expected = self.item_shape();
        if shape != expected {
            return Err(Error::NoiseShape {
                path: self.noise.path_for(&stem),
                expected: expected.to_vec(),
                actual: shape,
            });
        }
        if flip {
            flip_rows(&mut noise, self.image_size);
        }

        Ok(Item { image, noise })
    }

    /// Decode `indices` in parallel into one host-side batch.
    pub fn load_raw(&self, indices: &[usize]) -> Result<RawBatch> {
        let items = indices
            .par_iter()
            .map(|&i| self.get(i))
            .collect::<Result<Vec<_>>>()?;

        let [c, h, w] = self.item_shape();
        let mut images = Vec::with_capacity(items.len() * c * h * w);
        let mut noise = Vec::with_capacity(items.len() * c * h * w);
        for item in items {
            images.extend(item.image);
            noise.extend(item.noise);
        }
        Ok(RawBatch {
            images,
            noise,
            shape: [indices.len(), c, h, w],
        })
    }

    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Result<Batch<B>> {
        Ok(self.load_raw(indices)?.into_batch(device))
    }
}

fn flip_rows(planar: &mut [f32], width: usize) {
    for row in planar.chunks_exact_mut(width) {
        row.reverse();
    }
}

/// Decoded batch before it is moved to a device.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub images: Vec<f32>,
    pub noise: Vec<f32>,
    pub shape: [usize; 4],
}

impl RawBatch {
    pub fn into_batch<B: Backend>(self, device: &B::Device) -> Batch<B> {
        Batch {
            images: Tensor::from_data(TensorData::new(self.images, self.shape), device),
            noise: Tensor::from_data(TensorData::new(self.noise, self.shape), device),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// `[N, C, H, W]` in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub noise: Tensor<B, 4>,
}

/// Endless index batches over `len` items, reshuffled at the start of every pass.
///
/// The last batch of a pass holds the remainder and may be short.
#[derive(Debug, Clone)]
pub struct ShuffledBatches {
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    rng: StdRng,
}

impl ShuffledBatches {
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self::with_rng(len, batch_size, StdRng::from_entropy())
    }

    pub fn seeded(len: usize, batch_size: usize, seed: u64) -> Self {
        Self::with_rng(len, batch_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(len: usize, batch_size: usize, rng: StdRng) -> Self {
        Self {
            order: (0..len).collect(),
            batch_size: batch_size.max(1),
            cursor: len,
            rng,
        }
    }
}

impl Iterator for ShuffledBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(batch)
    }
}

/// Batches decoded on a background thread into a bounded queue.
///
/// The worker stops after the first decoding error, which is handed to the consumer,
/// or once the stream is dropped.
pub struct BatchStream {
    receiver: Receiver<Result<RawBatch>>,
}

impl BatchStream {
    pub fn spawn(dataset: Arc<ImageFolder>, batches: ShuffledBatches, prefetch: usize) -> Self {
        let (sender, receiver) = sync_channel(prefetch.max(1));
        thread::spawn(move || {
            for indices in batches {
                let batch = dataset.load_raw(&indices);
                let failed = batch.is_err();
                if sender.send(batch).is_err() || failed {
                    break;
                }
            }
            debug!("batch loader stopped");
        });
        Self { receiver }
    }

    /// Block until the next batch is ready.
    pub fn next_batch<B: Backend>(&self, device: &B::Device) -> Result<Batch<B>> {
        let raw = self
            .receiver
            .recv()
            .map_err(|_| Error::Loader("loader thread exited".into()))??;
        Ok(raw.into_batch(device))
    }
}
