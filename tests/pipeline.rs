use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use burn::optim::Optimizer;
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;

use dip_diffusion::data::ImageFolder;
use dip_diffusion::noise_cache::NoiseCache;
use dip_diffusion::prior::PriorNetworkConfig;
use dip_diffusion::unet::UnetConfig;
use dip_diffusion::{
    DiffusionConfig, DiffusionModel, DiffusionModelConfig, Error, Phase, Trainer, TrainerConfig,
};

type B = Autodiff<NdArray>;

const SIZE: usize = 8;

/// `count` random 8x8 images under `root/images` with noise artifacts under `root/noise`.
fn dataset(root: &Path, count: usize) -> ImageFolder {
    let images = root.join("images");
    std::fs::create_dir_all(&images).unwrap();
    let cache = NoiseCache::new(root.join("noise")).unwrap();
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let img = RgbImage::from_fn(SIZE as u32, SIZE as u32, |_, _| {
            Rgb([rng.gen(), rng.gen(), rng.gen()])
        });
        DynamicImage::ImageRgb8(img)
            .save(images.join(format!("{i:03}.png")))
            .unwrap();
        let noise: Vec<f32> = (0..3 * SIZE * SIZE).map(|_| rng.gen_range(-2.0..2.0)).collect();
        cache
            .write_values(&format!("{i:03}"), &noise, &[3, SIZE, SIZE])
            .unwrap();
    }

    ImageFolder::new(&images, cache, SIZE, 3, true).unwrap()
}

fn model_config() -> DiffusionModelConfig {
    DiffusionModelConfig::new(
        UnetConfig::new(3).with_dim(4),
        PriorNetworkConfig::new(3)
            .with_input_depth(4)
            .with_channels_down(vec![4, 4])
            .with_channels_up(vec![4, 4])
            .with_channels_skip(2),
    )
}

fn trainer_config() -> TrainerConfig {
    TrainerConfig::new()
        .with_train_batch_size(4)
        .with_gradient_accumulate_every(4)
        .with_train_num_steps(2)
        .with_save_and_sample_every(2)
        .with_num_samples(4)
        .with_ema_update_every(1)
        .with_ema_update_after_step(0)
        .with_calculate_fid(false)
        .with_seed(Some(3))
}

fn build(
    folder: ImageFolder,
    config: TrainerConfig,
    results: &Path,
) -> Result<Trainer<B, impl Optimizer<DiffusionModel<B>, B> + Clone>, Error> {
    let device = Default::default();
    let model_config = model_config();
    let diffusion = dip_diffusion::GaussianDiffusion::new(
        DiffusionConfig::new(SIZE).with_timesteps(4),
        model_config.prior_config(),
    )?;
    Trainer::new(
        model_config.init::<B>(&device),
        config.optimizer().init::<B, DiffusionModel<B>>(),
        diffusion,
        folder,
        config,
        results,
        &device,
    )
}

#[test]
fn training_samples_and_checkpoints_at_milestone() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results");
    let mut trainer = build(dataset(dir.path(), 100), trainer_config(), &results).unwrap();
    assert_eq!(trainer.phase(), Phase::Idle);

    trainer.train().unwrap();
    assert_eq!(trainer.step(), 2);
    assert_eq!(trainer.phase(), Phase::Checkpointed);

    // 2x2 grid of 8x8 tiles with 2 pixel padding
    let grid = image::open(results.join("sample-1.png")).unwrap();
    assert_eq!((grid.width(), grid.height()), (22, 22));
    for file in ["model-1.mpk", "ema-1.mpk", "optim-1.mpk", "model-1.json"] {
        assert!(results.join(file).exists(), "{file} missing");
    }

    let cache = NoiseCache::new(dir.path().join("noise")).unwrap();
    let folder = ImageFolder::new(dir.path().join("images"), cache, SIZE, 3, false).unwrap();
    let mut resumed = build(folder, trainer_config(), &results).unwrap();
    resumed.load("1").unwrap();
    assert_eq!(resumed.step(), 2);
    resumed.train().unwrap();
    assert_eq!(resumed.step(), 2);
}

#[test]
fn off_milestone_steps_do_not_sample_or_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results");
    let config = trainer_config().with_train_num_steps(3);
    let mut trainer = build(dataset(dir.path(), 100), config, &results).unwrap();

    trainer.train().unwrap();
    assert_eq!(trainer.step(), 3);
    // step 3 finished without reaching a milestone
    assert_eq!(trainer.phase(), Phase::Idle);

    let mut files: Vec<String> = std::fs::read_dir(&results)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec!["ema-1.mpk", "model-1.json", "model-1.mpk", "optim-1.mpk", "sample-1.png"]
    );
}

#[test]
fn best_and_latest_checkpoints_track_fid() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results");
    let config = trainer_config()
        .with_calculate_fid(true)
        .with_num_fid_samples(8)
        .with_fid_feature_grid(1)
        .with_save_best_and_latest_only(true);
    let mut trainer = build(dataset(dir.path(), 100), config, &results).unwrap();

    trainer.train().unwrap();
    let best = trainer.best_fid().unwrap();
    assert!(best.is_finite());
    for file in [
        "model-best.mpk",
        "ema-best.mpk",
        "model-latest.mpk",
        "model-latest.json",
        "dataset_stats.json",
    ] {
        assert!(results.join(file).exists(), "{file} missing");
    }
    assert!(!results.join("model-1.mpk").exists());
}

#[test]
fn rejects_non_square_sample_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config().with_num_samples(24);
    let result = build(dataset(dir.path(), 100), config, &dir.path().join("results"));
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[test]
fn rejects_zero_sample_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config().with_num_samples(0);
    let result = build(dataset(dir.path(), 100), config, &dir.path().join("results"));
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[test]
fn rejects_small_effective_batch_and_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dataset(dir.path(), 99);
    let results = dir.path().join("results");
    assert!(matches!(
        build(folder.clone(), trainer_config(), &results),
        Err(Error::Precondition(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    let folder = dataset(dir.path(), 100);
    let config = trainer_config().with_gradient_accumulate_every(2);
    assert!(matches!(build(folder, config, &results), Err(Error::Precondition(_))));
}

#[test]
fn best_and_latest_requires_fid() {
    let dir = tempfile::tempdir().unwrap();
    let config = trainer_config().with_save_best_and_latest_only(true);
    let result = build(dataset(dir.path(), 100), config, &dir.path().join("results"));
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[test]
fn rejects_mismatched_image_size() {
    let dir = tempfile::tempdir().unwrap();
    let cache = NoiseCache::new(dir.path().join("noise")).unwrap();
    dataset(dir.path(), 100);
    let folder = ImageFolder::new(dir.path().join("images"), cache, 16, 3, false).unwrap();
    let result = build(folder, trainer_config(), &dir.path().join("results"));
    assert!(matches!(result, Err(Error::Precondition(_))));
}
