//! Diffusion training checkpoints.
//!
//! A milestone `m` is four files in the results folder: `model-m.mpk`, `ema-m.mpk`,
//! `optim-m.mpk` (named msgpack, full precision) and `model-m.json` holding the
//! [`TrainingState`]. Writes are not atomic.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::diffusion::{DiffusionModel, DiffusionModelConfig};
use crate::error::Result;

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub step: usize,
    /// Best FID seen so far, if FID is computed.
    #[serde(default)]
    pub best_fid: Option<f64>,
    #[serde(default)]
    pub ema_step: usize,
}

/// Paths of one milestone; the recorder appends `.mpk` to the first three.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub ema: PathBuf,
    pub optim: PathBuf,
    pub state: PathBuf,
}

impl CheckpointPaths {
    pub fn new(folder: &Path, milestone: &str) -> Self {
        Self {
            model: folder.join(format!("model-{milestone}")),
            ema: folder.join(format!("ema-{milestone}")),
            optim: folder.join(format!("optim-{milestone}")),
            state: folder.join(format!("model-{milestone}.json")),
        }
    }
}

pub fn save_checkpoint<B, O>(
    folder: &Path,
    milestone: &str,
    model: &DiffusionModel<B>,
    ema: &DiffusionModel<B::InnerBackend>,
    optim: &O,
    state: &TrainingState,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionModel<B>, B>,
{
    let paths = CheckpointPaths::new(folder, milestone);
    let recorder = CheckpointRecorder::new();

    model.clone().save_file(&paths.model, &recorder)?;
    ema.clone().save_file(&paths.ema, &recorder)?;
    recorder.record(optim.to_record(), paths.optim)?;
    fs::write(&paths.state, serde_json::to_string_pretty(state)?)?;

    info!(milestone, step = state.step, folder = %folder.display(), "saved checkpoint");
    Ok(())
}

pub fn load_checkpoint<B, O>(
    folder: &Path,
    milestone: &str,
    device: &B::Device,
    model: &mut DiffusionModel<B>,
    ema: &mut DiffusionModel<B::InnerBackend>,
    optim: &mut O,
) -> Result<TrainingState>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionModel<B>, B> + Clone,
{
    let paths = CheckpointPaths::new(folder, milestone);
    let recorder = CheckpointRecorder::new();

    let record = recorder.load(paths.model, device)?;
    *model = model.clone().load_record(record);
    let record = recorder.load(paths.ema, device)?;
    *ema = ema.clone().load_record(record);
    let record = recorder.load(paths.optim, device)?;
    *optim = optim.clone().load_record(record);

    let state: TrainingState = serde_json::from_str(&fs::read_to_string(&paths.state)?)?;
    info!(milestone, step = state.step, "loaded checkpoint");
    Ok(state)
}

/// EMA weights of a milestone, for sampling without the optimizer.
pub fn load_ema_model<B: Backend>(
    folder: &Path,
    milestone: &str,
    config: &DiffusionModelConfig,
    device: &B::Device,
) -> Result<DiffusionModel<B>> {
    let paths = CheckpointPaths::new(folder, milestone);
    let record = CheckpointRecorder::new().load(paths.ema, device)?;
    Ok(config.init::<B>(device).load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::PriorNetworkConfig;
    use crate::unet::UnetConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
    use burn::optim::{AdamConfig, GradientsParams};
    use burn::tensor::{Distribution, Tensor};

    type B = Autodiff<NdArray>;

    #[derive(Default)]
    struct Flatten(Vec<f32>);

    impl ModuleVisitor<NdArray> for Flatten {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<NdArray, D>) {
            self.0.extend(tensor.clone().into_data().to_vec::<f32>().unwrap());
        }
    }

    fn weights(model: &DiffusionModel<NdArray>) -> Vec<f32> {
        let mut flatten = Flatten::default();
        model.visit(&mut flatten);
        flatten.0
    }

    fn model_config() -> DiffusionModelConfig {
        DiffusionModelConfig::new(
            UnetConfig::new(1).with_dim(4),
            PriorNetworkConfig::new(1)
                .with_input_depth(2)
                .with_channels_down(vec![4])
                .with_channels_up(vec![4]),
        )
    }

    #[test]
    fn test_round_trip_restores_weights_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = model_config();

        let mut model = config.init::<B>(&device);
        let mut optim = AdamConfig::new().init::<B, DiffusionModel<B>>();
        let input = Tensor::<B, 4>::random([1, 2, 8, 8], Distribution::Uniform(0.0, 1.0), &device);
        let loss = model.prior.forward(input).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(1e-2, model, grads);

        let ema = model.valid();
        let state = TrainingState {
            step: 7,
            best_fid: Some(12.5),
            ema_step: 7,
        };
        save_checkpoint(dir.path(), "3", &model, &ema, &optim, &state).unwrap();
        for file in ["model-3.mpk", "ema-3.mpk", "optim-3.mpk", "model-3.json"] {
            assert!(dir.path().join(file).exists(), "{file} missing");
        }

        let mut restored = config.init::<B>(&device);
        let mut restored_ema = restored.valid();
        let mut restored_optim = AdamConfig::new().init::<B, DiffusionModel<B>>();
        let loaded = load_checkpoint(
            dir.path(),
            "3",
            &device,
            &mut restored,
            &mut restored_ema,
            &mut restored_optim,
        )
        .unwrap();

        assert_eq!(loaded, state);
        assert_eq!(weights(&restored.valid()), weights(&model.valid()));
        assert_eq!(weights(&restored_ema), weights(&ema));

        let sampled = load_ema_model::<NdArray>(dir.path(), "3", &config, &device).unwrap();
        assert_eq!(weights(&sampled), weights(&ema));
    }

    #[test]
    fn test_missing_milestone_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = model_config();
        assert!(load_ema_model::<NdArray>(dir.path(), "9", &config, &device).is_err());
    }
}
