//! Gaussian diffusion whose noise signal comes from a Deep Image Prior network.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor};
use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::noise::SamplingNoise;
use crate::prior::{dip_input, PriorNetwork, PriorNetworkConfig};
use crate::schedule::{ddim_time_pairs, extract, BetaSchedule, NoiseSchedule, Objective};
use crate::unet::{Unet, UnetConfig};
use crate::utils::standardize;

#[derive(Config, Debug)]
pub struct DiffusionConfig {
    /// Height and width of training images.
    pub image_size: usize,
    #[config(default = 1000)]
    pub timesteps: usize,
    /// Fewer steps than `timesteps` switches sampling to DDIM.
    pub sampling_timesteps: Option<usize>,
    #[config(default = "Objective::PredV")]
    pub objective: Objective,
    #[config(default = "BetaSchedule::Sigmoid")]
    pub beta_schedule: BetaSchedule,
    #[config(default = 0.0)]
    pub ddim_sampling_eta: f64,
    /// Map `[0, 1]` inputs to `[-1, 1]` and samples back.
    #[config(default = true)]
    pub auto_normalize: bool,
    #[config(default = 0.0)]
    pub offset_noise_strength: f64,
    #[config(default = false)]
    pub min_snr_loss_weight: bool,
    #[config(default = 5.0)]
    pub min_snr_gamma: f64,
    #[config(default = "SamplingNoise::LearnedPrior")]
    pub sampling_noise: SamplingNoise,
}

#[derive(Config, Debug)]
pub struct DiffusionModelConfig {
    pub unet: UnetConfig,
    pub prior: PriorNetworkConfig,
}

impl DiffusionModelConfig {
    /// The prior always produces as many channels as the U-Net denoises.
    pub fn prior_config(&self) -> PriorNetworkConfig {
        let mut prior = self.prior.clone();
        prior.out_channels = self.unet.channels;
        prior
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DiffusionModel<B> {
        DiffusionModel {
            unet: self.unet.init(device),
            prior: self.prior_config().init(device),
        }
    }
}

/// Trainable parameters: the denoising U-Net and the embedded prior network.
#[derive(Module, Debug)]
pub struct DiffusionModel<B: Backend> {
    pub unet: Unet<B>,
    pub prior: PriorNetwork<B>,
}

impl<B: Backend> DiffusionModel<B> {
    pub fn channels(&self) -> usize {
        self.unet.channels()
    }

    pub fn self_condition(&self) -> bool {
        self.unet.self_condition()
    }
}

/// Network output converted to both noise and clean-sample estimates.
#[derive(Debug, Clone)]
pub struct ModelPrediction<B: Backend> {
    pub pred_noise: Tensor<B, 4>,
    pub pred_x_start: Tensor<B, 4>,
}

/// Result of a reverse-process run, unnormalized.
#[derive(Debug, Clone)]
pub struct Sampled<B: Backend> {
    pub img: Tensor<B, 4>,
    /// Every intermediate image from `x_T` on; empty unless requested.
    pub trajectory: Vec<Tensor<B, 4>>,
}

/// Loss terms of one batch; `loss` is the one to back-propagate.
#[derive(Debug, Clone)]
pub struct DiffusionLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub diffusion_loss: Tensor<B, 1>,
    pub prior_loss: Tensor<B, 1>,
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    config: DiffusionConfig,
    schedule: NoiseSchedule,
    sampling_timesteps: usize,
    noise_prior: PriorNetworkConfig,
}

fn timesteps_tensor<B: Backend>(t: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let t: Vec<i32> = t.iter().map(|&t| t as i32).collect();
    Tensor::from_ints(t.as_slice(), device)
}

impl GaussianDiffusion {
    /// `noise_prior` describes the untrained network used to draw `x_T` when sampling.
    pub fn new(config: DiffusionConfig, noise_prior: PriorNetworkConfig) -> Result<Self> {
        if config.timesteps == 0 {
            return Err(Error::Precondition("timesteps must be positive".into()));
        }
        if config.image_size == 0 || config.image_size % 4 != 0 {
            return Err(Error::Precondition(format!(
                "image size must be a positive multiple of 4, got {}",
                config.image_size
            )));
        }
        let sampling_timesteps = config.sampling_timesteps.unwrap_or(config.timesteps);
        if sampling_timesteps == 0 || sampling_timesteps > config.timesteps {
            return Err(Error::Precondition(format!(
                "sampling timesteps must be in 1..={}, got {sampling_timesteps}",
                config.timesteps
            )));
        }

        let schedule = NoiseSchedule::new(
            config.beta_schedule,
            config.timesteps,
            config.objective,
            config.min_snr_loss_weight,
            config.min_snr_gamma,
        );

        Ok(Self {
            config,
            schedule,
            sampling_timesteps,
            noise_prior,
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn objective(&self) -> Objective {
        self.config.objective
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn is_ddim_sampling(&self) -> bool {
        self.sampling_timesteps < self.num_timesteps()
    }

    fn normalize<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.config.auto_normalize {
            x.mul_scalar(2.0).sub_scalar(1.0)
        } else {
            x
        }
    }

    fn unnormalize<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.config.auto_normalize {
            x.add_scalar(1.0).div_scalar(2.0)
        } else {
            x
        }
    }

    pub fn q_sample<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        t: &[usize],
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let device = x_start.device();
        extract::<B>(&self.schedule.sqrt_alphas_cumprod, t, &device) * x_start
            + extract::<B>(&self.schedule.sqrt_one_minus_alphas_cumprod, t, &device) * noise
    }

    pub fn predict_start_from_noise<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: &[usize],
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let device = x_t.device();
        extract::<B>(&self.schedule.sqrt_recip_alphas_cumprod, t, &device) * x_t
            - extract::<B>(&self.schedule.sqrt_recipm1_alphas_cumprod, t, &device) * noise
    }

    pub fn predict_noise_from_start<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: &[usize],
        x_start: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let device = x_t.device();
        (extract::<B>(&self.schedule.sqrt_recip_alphas_cumprod, t, &device) * x_t - x_start)
            / extract::<B>(&self.schedule.sqrt_recipm1_alphas_cumprod, t, &device)
    }

    pub fn predict_v<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        t: &[usize],
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let device = x_start.device();
        extract::<B>(&self.schedule.sqrt_alphas_cumprod, t, &device) * noise
            - extract::<B>(&self.schedule.sqrt_one_minus_alphas_cumprod, t, &device) * x_start
    }

    pub fn predict_start_from_v<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        t: &[usize],
        v: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let device = x_t.device();
        extract::<B>(&self.schedule.sqrt_alphas_cumprod, t, &device) * x_t
            - extract::<B>(&self.schedule.sqrt_one_minus_alphas_cumprod, t, &device) * v
    }

    /// Mean and clipped log variance of `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior<B: Backend>(
        &self,
        x_start: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        t: &[usize],
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let device = x_t.device();
        let mean = extract::<B>(&self.schedule.posterior_mean_coef1, t, &device) * x_start
            + extract::<B>(&self.schedule.posterior_mean_coef2, t, &device) * x_t;
        let log_variance = extract::<B>(&self.schedule.posterior_log_variance_clipped, t, &device);
        (mean, log_variance)
    }

    pub fn model_predictions<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        x: Tensor<B, 4>,
        t: &[usize],
        x_self_cond: Option<Tensor<B, 4>>,
        clip_x_start: bool,
        rederive_pred_noise: bool,
    ) -> ModelPrediction<B> {
        let device = x.device();
        let model_out = model
            .unet
            .forward(x.clone(), timesteps_tensor::<B>(t, &device), x_self_cond);
        let maybe_clip = |x: Tensor<B, 4>| if clip_x_start { x.clamp(-1.0, 1.0) } else { x };

        match self.config.objective {
            Objective::PredNoise => {
                let pred_x_start =
                    maybe_clip(self.predict_start_from_noise(x.clone(), t, model_out.clone()));
                let pred_noise = if clip_x_start && rederive_pred_noise {
                    self.predict_noise_from_start(x, t, pred_x_start.clone())
                } else {
                    model_out
                };
                ModelPrediction {
                    pred_noise,
                    pred_x_start,
                }
            }
            Objective::PredX0 => {
                let pred_x_start = maybe_clip(model_out);
                ModelPrediction {
                    pred_noise: self.predict_noise_from_start(x, t, pred_x_start.clone()),
                    pred_x_start,
                }
            }
            Objective::PredV => {
                let pred_x_start = maybe_clip(self.predict_start_from_v(x.clone(), t, model_out));
                ModelPrediction {
                    pred_noise: self.predict_noise_from_start(x, t, pred_x_start.clone()),
                    pred_x_start,
                }
            }
        }
    }

    fn initial_noise<B: Backend>(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        self.config
            .sampling_noise
            .source::<B>(&self.noise_prior)
            .generate(shape, device)
    }

    /// One ancestral step from `t` to `t - 1`; returns the new image and the `x_0` estimate.
    pub fn p_sample<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        x: Tensor<B, 4>,
        t: usize,
        x_self_cond: Option<Tensor<B, 4>>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let batched_times = vec![t; x.dims()[0]];
        let preds = self.model_predictions(model, x.clone(), &batched_times, x_self_cond, false, false);
        let x_start = preds.pred_x_start.clamp(-1.0, 1.0);
        let (mean, log_variance) = self.q_posterior(x_start.clone(), x, &batched_times);

        let img = if t > 0 {
            let noise = Tensor::random_like(&mean, Distribution::Normal(0.0, 1.0));
            mean + log_variance.mul_scalar(0.5).exp() * noise
        } else {
            mean
        };
        (img, x_start)
    }

    /// Ancestral sampling over every timestep.
    ///
    /// The trajectory, starting at `x_T`, is only kept when `return_all_timesteps` is set.
    pub fn p_sample_loop<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        shape: [usize; 4],
        device: &B::Device,
        return_all_timesteps: bool,
    ) -> Sampled<B> {
        let mut img = self.initial_noise::<B>(shape, device);
        let mut imgs = vec![];
        if return_all_timesteps {
            imgs.push(img.clone());
        }
        let mut x_start = None;

        debug!(steps = self.num_timesteps(), "ancestral sampling");
        for t in (0..self.num_timesteps()).rev() {
            let self_cond = if model.self_condition() { x_start } else { None };
            let (next, pred_x_start) = self.p_sample(model, img, t, self_cond);
            img = next;
            x_start = Some(pred_x_start);
            if return_all_timesteps {
                imgs.push(img.clone());
            }
        }

        Sampled {
            img: self.unnormalize(img),
            trajectory: imgs.into_iter().map(|img| self.unnormalize(img)).collect(),
        }
    }

    /// DDIM sampling over `sampling_timesteps` strided steps.
    pub fn ddim_sample<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        shape: [usize; 4],
        device: &B::Device,
        return_all_timesteps: bool,
    ) -> Sampled<B> {
        let batch = shape[0];
        let eta = self.config.ddim_sampling_eta;
        let alphas_cumprod = &self.schedule.alphas_cumprod;

        let mut img = self.initial_noise::<B>(shape, device);
        let mut imgs = vec![];
        if return_all_timesteps {
            imgs.push(img.clone());
        }
        let mut x_start: Option<Tensor<B, 4>> = None;

        let time_pairs = ddim_time_pairs(self.num_timesteps(), self.sampling_timesteps);
        debug!(steps = time_pairs.len(), eta, "ddim sampling");
        for (time, time_next) in time_pairs {
            let time_cond = vec![time as usize; batch];
            let self_cond = if model.self_condition() { x_start.clone() } else { None };
            let preds = self.model_predictions(model, img.clone(), &time_cond, self_cond, true, true);
            x_start = Some(preds.pred_x_start.clone());

            if time_next < 0 {
                img = preds.pred_x_start;
            } else {
                let alpha = alphas_cumprod[time as usize];
                let alpha_next = alphas_cumprod[time_next as usize];
                let sigma =
                    eta * ((1.0 - alpha / alpha_next) * (1.0 - alpha_next) / (1.0 - alpha)).sqrt();
                let c = (1.0 - alpha_next - sigma * sigma).max(0.0).sqrt();

                let noise = Tensor::random_like(&img, Distribution::Normal(0.0, 1.0));
                img = preds.pred_x_start.mul_scalar(alpha_next.sqrt())
                    + preds.pred_noise.mul_scalar(c)
                    + noise.mul_scalar(sigma);
            }
            if return_all_timesteps {
                imgs.push(img.clone());
            }
        }

        Sampled {
            img: self.unnormalize(img),
            trajectory: imgs.into_iter().map(|img| self.unnormalize(img)).collect(),
        }
    }

    fn sample_trajectory<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        batch_size: usize,
        device: &B::Device,
        return_all_timesteps: bool,
    ) -> Sampled<B> {
        let size = self.config.image_size;
        let shape = [batch_size, model.channels(), size, size];
        if self.is_ddim_sampling() {
            self.ddim_sample(model, shape, device, return_all_timesteps)
        } else {
            self.p_sample_loop(model, shape, device, return_all_timesteps)
        }
    }

    /// Draw `batch_size` images in `[0, 1]` (when auto-normalizing).
    pub fn sample<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        batch_size: usize,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        self.sample_trajectory(model, batch_size, device, false).img
    }

    /// Full reverse trajectory `[batch, steps + 1, channels, size, size]`.
    pub fn sample_all_timesteps<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        batch_size: usize,
        device: &B::Device,
    ) -> Tensor<B, 5> {
        Tensor::stack(self.sample_trajectory(model, batch_size, device, true).trajectory, 1)
    }

    /// Training loss at timesteps `t` for a normalized batch `x_start`.
    ///
    /// A fresh DIP input is pushed through the model's prior; unless `noise` is given,
    /// the standardized residual of that output is the diffusion noise. The prior's
    /// reconstruction error, weighted like the noisiest timestep, is added to the total.
    pub fn p_losses<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        x_start: Tensor<B, 4>,
        t: &[usize],
        noise: Option<Tensor<B, 4>>,
    ) -> DiffusionLoss<B> {
        let [batch, channels, height, width] = x_start.dims();
        let device = x_start.device();

        let input = dip_input::<B>(model.prior.input_depth(), [height, width], &device)
            .repeat_dim(0, batch);
        let dip_out = model.prior.forward(input);

        let mut noise =
            noise.unwrap_or_else(|| standardize(dip_out.clone() - x_start.clone()));
        if self.config.offset_noise_strength > 0.0 {
            let offset = Tensor::<B, 4>::random(
                [batch, channels, 1, 1],
                Distribution::Normal(0.0, 1.0),
                &device,
            );
            noise = noise + offset.mul_scalar(self.config.offset_noise_strength);
        }

        let x = self.q_sample(x_start.clone(), t, noise.clone());

        let x_self_cond = if model.self_condition() && rand::thread_rng().gen_bool(0.5) {
            let preds = self.model_predictions(model, x.clone(), t, None, false, false);
            Some(preds.pred_x_start.detach())
        } else {
            None
        };

        let model_out = model
            .unet
            .forward(x, timesteps_tensor::<B>(t, &device), x_self_cond);

        let target = match self.config.objective {
            Objective::PredNoise => noise,
            Objective::PredX0 => x_start.clone(),
            Objective::PredV => self.predict_v(x_start.clone(), t, noise),
        };

        let per_sample = (model_out - target)
            .powf_scalar(2.0)
            .reshape([batch, channels * height * width])
            .mean_dim(1)
            .reshape([batch]);
        let weights = extract::<B>(&self.schedule.loss_weight, t, &device).reshape([batch]);
        let diffusion_loss = (per_sample * weights).mean();

        let prior_loss = (dip_out - x_start)
            .powf_scalar(2.0)
            .mean()
            .mul_scalar(self.schedule.final_loss_weight());

        DiffusionLoss {
            loss: diffusion_loss.clone() + prior_loss.clone(),
            diffusion_loss,
            prior_loss,
        }
    }

    /// Check the image size, rescale to `[-1, 1]`, draw one timestep per sample and
    /// compute [`Self::p_losses`].
    pub fn forward<B: Backend>(
        &self,
        model: &DiffusionModel<B>,
        img: Tensor<B, 4>,
        noise: Option<Tensor<B, 4>>,
    ) -> Result<DiffusionLoss<B>> {
        let [batch, _, height, width] = img.dims();
        let size = self.config.image_size;
        if height != size || width != size {
            return Err(Error::ImageSize {
                expected: size,
                height,
                width,
            });
        }

        let mut rng = rand::thread_rng();
        let t: Vec<usize> = (0..batch)
            .map(|_| rng.gen_range(0..self.num_timesteps()))
            .collect();

        Ok(self.p_losses(model, self.normalize(img), &t, noise))
    }
}
