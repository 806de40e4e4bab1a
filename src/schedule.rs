//! Beta schedules, derived coefficient tables and training objectives.
//!
//! All tables are computed once on the host in `f64` and gathered per batch, the same
//! way the alpha products were gathered on the CPU before being sent to the device.

use std::f64::consts::FRAC_PI_2;
use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What the denoising network is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// The noise added to the clean sample.
    PredNoise,
    /// The clean sample itself.
    PredX0,
    /// The velocity `sqrt(ᾱ)·ε − sqrt(1−ᾱ)·x₀`.
    #[default]
    PredV,
}

impl FromStr for Objective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pred_noise" => Ok(Objective::PredNoise),
            "pred_x0" => Ok(Objective::PredX0),
            "pred_v" => Ok(Objective::PredV),
            other => Err(Error::UnknownObjective(other.to_string())),
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Objective::PredNoise => "pred_noise",
            Objective::PredX0 => "pred_x0",
            Objective::PredV => "pred_v",
        };
        f.write_str(name)
    }
}

/// Beta schedule family.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    Cosine,
    #[default]
    Sigmoid,
}

impl FromStr for BetaSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(BetaSchedule::Linear),
            "cosine" => Ok(BetaSchedule::Cosine),
            "sigmoid" => Ok(BetaSchedule::Sigmoid),
            other => Err(Error::UnknownSchedule(other.to_string())),
        }
    }
}

impl BetaSchedule {
    pub fn betas(&self, timesteps: usize) -> Vec<f64> {
        match self {
            BetaSchedule::Linear => linear_betas(timesteps),
            BetaSchedule::Cosine => cosine_betas(timesteps, 0.008),
            BetaSchedule::Sigmoid => sigmoid_betas(timesteps, -3.0, 3.0, 1.0),
        }
    }
}

fn linear_betas(timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / timesteps as f64;
    let beta_start = scale * 0.0001;
    let beta_end = scale * 0.02;
    if timesteps == 1 {
        return vec![beta_start];
    }
    (0..timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (timesteps - 1) as f64)
        .collect()
}

fn betas_from_alphas_cumprod(alphas_cumprod: &[f64]) -> Vec<f64> {
    alphas_cumprod
        .windows(2)
        .map(|w| (1.0 - w[1] / w[0]).clamp(0.0, 0.999))
        .collect()
}

fn cosine_betas(timesteps: usize, s: f64) -> Vec<f64> {
    let ac: Vec<f64> = (0..=timesteps)
        .map(|i| {
            let t = i as f64 / timesteps as f64;
            ((t + s) / (1.0 + s) * FRAC_PI_2).cos().powi(2)
        })
        .collect();
    let first = ac[0];
    let ac: Vec<f64> = ac.iter().map(|a| a / first).collect();
    betas_from_alphas_cumprod(&ac)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn sigmoid_betas(timesteps: usize, start: f64, end: f64, tau: f64) -> Vec<f64> {
    let v_start = sigmoid(start / tau);
    let v_end = sigmoid(end / tau);
    let ac: Vec<f64> = (0..=timesteps)
        .map(|i| {
            let t = i as f64 / timesteps as f64;
            (-sigmoid((t * (end - start) + start) / tau) + v_end) / (v_end - v_start)
        })
        .collect();
    let first = ac[0];
    let ac: Vec<f64> = ac.iter().map(|a| a / first).collect();
    betas_from_alphas_cumprod(&ac)
}

/// Precomputed per-timestep coefficients of the forward and reverse processes.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_variance: Vec<f64>,
    pub posterior_log_variance_clipped: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
    pub loss_weight: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(
        schedule: BetaSchedule,
        timesteps: usize,
        objective: Objective,
        min_snr_loss_weight: bool,
        min_snr_gamma: f64,
    ) -> Self {
        Self::from_betas(
            schedule.betas(timesteps),
            objective,
            min_snr_loss_weight,
            min_snr_gamma,
        )
    }

    pub fn from_betas(
        betas: Vec<f64>,
        objective: Objective,
        min_snr_loss_weight: bool,
        min_snr_gamma: f64,
    ) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumulative = 1.0;
        for beta in &betas {
            cumulative *= 1.0 - beta;
            alphas_cumprod.push(cumulative);
        }

        let mut alphas_cumprod_prev = vec![1.0];
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..alphas_cumprod.len() - 1]);

        let map = |f: &dyn Fn(usize) -> f64| -> Vec<f64> { (0..betas.len()).map(f).collect() };

        let sqrt_alphas_cumprod = map(&|i| alphas_cumprod[i].sqrt());
        let sqrt_one_minus_alphas_cumprod = map(&|i| (1.0 - alphas_cumprod[i]).sqrt());
        let sqrt_recip_alphas_cumprod = map(&|i| (1.0 / alphas_cumprod[i]).sqrt());
        let sqrt_recipm1_alphas_cumprod = map(&|i| (1.0 / alphas_cumprod[i] - 1.0).sqrt());

        let posterior_variance = map(&|i| {
            betas[i] * (1.0 - alphas_cumprod_prev[i]) / (1.0 - alphas_cumprod[i])
        });
        let posterior_log_variance_clipped =
            map(&|i| posterior_variance[i].max(1e-20).ln());
        let posterior_mean_coef1 = map(&|i| {
            betas[i] * alphas_cumprod_prev[i].sqrt() / (1.0 - alphas_cumprod[i])
        });
        let posterior_mean_coef2 = map(&|i| {
            (1.0 - alphas_cumprod_prev[i]) * (1.0 - betas[i]).sqrt() / (1.0 - alphas_cumprod[i])
        });

        let loss_weight = map(&|i| {
            let snr = alphas_cumprod[i] / (1.0 - alphas_cumprod[i]);
            let clipped = if min_snr_loss_weight {
                snr.min(min_snr_gamma)
            } else {
                snr
            };
            match objective {
                Objective::PredNoise => clipped / snr,
                Objective::PredX0 => clipped,
                Objective::PredV => clipped / (snr + 1.0),
            }
        });

        Self {
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
            loss_weight,
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// Loss weight of the noisiest timestep, used to scale the prior reconstruction term.
    pub fn final_loss_weight(&self) -> f64 {
        self.loss_weight[self.loss_weight.len() - 1]
    }
}

/// Gather `table[t]` for each sample and shape it `[b, 1, 1, 1]` for broadcasting.
pub fn extract<B: Backend>(table: &[f64], t: &[usize], device: &B::Device) -> Tensor<B, 4> {
    let gathered: Vec<f32> = t.iter().map(|&i| table[i] as f32).collect();
    Tensor::<B, 1>::from_floats(gathered.as_slice(), device).reshape([t.len(), 1, 1, 1])
}

/// `(time, time_next)` pairs visited by DDIM, from `T-1` down to `(0, -1)`.
pub fn ddim_time_pairs(total_timesteps: usize, sampling_timesteps: usize) -> Vec<(i64, i64)> {
    let start = -1.0f64;
    let end = total_timesteps as f64 - 1.0;
    let times: Vec<i64> = (0..=sampling_timesteps)
        .rev()
        .map(|i| (start + (end - start) * i as f64 / sampling_timesteps as f64) as i64)
        .collect();
    times.windows(2).map(|w| (w[0], w[1])).collect()
}
