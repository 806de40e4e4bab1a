//! Sources for the initial image `x_T` of the reverse process.

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

use crate::prior::{dip_input, PriorNetworkConfig};
use crate::utils::standardize;

pub trait NoiseSource<B: Backend> {
    /// Draw a `[batch, channels, height, width]` tensor.
    fn generate(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4>;
}

/// Standard normal noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianNoise;

impl<B: Backend> NoiseSource<B> for GaussianNoise {
    fn generate(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
    }
}

/// Output of a freshly initialised, untrained prior network, standardized.
///
/// Every call builds a new network and a new DIP input; the input is shared by the whole batch.
#[derive(Debug, Clone)]
pub struct PriorNoise {
    config: PriorNetworkConfig,
}

impl PriorNoise {
    pub fn new(config: PriorNetworkConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend> NoiseSource<B> for PriorNoise {
    fn generate(&self, [batch, channels, height, width]: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        let mut config = self.config.clone();
        config.out_channels = channels;
        let prior = config.init::<B>(device);

        let input = dip_input::<B>(prior.input_depth(), [height, width], device).repeat_dim(0, batch);
        standardize(prior.forward(input))
    }
}

/// Which [`NoiseSource`] starts the reverse process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingNoise {
    Gaussian,
    #[default]
    LearnedPrior,
}

impl SamplingNoise {
    pub fn source<B: Backend>(&self, prior: &PriorNetworkConfig) -> Box<dyn NoiseSource<B>> {
        match self {
            SamplingNoise::Gaussian => Box::new(GaussianNoise),
            SamplingNoise::LearnedPrior => Box::new(PriorNoise::new(prior.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_prior_noise_is_standardized() {
        let device = Default::default();
        let config = PriorNetworkConfig::new(1)
            .with_input_depth(4)
            .with_channels_down(vec![4, 4])
            .with_channels_up(vec![4, 4]);
        let source = SamplingNoise::LearnedPrior.source::<TestBackend>(&config);
        let noise = source.generate([2, 3, 8, 8], &device);
        assert_eq!(noise.dims(), [2, 3, 8, 8]);

        let values: Vec<f32> = noise.into_data().to_vec().unwrap();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_prior_noise_shares_input_across_batch() {
        let device = Default::default();
        let config = PriorNetworkConfig::new(1)
            .with_input_depth(2)
            .with_channels_down(vec![4])
            .with_channels_up(vec![4]);
        let noise = NoiseSource::<TestBackend>::generate(&PriorNoise::new(config), [2, 1, 4, 4], &device);
        let values: Vec<f32> = noise.into_data().to_vec().unwrap();
        let (first, second) = values.split_at(16);
        for (a, b) in first.iter().zip(second) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_gaussian_noise_shape() {
        let device = Default::default();
        let noise = NoiseSource::<TestBackend>::generate(&GaussianNoise, [3, 2, 4, 4], &device);
        assert_eq!(noise.dims(), [3, 2, 4, 4]);
    }
}
