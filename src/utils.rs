//! Small numeric helpers shared by the trainers.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Floor applied to the global standard deviation in [`standardize`].
pub const STD_FLOOR: f32 = 1e-6;

pub fn divisible_by(numer: usize, denom: usize) -> bool {
    denom != 0 && numer % denom == 0
}

/// True when `num` is a perfect square.
pub fn has_int_square_root(num: usize) -> bool {
    let root = (num as f64).sqrt().round() as usize;
    root * root == num
}

/// Split `num` into groups of `divisor`, with the remainder as a final short group.
pub fn num_to_groups(num: usize, divisor: usize) -> Vec<usize> {
    let mut groups = vec![divisor; num / divisor];
    let remainder = num % divisor;
    if remainder > 0 {
        groups.push(remainder);
    }
    groups
}

/// Shift and scale a tensor to zero mean and unit (unbiased) standard deviation.
///
/// Statistics are global over every element, not per channel or per sample.
/// The standard deviation is floored at [`STD_FLOOR`], so a constant tensor maps to zeros.
pub fn standardize<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let n: usize = x.dims().iter().product();
    let mean = x.clone().mean().reshape([1; D]);
    let centered = x - mean;
    let var = centered
        .clone()
        .powf_scalar(2.0)
        .sum()
        .div_scalar(n.saturating_sub(1).max(1) as f32);
    let std = var.sqrt().clamp_min(STD_FLOOR).reshape([1; D]);
    centered / std
}

/// Square grid side for `num` samples.
pub fn grid_side(num: usize) -> usize {
    (num as f64).sqrt().round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn mean_std(values: &[f32]) -> (f32, f32) {
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0);
        (mean, var.sqrt())
    }

    #[test]
    fn test_num_to_groups() {
        let groups = num_to_groups(50000, 16);
        assert_eq!(groups.len(), 3125);
        assert!(groups.iter().all(|&g| g == 16));
        assert_eq!(num_to_groups(17, 16), vec![16, 1]);
        assert_eq!(num_to_groups(3, 16), vec![3]);
    }

    #[test]
    fn test_has_int_square_root() {
        assert!(has_int_square_root(25));
        assert!(has_int_square_root(1));
        assert!(!has_int_square_root(24));
        assert!(!has_int_square_root(26));
    }

    #[test]
    fn test_divisible_by() {
        assert!(divisible_by(2000, 1000));
        assert!(!divisible_by(1500, 1000));
        assert!(!divisible_by(5, 0));
    }

    #[test]
    fn test_standardize_moments() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 8, 8],
            Distribution::Uniform(3.0, 11.0),
            &device,
        );
        let values: Vec<f32> = standardize(x).into_data().to_vec().unwrap();
        let (mean, std) = mean_std(&values);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(std, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_standardize_is_global_not_per_channel() {
        let device = Default::default();
        // channel 0 is all zeros, channel 1 all ones: per-channel stats would be degenerate
        let mut data = vec![0.0f32; 16];
        data.extend(vec![1.0f32; 16]);
        let x = Tensor::<TestBackend, 1>::from_floats(data.as_slice(), &device).reshape([1, 2, 4, 4]);
        let values: Vec<f32> = standardize(x).into_data().to_vec().unwrap();
        assert!(values[0] < 0.0 && values[31] > 0.0);
        assert_abs_diff_eq!(values[0], -values[31], epsilon = 1e-5);
    }

    #[test]
    fn test_standardize_constant_tensor_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device).mul_scalar(0.5);
        let values: Vec<f32> = standardize(x).into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
    }
}
