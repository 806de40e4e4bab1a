//! Fréchet distance between feature statistics of real and generated images.

use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::Tensor;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::utils::num_to_groups;

pub const DATASET_STATS_FILE: &str = "dataset_stats.json";

/// Maps image batches to feature rows.
pub trait FeatureExtractor<B: Backend> {
    fn dim(&self) -> usize;

    /// `[N, C, H, W]` images in `[0, 1]` to `N` rows of `dim()` features.
    fn extract(&self, images: Tensor<B, 4>) -> Result<Vec<Vec<f64>>>;
}

/// Per-channel average pooling onto a `grid × grid` layout.
#[derive(Debug, Clone, Copy)]
pub struct PooledFeatures {
    channels: usize,
    grid: usize,
}

impl PooledFeatures {
    pub fn new(channels: usize, grid: usize) -> Self {
        Self {
            channels,
            grid: grid.max(1),
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for PooledFeatures {
    fn dim(&self) -> usize {
        self.channels * self.grid * self.grid
    }

    fn extract(&self, images: Tensor<B, 4>) -> Result<Vec<Vec<f64>>> {
        let n = images.dims()[0];
        let dim = FeatureExtractor::<B>::dim(self);
        let pooled = adaptive_avg_pool2d(images, [self.grid, self.grid]).reshape([n, dim]);
        let values: Vec<f32> = pooled.into_data().convert::<f32>().to_vec()?;
        Ok(values
            .chunks_exact(dim)
            .map(|row| row.iter().map(|&v| v as f64).collect())
            .collect())
    }
}

/// Mean and covariance (row-major) of a feature set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: Vec<f64>,
    pub cov: Vec<f64>,
    pub dim: usize,
    pub count: usize,
}

impl FeatureStats {
    pub fn from_features(rows: &[Vec<f64>]) -> Result<Self> {
        let count = rows.len();
        if count < 2 {
            return Err(Error::Precondition(format!(
                "feature statistics need at least 2 samples, got {count}"
            )));
        }
        let dim = rows[0].len();
        let data = DMatrix::from_fn(count, dim, |r, c| rows[r][c]);

        let mean = data.row_mean();
        let centered = DMatrix::from_fn(count, dim, |r, c| data[(r, c)] - mean[c]);
        let cov = centered.transpose() * &centered / (count as f64 - 1.0);

        Ok(Self {
            mean: mean.iter().copied().collect(),
            cov: cov.transpose().iter().copied().collect(),
            dim,
            count,
        })
    }

    fn mean_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.mean)
    }

    fn cov_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.dim, self.dim, &self.cov)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Principal square root of a symmetric positive semi-definite matrix.
fn sqrtm_psd(m: DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(m);
    let roots = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose()
}

/// `‖μ₁−μ₂‖² + tr(Σ₁) + tr(Σ₂) − 2·tr((Σ₁Σ₂)^½)`.
///
/// The cross term is evaluated as `tr((√Σ₁ Σ₂ √Σ₁)^½)`, which has the same trace and
/// stays symmetric.
pub fn frechet_distance(a: &FeatureStats, b: &FeatureStats) -> Result<f64> {
    if a.dim != b.dim {
        return Err(Error::Precondition(format!(
            "feature dimensions differ: {} vs {}",
            a.dim, b.dim
        )));
    }
    let diff = a.mean_vector() - b.mean_vector();
    let (s1, s2) = (a.cov_matrix(), b.cov_matrix());

    let root1 = sqrtm_psd(s1.clone());
    let inner = &root1 * &s2 * &root1;
    let inner = (&inner + inner.transpose()) * 0.5;
    let tr_covmean: f64 = SymmetricEigen::new(inner)
        .eigenvalues
        .iter()
        .map(|v| v.max(0.0).sqrt())
        .sum();

    Ok(diff.dot(&diff) + s1.trace() + s2.trace() - 2.0 * tr_covmean)
}

/// FID against a folder's reference statistics, cached as `dataset_stats.json`.
pub struct FidEvaluation<B: Backend> {
    extractor: Box<dyn FeatureExtractor<B>>,
    batch_size: usize,
    num_fid_samples: usize,
    stats_path: PathBuf,
    dataset_stats: Option<FeatureStats>,
}

impl<B: Backend> FidEvaluation<B> {
    pub fn new(
        extractor: Box<dyn FeatureExtractor<B>>,
        batch_size: usize,
        num_fid_samples: usize,
        stats_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        if num_fid_samples < 2 {
            return Err(Error::Precondition("FID needs at least 2 samples".into()));
        }
        fs::create_dir_all(stats_dir.as_ref())?;
        Ok(Self {
            extractor,
            batch_size: batch_size.max(1),
            num_fid_samples,
            stats_path: stats_dir.as_ref().join(DATASET_STATS_FILE),
            dataset_stats: None,
        })
    }

    fn collect(
        &self,
        mut next_batch: impl FnMut(usize) -> Result<Tensor<B, 4>>,
    ) -> Result<FeatureStats> {
        let mut rows = Vec::with_capacity(self.num_fid_samples);
        for n in num_to_groups(self.num_fid_samples, self.batch_size) {
            let batch = next_batch(n)?;
            let batch = if batch.dims()[0] > n { batch.slice([0..n]) } else { batch };
            rows.extend(self.extractor.extract(batch)?);
        }
        FeatureStats::from_features(&rows)
    }

    /// Reference statistics, computed from `real` once and cached on disk.
    pub fn load_or_precalc_dataset_stats(
        &mut self,
        mut real: impl FnMut() -> Result<Tensor<B, 4>>,
    ) -> Result<&FeatureStats> {
        if self.dataset_stats.is_none() {
            let cached = if self.stats_path.is_file() {
                let stats = FeatureStats::load(&self.stats_path)?;
                (stats.dim == self.extractor.dim()).then_some(stats)
            } else {
                None
            };
            let stats = match cached {
                Some(stats) => {
                    info!(path = %self.stats_path.display(), "loaded dataset statistics");
                    stats
                }
                None => {
                    let stats = self.collect(|_| real())?;
                    stats.save(&self.stats_path)?;
                    info!(
                        samples = stats.count,
                        path = %self.stats_path.display(),
                        "cached dataset statistics"
                    );
                    stats
                }
            };
            self.dataset_stats = Some(stats);
        }
        match &self.dataset_stats {
            Some(stats) => Ok(stats),
            None => Err(Error::Precondition("dataset statistics unavailable".into())),
        }
    }

    /// Score `num_fid_samples` generated images; lower is better.
    pub fn fid_score(
        &mut self,
        real: impl FnMut() -> Result<Tensor<B, 4>>,
        sampler: impl FnMut(usize) -> Result<Tensor<B, 4>>,
    ) -> Result<f64> {
        let reference = self.load_or_precalc_dataset_stats(real)?.clone();
        let generated = self.collect(sampler)?;
        frechet_distance(&reference, &generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn stats(mean: Vec<f64>, cov: Vec<f64>) -> FeatureStats {
        let dim = mean.len();
        FeatureStats {
            mean,
            cov,
            dim,
            count: 10,
        }
    }

    #[test]
    fn test_identical_statistics_have_zero_distance() {
        let a = stats(vec![0.5, -1.0], vec![2.0, 0.3, 0.3, 1.0]);
        assert_abs_diff_eq!(frechet_distance(&a, &a).unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_isotropic_gaussians() {
        let a = stats(vec![0.0, 0.0], vec![1.0, 0.0, 0.0, 1.0]);
        let b = stats(vec![1.0, 0.0], vec![4.0, 0.0, 0.0, 4.0]);
        // 1 + 2 + 8 - 2 * 4
        assert_abs_diff_eq!(frechet_distance(&a, &b).unwrap(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_feature_stats() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 2.0], vec![5.0, 2.0]];
        let s = FeatureStats::from_features(&rows).unwrap();
        assert_eq!(s.mean, vec![3.0, 2.0]);
        assert_abs_diff_eq!(s.cov[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.cov[3], 0.0, epsilon = 1e-12);
        assert!(FeatureStats::from_features(&rows[..1]).is_err());
    }

    #[test]
    fn test_pooled_features_shape() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([3, 2, 8, 8], &device);
        let rows = FeatureExtractor::<TestBackend>::extract(&PooledFeatures::new(2, 2), images).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 8 && r.iter().all(|v| (v - 1.0).abs() < 1e-6)));
    }

    #[test]
    fn test_dataset_stats_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut fid = FidEvaluation::<TestBackend>::new(Box::new(PooledFeatures::new(1, 2)), 4, 10, dir.path()).unwrap();

        let mut real_calls = 0;
        let real = || -> Result<Tensor<TestBackend, 4>> {
            Ok(Tensor::random([4, 1, 4, 4], Distribution::Uniform(0.0, 1.0), &device))
        };
        let score = fid
            .fid_score(
                || {
                    real_calls += 1;
                    real()
                },
                |n| Ok(Tensor::random([n, 1, 4, 4], Distribution::Uniform(0.0, 1.0), &device)),
            )
            .unwrap();
        assert!(score.is_finite() && score >= -1e-9);
        assert_eq!(real_calls, 3);
        assert!(dir.path().join(DATASET_STATS_FILE).exists());

        let mut fresh = FidEvaluation::<TestBackend>::new(Box::new(PooledFeatures::new(1, 2)), 4, 10, dir.path()).unwrap();
        let reloaded = fresh
            .load_or_precalc_dataset_stats(|| Err(Error::Loader("unused".into())))
            .unwrap();
        assert_eq!(reloaded.count, 10);
    }
}
