//! Random sample consensus over correspondence sets.
//!
//! [`Ransac`] owns its random generator, so a seeded estimator replays the same
//! hypotheses. Problems plug in through [`RansacProblem`]; this module ships the
//! 3D-3D rigid problem [`PointPairs`].

use glam::{DMat4, DVec3};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;
use crate::linalg::umeyama;

/// Parameters for RANSAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum number of hypotheses.
    pub max_iterations: usize,
    /// Number of correspondences in a minimal sample.
    pub sample_size: usize,
    /// Residual below which a correspondence supports a hypothesis.
    pub inlier_threshold: f64,
    /// Minimum support of the best hypothesis for the estimate to succeed.
    pub min_inliers: usize,
    /// Stop early once a hypothesis is outlier-free with this probability.
    pub confidence: Option<f64>,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            sample_size: 5,
            inlier_threshold: 0.05,
            min_inliers: 6,
            confidence: None,
            random_seed: None,
        }
    }
}

/// A model fitting problem over `num_data` correspondences.
pub trait RansacProblem {
    /// Number of correspondences.
    fn num_data(&self) -> usize;

    /// Fit a transform to the correspondences in `sample`, or `None` if the solver fails.
    fn fit(&self, sample: &[usize]) -> Option<DMat4>;

    /// Whether correspondence `idx` agrees with `model` within `threshold`.
    fn is_inlier(&self, model: &DMat4, idx: usize, threshold: f64) -> bool;
}

/// Output of a RANSAC run.
#[derive(Debug, Clone, PartialEq)]
pub struct RansacResult {
    /// Whether the best hypothesis cleared the inlier floor.
    pub success: bool,
    /// Best transform, identity on failure.
    pub transformation: DMat4,
    /// Inlier flags parallel to the input correspondences, all false on failure.
    pub inlier_mask: Vec<bool>,
    /// Support of the best hypothesis.
    pub num_inliers: usize,
    /// Number of hypotheses drawn.
    pub num_iterations: usize,
    /// Why the estimate failed.
    pub failure: Option<RegistrationError>,
}

impl RansacResult {
    fn failed(num_data: usize, num_inliers: usize, num_iterations: usize, err: RegistrationError) -> Self {
        Self {
            success: false,
            transformation: DMat4::IDENTITY,
            inlier_mask: vec![false; num_data],
            num_inliers,
            num_iterations,
            failure: Some(err),
        }
    }

    /// Indices of the inlier correspondences.
    pub fn inlier_indices(&self) -> Vec<usize> {
        self.inlier_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &inlier)| inlier.then_some(i))
            .collect()
    }
}

/// RANSAC estimator with its own random generator.
pub struct Ransac {
    params: RansacParams,
    rng: StdRng,
}

impl Ransac {
    /// Create an estimator, seeded from `params.random_seed` or from the OS.
    pub fn new(params: RansacParams) -> Self {
        let rng = match params.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { params, rng }
    }

    /// The estimator parameters.
    pub fn params(&self) -> &RansacParams {
        &self.params
    }

    /// Run RANSAC on `problem`.
    ///
    /// Each iteration shuffles the correspondence indices, fits the first
    /// `sample_size` of them and counts the support of the fit. A hypothesis
    /// replaces the best one only with strictly more inliers. The optional
    /// confidence only shortens the run; it never changes which hypothesis wins
    /// among those drawn.
    pub fn estimate<P: RansacProblem>(&mut self, problem: &P) -> RansacResult {
        let n = problem.num_data();
        let k = self.params.sample_size;
        if k == 0 {
            return RansacResult::failed(
                n,
                0,
                0,
                RegistrationError::InvalidInput("sample size must be positive".to_string()),
            );
        }
        if n < k {
            return RansacResult::failed(
                n,
                0,
                0,
                RegistrationError::InsufficientData {
                    required: k,
                    actual: n,
                },
            );
        }

        let threshold = self.params.inlier_threshold;
        let mut indices: Vec<usize> = (0..n).collect();
        let mut best: Option<(DMat4, usize)> = None;
        let mut required_iterations = self.params.max_iterations;
        let mut iter = 0;

        while iter < required_iterations {
            iter += 1;

            indices.shuffle(&mut self.rng);
            let Some(model) = problem.fit(&indices[..k]) else {
                continue;
            };

            let support = (0..n)
                .filter(|&i| problem.is_inlier(&model, i, threshold))
                .count();
            let best_support = best.map_or(0, |(_, s)| s);
            if support > best_support {
                log::debug!("RANSAC iteration {}: {} inliers out of {}", iter, support, n);
                best = Some((model, support));

                if let Some(confidence) = self.params.confidence {
                    let estimate = adaptive_iterations(support, n, k, confidence);
                    required_iterations = required_iterations.min(estimate.max(iter));
                }
            }
        }

        match best {
            Some((model, support)) if support >= self.params.min_inliers => {
                let inlier_mask = (0..n)
                    .map(|i| problem.is_inlier(&model, i, threshold))
                    .collect();
                RansacResult {
                    success: true,
                    transformation: model,
                    inlier_mask,
                    num_inliers: support,
                    num_iterations: iter,
                    failure: None,
                }
            }
            best => {
                let support = best.map_or(0, |(_, s)| s);
                log::debug!(
                    "RANSAC failed: best support {} below {}",
                    support,
                    self.params.min_inliers
                );
                RansacResult::failed(
                    n,
                    support,
                    iter,
                    RegistrationError::InsufficientData {
                        required: self.params.min_inliers,
                        actual: support,
                    },
                )
            }
        }
    }
}

/// Number of iterations after which an all-inlier sample has been drawn with
/// probability `confidence`, given the current inlier ratio.
pub fn adaptive_iterations(num_inliers: usize, num_data: usize, sample_size: usize, confidence: f64) -> usize {
    let w = num_inliers as f64 / num_data.max(1) as f64;
    let ws = w.powi(sample_size as i32);
    if ws >= 1.0 {
        return 1;
    }
    if ws <= f64::EPSILON {
        return usize::MAX;
    }
    let num = (1.0 - confidence.clamp(0.0, 1.0 - 1e-12)).ln();
    let den = (1.0 - ws).ln();
    let est = (num / den).ceil();
    if est.is_finite() && est > 0.0 {
        est as usize
    } else {
        usize::MAX
    }
}

/// 3D-3D rigid alignment of paired points.
pub struct PointPairs<'a> {
    source: &'a [[f64; 3]],
    target: &'a [[f64; 3]],
}

impl<'a> PointPairs<'a> {
    /// Pair `source[i]` with `target[i]`.
    pub fn new(source: &'a [[f64; 3]], target: &'a [[f64; 3]]) -> Result<Self, RegistrationError> {
        if source.len() != target.len() {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "source",
                left_len: source.len(),
                right_name: "target",
                right_len: target.len(),
            });
        }
        Ok(Self { source, target })
    }
}

impl RansacProblem for PointPairs<'_> {
    fn num_data(&self) -> usize {
        self.source.len()
    }

    fn fit(&self, sample: &[usize]) -> Option<DMat4> {
        let src: Vec<[f64; 3]> = sample.iter().map(|&i| self.source[i]).collect();
        let dst: Vec<[f64; 3]> = sample.iter().map(|&i| self.target[i]).collect();
        umeyama(&src, &dst, false).ok()
    }

    fn is_inlier(&self, model: &DMat4, idx: usize, threshold: f64) -> bool {
        let s = model.transform_point3(DVec3::from_array(self.source[idx]));
        s.distance(DVec3::from_array(self.target[idx])) < threshold
    }
}

/// Estimate the rigid transform mapping `source` onto `target` with RANSAC.
///
/// # Errors
///
/// Only malformed input is an error; too little data or support is reported
/// through [`RansacResult::success`].
pub fn estimate_rigid_ransac(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    params: RansacParams,
) -> Result<RansacResult, RegistrationError> {
    let problem = PointPairs::new(source, target)?;
    Ok(Ransac::new(params).estimate(&problem))
}
