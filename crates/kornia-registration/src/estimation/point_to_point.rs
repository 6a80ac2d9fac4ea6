use glam::{DMat3, DVec3};

use super::{IterationUpdate, RegistrationContext, TransformationEstimator};
use crate::error::RegistrationError;
use crate::linalg::{outer, umeyama_from_statistics, PairStatistics};
use crate::reduction::{launch_reduction, ReductionMethod};

// source sum (3), target sum (3), count
const CENTROID_WIDTH: usize = 7;
// cross covariance (9), source variance, squared residual
const MOMENT_WIDTH: usize = 11;

/// Point-to-point ICP estimator with an optional uniform scale.
///
/// Each iteration runs two reduction passes over the source points: the first
/// sums the matched positions to get both centroids, the second accumulates the
/// centered cross covariance, the source variance and the squared residual. The
/// increment is the Umeyama closed form of those moments.
pub struct PointToPointEstimator {
    ctx: RegistrationContext,
    with_scaling: bool,
}

impl PointToPointEstimator {
    /// Create an estimator.
    pub fn new(with_scaling: bool, reduction: ReductionMethod) -> Self {
        Self {
            ctx: RegistrationContext::new(reduction),
            with_scaling,
        }
    }

    fn pair(&self, i: usize) -> Option<(DVec3, DVec3)> {
        let t = self.ctx.target_of[i]?;
        Some((
            DVec3::from_array(self.ctx.source.points()[i]),
            DVec3::from_array(self.ctx.target.points()[t]),
        ))
    }
}

impl TransformationEstimator for PointToPointEstimator {
    type Statistics = (PairStatistics, f64);

    const MIN_CORRESPONDENCES: usize = 3;

    fn context(&self) -> &RegistrationContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut RegistrationContext {
        &mut self.ctx
    }

    fn accumulate_statistics(&self) -> Self::Statistics {
        let n = self.ctx.source.len();
        let method = self.ctx.reduction;

        let sums: [f64; CENTROID_WIDTH] = launch_reduction(n, method, |i| {
            let (s, t) = self.pair(i)?;
            Some([s.x, s.y, s.z, t.x, t.y, t.z, 1.0])
        });
        let count = sums[6];
        if count == 0.0 {
            return (
                PairStatistics {
                    count: 0,
                    source_mean: DVec3::ZERO,
                    target_mean: DVec3::ZERO,
                    cross_covariance: DMat3::ZERO,
                    source_variance: 0.0,
                },
                0.0,
            );
        }
        let source_mean = DVec3::new(sums[0], sums[1], sums[2]) / count;
        let target_mean = DVec3::new(sums[3], sums[4], sums[5]) / count;

        let moments: [f64; MOMENT_WIDTH] = launch_reduction(n, method, |i| {
            let (s, t) = self.pair(i)?;
            let sc = s - source_mean;
            let tc = t - target_mean;
            let c = outer(tc, sc).to_cols_array();
            Some([
                c[0],
                c[1],
                c[2],
                c[3],
                c[4],
                c[5],
                c[6],
                c[7],
                c[8],
                sc.length_squared(),
                (s - t).length_squared(),
            ])
        });

        let mut cols = [0.0; 9];
        cols.copy_from_slice(&moments[..9]);
        let stats = PairStatistics {
            count: count as usize,
            source_mean,
            target_mean,
            cross_covariance: DMat3::from_cols_array(&cols) * (1.0 / count),
            source_variance: moments[9] / count,
        };
        (stats, moments[10])
    }

    fn extract_results(&self, stats: &Self::Statistics) -> Result<IterationUpdate, RegistrationError> {
        let (moments, residual) = stats;
        let delta = umeyama_from_statistics(moments, self.with_scaling)?;
        Ok(IterationUpdate {
            delta,
            fitness: self.ctx.fitness(),
            inlier_rmse: (residual / moments.count.max(1) as f64).sqrt(),
        })
    }
}
