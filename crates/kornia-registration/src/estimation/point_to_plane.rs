use glam::DVec3;
use nalgebra::{Matrix6, SymmetricEigen, Vector6};

use super::{IterationUpdate, RegistrationContext, TransformationEstimator};
use crate::error::RegistrationError;
use crate::linalg::transform_from_increment;
use crate::pointcloud::PointCloud;
use crate::reduction::{launch_reduction, ReductionMethod};

/// Upper triangle of JᵗJ (21), Jᵗr (6), squared residual, count.
pub const ACCUMULATOR_WIDTH: usize = 29;

const JTR_OFFSET: usize = 21;
const RESIDUAL_INDEX: usize = 27;
const COUNT_INDEX: usize = 28;

/// Smallest accepted ratio between the extreme eigenvalues of JᵗJ.
const MIN_EIGENVALUE_RATIO: f64 = 1e-10;

/// Point-to-plane ICP estimator.
///
/// For a pair `(s, t)` with target normal `n` the residual is `(s - t) · n`
/// and its Jacobian with respect to a small motion `[ω, v]` is `[s × n, n]`.
/// One reduction pass accumulates the normal equation, which is solved by
/// Cholesky after a conditioning check on its eigenvalues.
pub struct PointToPlaneEstimator {
    ctx: RegistrationContext,
}

impl PointToPlaneEstimator {
    /// Create an estimator.
    pub fn new(reduction: ReductionMethod) -> Self {
        Self {
            ctx: RegistrationContext::new(reduction),
        }
    }
}

/// Jacobian row and residual of one source point, or `None` if it is unmatched.
fn jacobian_and_residual(ctx: &RegistrationContext, i: usize) -> Option<([f64; 6], f64)> {
    let t_idx = ctx.target_of[i]?;
    let normals = ctx.target.normals()?;
    let s = DVec3::from_array(ctx.source.points()[i]);
    let t = DVec3::from_array(ctx.target.points()[t_idx]);
    let n = DVec3::from_array(normals[t_idx]);

    let r = (s - t).dot(n);
    let sxn = s.cross(n);
    Some(([sxn.x, sxn.y, sxn.z, n.x, n.y, n.z], r))
}

fn accumulate_pair(j: &[f64; 6], r: f64) -> [f64; ACCUMULATOR_WIDTH] {
    let mut out = [0.0; ACCUMULATOR_WIDTH];
    let mut k = 0;
    for row in 0..6 {
        for col in row..6 {
            out[k] = j[row] * j[col];
            k += 1;
        }
    }
    for (dst, jr) in out[JTR_OFFSET..JTR_OFFSET + 6].iter_mut().zip(j.iter()) {
        *dst = jr * r;
    }
    out[RESIDUAL_INDEX] = r * r;
    out[COUNT_INDEX] = 1.0;
    out
}

/// Unpack the accumulator into the symmetric JᵗJ and Jᵗr.
fn unpack(acc: &[f64; ACCUMULATOR_WIDTH]) -> (Matrix6<f64>, Vector6<f64>) {
    let mut jtj = Matrix6::zeros();
    let mut k = 0;
    for row in 0..6 {
        for col in row..6 {
            jtj[(row, col)] = acc[k];
            jtj[(col, row)] = acc[k];
            k += 1;
        }
    }
    let jtr = Vector6::from_column_slice(&acc[JTR_OFFSET..JTR_OFFSET + 6]);
    (jtj, jtr)
}

/// Solve `JᵗJ x = -Jᵗr`, rejecting ill-conditioned systems.
fn solve_normal_equation(
    jtj: Matrix6<f64>,
    jtr: Vector6<f64>,
) -> Result<Vector6<f64>, RegistrationError> {
    let eigenvalues = SymmetricEigen::new(jtj).eigenvalues;
    let max = eigenvalues.max();
    let min = eigenvalues.min();
    if max.is_nan() || max <= 0.0 || min / max < MIN_EIGENVALUE_RATIO {
        return Err(RegistrationError::DegenerateGeometry(format!(
            "normal matrix is ill-conditioned (eigenvalues {min:e} .. {max:e})"
        )));
    }
    let chol = jtj.cholesky().ok_or_else(|| {
        RegistrationError::DegenerateGeometry("normal matrix is not positive definite".to_string())
    })?;
    Ok(chol.solve(&(-jtr)))
}

impl TransformationEstimator for PointToPlaneEstimator {
    type Statistics = [f64; ACCUMULATOR_WIDTH];

    const MIN_CORRESPONDENCES: usize = 6;

    fn context(&self) -> &RegistrationContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut RegistrationContext {
        &mut self.ctx
    }

    fn initialize(
        &mut self,
        source: &PointCloud,
        target: &PointCloud,
        max_correspondence_distance: f64,
    ) -> Result<(), RegistrationError> {
        if !target.has_normals() {
            return Err(RegistrationError::InvalidInput(
                "point-to-plane estimation requires target normals".to_string(),
            ));
        }
        self.ctx
            .initialize(source, target, max_correspondence_distance)
    }

    fn accumulate_statistics(&self) -> Self::Statistics {
        launch_reduction(self.ctx.source.len(), self.ctx.reduction, |i| {
            let (j, r) = jacobian_and_residual(&self.ctx, i)?;
            Some(accumulate_pair(&j, r))
        })
    }

    fn extract_results(&self, acc: &Self::Statistics) -> Result<IterationUpdate, RegistrationError> {
        let count = acc[COUNT_INDEX];
        if count < Self::MIN_CORRESPONDENCES as f64 {
            return Err(RegistrationError::InsufficientData {
                required: Self::MIN_CORRESPONDENCES,
                actual: count as usize,
            });
        }
        let (jtj, jtr) = unpack(acc);
        let x = solve_normal_equation(jtj, jtr)?;
        let xi = [x[0], x[1], x[2], x[3], x[4], x[5]];

        Ok(IterationUpdate {
            delta: transform_from_increment(&xi),
            fitness: self.ctx.fitness(),
            inlier_rmse: (acc[RESIDUAL_INDEX] / count).sqrt(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accumulate_pair_layout() {
        let j = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let acc = accumulate_pair(&j, 0.5);
        let (jtj, jtr) = unpack(&acc);
        for r in 0..6 {
            assert_relative_eq!(jtr[r], j[r] * 0.5);
            for c in 0..6 {
                assert_relative_eq!(jtj[(r, c)], j[r] * j[c]);
            }
        }
        assert_eq!(acc[RESIDUAL_INDEX], 0.25);
        assert_eq!(acc[COUNT_INDEX], 1.0);
    }

    #[test]
    fn test_solve_rejects_rank_deficient() {
        // a single Jacobian row gives a rank one system
        let acc = accumulate_pair(&[0.0, 0.0, 1.0, 1.0, 0.0, 0.0], 1.0);
        let (jtj, jtr) = unpack(&acc);
        assert!(matches!(
            solve_normal_equation(jtj, jtr),
            Err(RegistrationError::DegenerateGeometry(_))
        ));
        assert!(matches!(
            solve_normal_equation(Matrix6::zeros(), Vector6::zeros()),
            Err(RegistrationError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_solve_well_conditioned() -> Result<(), RegistrationError> {
        let jtj = Matrix6::from_diagonal(&Vector6::new(2.0, 3.0, 4.0, 5.0, 6.0, 7.0));
        let jtr = Vector6::new(2.0, 3.0, 4.0, 5.0, 6.0, 7.0);
        let x = solve_normal_equation(jtj, jtr)?;
        for i in 0..6 {
            assert_relative_eq!(x[i], -1.0, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_initialize_requires_normals() {
        let cloud = PointCloud::from_points(vec![[0.0; 3]; 10]);
        let mut est = PointToPlaneEstimator::new(ReductionMethod::Tree);
        assert!(matches!(
            est.initialize(&cloud, &cloud, 1.0),
            Err(RegistrationError::InvalidInput(_))
        ));
    }
}
