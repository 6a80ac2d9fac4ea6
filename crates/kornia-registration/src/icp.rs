use glam::DMat4;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;
use crate::estimation::{
    PointToPlaneEstimator, PointToPointEstimator, RegistrationResult, RegistrationStatus,
    TransformationEstimation, TransformationEstimator,
};
use crate::pointcloud::PointCloud;
use crate::reduction::ReductionMethod;

/// Structure to define the ICP stopping rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ICPConvergenceCriteria {
    /// Maximum number of iterations to perform.
    pub max_iterations: usize,
    /// Stop when the fitness changes by less than this between two iterations.
    pub relative_fitness: f64,
    /// Stop when the inlier RMSE changes by less than this between two iterations.
    pub relative_rmse: f64,
}

impl Default for ICPConvergenceCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
        }
    }
}

/// Iterative Closest Point registration.
///
/// # Arguments
///
/// * `source` - Source point cloud.
/// * `target` - Target point cloud. Point-to-plane needs its normals.
/// * `max_correspondence_distance` - Pairs further apart than this are ignored.
/// * `init` - Initial transform from the source to the target frame.
/// * `estimation` - The cost model.
/// * `criteria` - Convergence criteria.
/// * `reduction` - How the per-pair statistics are reduced.
///
/// # Returns
///
/// The registration result. A failure inside the loop (no correspondences, a
/// degenerate normal equation) does not abort the call: the result carries
/// [`RegistrationStatus::Failed`] and the last accepted transform.
///
/// # Errors
///
/// Returns [`RegistrationError::InvalidInput`] for empty clouds, a
/// non-positive distance or missing target normals for point-to-plane.
pub fn registration_icp(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    init: &DMat4,
    estimation: TransformationEstimation,
    criteria: &ICPConvergenceCriteria,
    reduction: ReductionMethod,
) -> Result<RegistrationResult, RegistrationError> {
    match estimation {
        TransformationEstimation::PointToPoint { with_scaling } => run_icp(
            PointToPointEstimator::new(with_scaling, reduction),
            source,
            target,
            max_correspondence_distance,
            init,
            criteria,
        ),
        TransformationEstimation::PointToPlane => run_icp(
            PointToPlaneEstimator::new(reduction),
            source,
            target,
            max_correspondence_distance,
            init,
            criteria,
        ),
    }
}

/// Evaluate how well `init` aligns `source` with `target` without iterating.
pub fn evaluate_registration(
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    init: &DMat4,
) -> Result<RegistrationResult, RegistrationError> {
    let mut estimator = PointToPointEstimator::new(false, ReductionMethod::default());
    estimator.initialize(source, target, max_correspondence_distance)?;
    estimator.transform_source_point_cloud(init);
    Ok(estimator.compute_results_and_transformation(0, RegistrationStatus::Converged))
}

fn run_icp<E: TransformationEstimator>(
    mut estimator: E,
    source: &PointCloud,
    target: &PointCloud,
    max_correspondence_distance: f64,
    init: &DMat4,
    criteria: &ICPConvergenceCriteria,
) -> Result<RegistrationResult, RegistrationError> {
    estimator.initialize(source, target, max_correspondence_distance)?;
    estimator.transform_source_point_cloud(init);

    let mut status = RegistrationStatus::NoConvergence;
    let mut previous: Option<(f64, f64)> = None;
    let mut num_iterations = 0;

    // main icp loop
    for i in 0..criteria.max_iterations {
        log::debug!("Iteration: {}", i);
        let now = std::time::Instant::now();

        let num_correspondences = estimator.get_correspondences();
        log::debug!("Num correspondences: {}", num_correspondences);

        let update = match estimator.step() {
            Ok(update) => update,
            Err(err) => {
                log::warn!("ICP stopped at iteration {}: {}", i, err);
                status = RegistrationStatus::Failed(err);
                break;
            }
        };
        num_iterations = i + 1;

        log::debug!(
            "fitness: {:.6} rmse: {:.6} took {:?}",
            update.fitness,
            update.inlier_rmse,
            now.elapsed()
        );

        if let Some((fitness, rmse)) = previous {
            if (update.fitness - fitness).abs() < criteria.relative_fitness
                && (update.inlier_rmse - rmse).abs() < criteria.relative_rmse
            {
                log::debug!("ICP converged in {} iterations", num_iterations);
                status = RegistrationStatus::Converged;
                break;
            }
        }
        previous = Some((update.fitness, update.inlier_rmse));
    }

    Ok(estimator.compute_results_and_transformation(num_iterations, status))
}
