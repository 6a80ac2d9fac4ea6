//! Transformation estimation for ICP.
//!
//! Each cost model is a concrete estimator that owns its working state and
//! implements [`TransformationEstimator`]. The host picks the estimator from a
//! [`TransformationEstimation`] value before the loop starts, so the per-pair
//! kernels are monomorphized and never dispatched dynamically.

mod point_to_plane;
mod point_to_point;

pub use point_to_plane::PointToPlaneEstimator;
pub use point_to_point::PointToPointEstimator;

use glam::DMat4;
use serde::{Deserialize, Serialize};

use crate::correspondence::{CorrespondenceFinder, CorrespondenceSet};
use crate::error::RegistrationError;
use crate::pointcloud::PointCloud;
use crate::reduction::ReductionMethod;

/// The cost model minimized by ICP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TransformationEstimation {
    /// Sum of squared point distances, solved in closed form.
    PointToPoint {
        /// Also estimate a uniform scale.
        with_scaling: bool,
    },
    /// Sum of squared distances along the target normals, solved as a 6x6 normal equation.
    PointToPlane,
}

impl Default for TransformationEstimation {
    fn default() -> Self {
        Self::PointToPoint {
            with_scaling: false,
        }
    }
}

/// Outcome of one estimation call.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationStatus {
    /// The convergence criteria were met.
    Converged,
    /// The iteration budget ran out; the transform is a best effort.
    NoConvergence,
    /// A stage failed; the transform is the last one that was accepted.
    Failed(RegistrationError),
}

/// The result of a registration.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Transform mapping the source onto the target.
    pub transformation: DMat4,
    /// Correspondences at the final transform.
    pub correspondences: CorrespondenceSet,
    /// Fraction of source points with a correspondence, in `[0, 1]`.
    pub fitness: f64,
    /// RMSE of the correspondence distances.
    pub inlier_rmse: f64,
    /// Number of iterations performed.
    pub num_iterations: usize,
    /// How the estimation ended.
    pub status: RegistrationStatus,
}

impl RegistrationResult {
    /// Whether the transform is usable, converged or not.
    pub fn is_success(&self) -> bool {
        !matches!(self.status, RegistrationStatus::Failed(_))
    }

    /// Whether the convergence criteria were met.
    pub fn converged(&self) -> bool {
        self.status == RegistrationStatus::Converged
    }

    /// The error describing a failed or unconverged estimation.
    pub fn error(&self) -> Option<RegistrationError> {
        match &self.status {
            RegistrationStatus::Converged => None,
            RegistrationStatus::NoConvergence => Some(RegistrationError::NoConvergence {
                iterations: self.num_iterations,
            }),
            RegistrationStatus::Failed(err) => Some(err.clone()),
        }
    }
}

/// The solution of one ICP iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationUpdate {
    /// Increment that moves the current source towards the target.
    pub delta: DMat4,
    /// Fitness before applying the increment.
    pub fitness: f64,
    /// RMSE of the cost-model residual before applying the increment.
    pub inlier_rmse: f64,
}

/// State shared by every estimator: the moving source copy, the indexed
/// target and the current correspondences.
#[derive(Default)]
pub struct RegistrationContext {
    pub(crate) source: PointCloud,
    pub(crate) target: PointCloud,
    pub(crate) finder: CorrespondenceFinder,
    pub(crate) max_correspondence_distance: f64,
    pub(crate) correspondences: CorrespondenceSet,
    // target index per source point, None when unmatched
    pub(crate) target_of: Vec<Option<usize>>,
    pub(crate) transformation: DMat4,
    pub(crate) reduction: ReductionMethod,
}

impl RegistrationContext {
    /// Create an empty context that reduces with `reduction`.
    pub fn new(reduction: ReductionMethod) -> Self {
        Self {
            reduction,
            ..Default::default()
        }
    }

    fn initialize(
        &mut self,
        source: &PointCloud,
        target: &PointCloud,
        max_correspondence_distance: f64,
    ) -> Result<(), RegistrationError> {
        if source.is_empty() || target.is_empty() {
            return Err(RegistrationError::InvalidInput(format!(
                "point clouds must not be empty (source: {}, target: {})",
                source.len(),
                target.len()
            )));
        }
        if !(max_correspondence_distance.is_finite() && max_correspondence_distance > 0.0) {
            return Err(RegistrationError::InvalidInput(format!(
                "max correspondence distance must be positive, got {max_correspondence_distance}"
            )));
        }
        self.source = source.clone();
        self.target = target.clone();
        self.finder = CorrespondenceFinder::new(target.points());
        self.max_correspondence_distance = max_correspondence_distance;
        self.correspondences = CorrespondenceSet::default();
        self.target_of = vec![None; source.len()];
        self.transformation = DMat4::IDENTITY;
        Ok(())
    }

    fn update_correspondences(&mut self) -> usize {
        self.correspondences = self
            .finder
            .find(self.source.points(), self.max_correspondence_distance);
        self.target_of.iter_mut().for_each(|t| *t = None);
        for &[s, t] in self.correspondences.pairs() {
            self.target_of[s] = Some(t);
        }
        self.correspondences.len()
    }

    fn transform_source(&mut self, delta: &DMat4) {
        self.source.transform(delta);
        self.transformation = *delta * self.transformation;
    }

    /// Fraction of source points that currently have a correspondence.
    pub fn fitness(&self) -> f64 {
        if self.source.is_empty() {
            return 0.0;
        }
        self.correspondences.len() as f64 / self.source.len() as f64
    }

    /// The composed transform applied to the source so far.
    pub fn transformation(&self) -> DMat4 {
        self.transformation
    }

    /// The current correspondences.
    pub fn correspondences(&self) -> &CorrespondenceSet {
        &self.correspondences
    }
}

/// The contract shared by the cost models.
///
/// One ICP iteration is `get_correspondences`, `accumulate_statistics`,
/// `extract_results` and `transform_source_point_cloud`. After the loop,
/// `compute_results_and_transformation` evaluates the final transform.
pub trait TransformationEstimator {
    /// Reduced sums produced by one statistics pass.
    type Statistics;

    /// Minimum number of correspondences for a solvable system.
    const MIN_CORRESPONDENCES: usize;

    /// Shared state.
    fn context(&self) -> &RegistrationContext;

    /// Shared state, mutable.
    fn context_mut(&mut self) -> &mut RegistrationContext;

    /// Copy the inputs and index the target.
    fn initialize(
        &mut self,
        source: &PointCloud,
        target: &PointCloud,
        max_correspondence_distance: f64,
    ) -> Result<(), RegistrationError> {
        self.context_mut()
            .initialize(source, target, max_correspondence_distance)
    }

    /// Rebuild the correspondences for the current source and return their count.
    fn get_correspondences(&mut self) -> usize {
        self.context_mut().update_correspondences()
    }

    /// Reduce the per-pair statistics of the current correspondences.
    fn accumulate_statistics(&self) -> Self::Statistics;

    /// Solve the reduced system for the next increment.
    fn extract_results(&self, stats: &Self::Statistics) -> Result<IterationUpdate, RegistrationError>;

    /// Move the working source by `delta` and compose it into the transform.
    fn transform_source_point_cloud(&mut self, delta: &DMat4) {
        self.context_mut().transform_source(delta)
    }

    /// Run one iteration on the current correspondences.
    fn step(&mut self) -> Result<IterationUpdate, RegistrationError> {
        let count = self.context().correspondences.len();
        if count < Self::MIN_CORRESPONDENCES {
            return Err(RegistrationError::InsufficientData {
                required: Self::MIN_CORRESPONDENCES,
                actual: count,
            });
        }
        let stats = self.accumulate_statistics();
        let update = self.extract_results(&stats)?;
        self.transform_source_point_cloud(&update.delta);
        Ok(update)
    }

    /// Evaluate the correspondences at the composed transform and package the result.
    fn compute_results_and_transformation(
        &mut self,
        num_iterations: usize,
        status: RegistrationStatus,
    ) -> RegistrationResult {
        self.get_correspondences();
        let ctx = self.context();
        RegistrationResult {
            transformation: ctx.transformation,
            correspondences: ctx.correspondences.clone(),
            fitness: ctx.fitness(),
            inlier_rmse: ctx.correspondences.rmse(),
            num_iterations,
            status,
        }
    }
}
