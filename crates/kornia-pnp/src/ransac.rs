//! RANSAC-based robust wrapper for PnP solvers.
//!
//! The sampling loop is the generic [`kornia_registration::Ransac`]; this
//! module plugs the perspective problem into it and adds the refit on inliers.

use crate::ops::Projector;
use crate::pnp::{check_intrinsics, check_lengths, PnPError, PnPResult};
use crate::{solve_pnp, PnPMethod};
use glam::{DMat4, DVec3};
use kornia_registration::linalg::rigid_to_parts;
use kornia_registration::{Ransac, RansacProblem};
use serde::{Deserialize, Serialize};

/// Parameters for RANSAC over PnP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Pixel error threshold to classify an observation as an inlier.
    pub reproj_threshold_px: f64,
    /// Stop early once this probability of an outlier-free sample is reached.
    pub confidence: Option<f64>,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
    /// Whether to refit on all inliers using the base solver.
    pub refine: bool,
    /// Minimum inlier count for a successful estimate.
    pub min_inliers: usize,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            reproj_threshold_px: 3.0,
            confidence: None,
            random_seed: None,
            refine: true,
            min_inliers: 4,
        }
    }
}

/// RANSAC result for PnP.
#[derive(Debug, Clone)]
pub struct PnPRansacResult {
    /// Whether the best hypothesis met the inlier floor.
    pub success: bool,
    /// World to camera transform, identity on failure.
    pub transformation: DMat4,
    /// Best pose found by RANSAC, `None` on failure.
    pub pose: Option<PnPResult>,
    /// One flag per input correspondence.
    pub inlier_mask: Vec<bool>,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Number of hypotheses drawn.
    pub num_iterations: usize,
    /// Why the estimate is unusable, when it is.
    pub failure: Option<PnPError>,
}

/// 3D-2D correspondences scored by pixel reprojection error.
pub struct PnPProblem<'a> {
    world: &'a [[f64; 3]],
    image: &'a [[f64; 2]],
    k: &'a [[f64; 3]; 3],
    method: &'a PnPMethod,
    projector: Projector,
}

impl<'a> PnPProblem<'a> {
    /// Wrap parallel world and image points.
    pub fn new(
        world: &'a [[f64; 3]],
        image: &'a [[f64; 2]],
        k: &'a [[f64; 3]; 3],
        method: &'a PnPMethod,
    ) -> Result<Self, PnPError> {
        check_lengths(world, image)?;
        check_intrinsics(k)?;
        Ok(Self {
            world,
            image,
            k,
            method,
            projector: Projector::new(k),
        })
    }
}

impl RansacProblem for PnPProblem<'_> {
    fn num_data(&self) -> usize {
        self.world.len()
    }

    fn fit(&self, sample: &[usize]) -> Option<DMat4> {
        let w: Vec<[f64; 3]> = sample.iter().map(|&i| self.world[i]).collect();
        let p: Vec<[f64; 2]> = sample.iter().map(|&i| self.image[i]).collect();
        let pose = solve_pnp(&w, &p, self.k, self.method).ok()?;

        // cheirality on the minimal set
        let (r, t) = (pose.rotation_matrix(), DVec3::from_array(pose.translation));
        if w.iter().any(|pw| (r * DVec3::from_array(*pw) + t).z <= 0.0) {
            return None;
        }
        Some(pose.transformation())
    }

    fn is_inlier(&self, model: &DMat4, idx: usize, threshold: f64) -> bool {
        let (r, t) = rigid_to_parts(model);
        self.projector
            .sq_error(&self.world[idx], &self.image[idx], &r, &t)
            .is_some_and(|e| e.sqrt() < threshold)
    }
}

/// Solve PnP robustly using RANSAC around a base PnP method (e.g., EPnP).
///
/// - Minimal sample size is 5 for EPnP (4 when only 4 points available).
/// - Scoring uses Euclidean pixel reprojection error.
/// - With `refine` set the pose is refit on all inliers. The refit replaces the
///   hypothesis only if it keeps every inlier under the threshold and does not
///   raise their RMSE; the inlier set is kept either way.
///
/// Only mismatched input lengths are an `Err`; too few points or too few
/// inliers are reported through `success` and `failure`.
pub fn solve_pnp_ransac(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    method: &PnPMethod,
    params: &RansacParams,
) -> Result<PnPRansacResult, PnPError> {
    let problem = PnPProblem::new(world, image, k, method)?;
    let n = world.len();

    let sampling = kornia_registration::RansacParams {
        max_iterations: params.max_iterations,
        sample_size: if n <= 4 { 4 } else { 5 },
        inlier_threshold: params.reproj_threshold_px,
        min_inliers: params.min_inliers,
        confidence: params.confidence,
        random_seed: params.random_seed,
    };
    let estimate = Ransac::new(sampling).estimate(&problem);

    if !estimate.success {
        return Ok(PnPRansacResult {
            success: false,
            transformation: DMat4::IDENTITY,
            pose: None,
            inlier_mask: estimate.inlier_mask,
            inliers: Vec::new(),
            num_iterations: estimate.num_iterations,
            failure: estimate.failure.map(PnPError::from),
        });
    }

    let inliers = estimate.inlier_indices();
    let w_in: Vec<[f64; 3]> = inliers.iter().map(|&i| world[i]).collect();
    let p_in: Vec<[f64; 2]> = inliers.iter().map(|&i| image[i]).collect();

    let hypothesis = {
        let (r, t) = rigid_to_parts(&estimate.transformation);
        PnPResult::from_rt(r, t)
    };
    let pose = if params.refine {
        match solve_pnp(&w_in, &p_in, k, method) {
            Ok(refit) => choose_refit(
                &problem.projector,
                &w_in,
                &p_in,
                hypothesis,
                refit,
                params.reproj_threshold_px,
            ),
            Err(e) => {
                log::debug!("PnP RANSAC: refit on {} inliers failed: {e}", inliers.len());
                with_rmse(&problem.projector, &w_in, &p_in, hypothesis)
            }
        }
    } else {
        with_rmse(&problem.projector, &w_in, &p_in, hypothesis)
    };
    let rmse = pose.reproj_rmse.unwrap_or(f64::INFINITY);

    log::debug!(
        "PnP RANSAC: {}/{} inliers after {} iterations, rmse {:.3} px",
        inliers.len(),
        n,
        estimate.num_iterations,
        rmse
    );

    Ok(PnPRansacResult {
        success: true,
        transformation: pose.transformation(),
        pose: Some(pose),
        inlier_mask: estimate.inlier_mask,
        inliers,
        num_iterations: estimate.num_iterations,
        failure: None,
    })
}

/// Fill in the reprojection RMSE of `pose` over the given correspondences.
fn with_rmse(projector: &Projector, world: &[[f64; 3]], image: &[[f64; 2]], mut pose: PnPResult) -> PnPResult {
    let (r, t) = (pose.rotation_matrix(), DVec3::from_array(pose.translation));
    pose.reproj_rmse = Some(projector.rmse(world, image, &r, &t));
    pose
}

/// The refit on the inliers, unless it loses one of them or fits them worse
/// than the hypothesis that selected them.
fn choose_refit(
    projector: &Projector,
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    hypothesis: PnPResult,
    refit: PnPResult,
    threshold: f64,
) -> PnPResult {
    let hypothesis = with_rmse(projector, world, image, hypothesis);
    let refit = with_rmse(projector, world, image, refit);

    let (r, t) = (refit.rotation_matrix(), DVec3::from_array(refit.translation));
    let keeps_inliers = world.iter().zip(image.iter()).all(|(pw, uv)| {
        projector
            .sq_error(pw, uv, &r, &t)
            .is_some_and(|e| e.sqrt() < threshold)
    });
    let (e_hyp, e_refit) = (
        hypothesis.reproj_rmse.unwrap_or(f64::INFINITY),
        refit.reproj_rmse.unwrap_or(f64::INFINITY),
    );
    if keeps_inliers && e_refit <= e_hyp {
        refit
    } else {
        log::debug!("PnP RANSAC: refit rmse {e_refit:.3} px, keeping hypothesis at {e_hyp:.3} px");
        hypothesis
    }
}
