//! Common data types shared across Perspective-n-Point (PnP) solvers.

use glam::{DMat3, DMat4, DQuat, DVec3};
use kornia_registration::{PinholeCameraIntrinsic, RegistrationError};
use thiserror::Error;

/// Error types for PnP solvers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PnPError {
    /// Invalid input data - insufficient correspondences for the specific solver
    #[error("PnP solver requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required by the solver
        required: usize,
        /// Actual number of correspondences provided
        actual: usize,
    },

    /// Invalid input data - mismatched array lengths with descriptive labels.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice
        left_name: &'static str,
        /// Length of the left-hand slice
        left_len: usize,
        /// Label for the right-hand slice
        right_name: &'static str,
        /// Length of the right-hand slice
        right_len: usize,
    },

    /// Singular value decomposition failed
    #[error("SVD computation failed: {0}")]
    SvdFailed(String),

    /// Invalid camera intrinsics
    #[error("Invalid camera intrinsics: {0}")]
    InvalidIntrinsics(String),

    /// Error raised by the registration layer (RANSAC, back-projection).
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Numeric tolerances used by linear algebra routines throughout the PnP pipeline.
#[derive(Debug, Clone)]
pub struct NumericTol {
    /// Tolerance for singular-value decomposition.
    pub svd: f64,
    /// Epsilon threshold for determinant / singular-value checks when deciding whether to fall back to a pseudo-inverse.
    pub eps: f64,
}

impl Default for NumericTol {
    fn default() -> Self {
        Self {
            svd: 1e-12,
            eps: 1e-12,
        }
    }
}

/// Result returned by any PnP solver.
///
/// The rotation matrix maps coordinates from the **world** frame to the
/// **camera** frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PnPResult {
    /// Estimated rotation matrix, row-major.
    pub rotation: [[f64; 3]; 3],
    /// Estimated translation vector.
    pub translation: [f64; 3],
    /// Rodrigues axis-angle representation (log-map) of `rotation`.
    pub rvec: [f64; 3],
    /// Optional root-mean-square reprojection error in pixels.
    pub reproj_rmse: Option<f64>,
    /// Optional number of iterations taken by an iterative solver.
    pub num_iterations: Option<usize>,
    /// Indicates whether an iterative solver reported convergence.
    pub converged: Option<bool>,
}

impl PnPResult {
    /// Build a result from a rotation and translation, filling the axis-angle vector.
    pub fn from_rt(rotation: DMat3, translation: DVec3) -> Self {
        Self {
            rotation: mat3_to_rows(&rotation),
            translation: translation.to_array(),
            rvec: rotation_to_rvec(&rotation).to_array(),
            reproj_rmse: None,
            num_iterations: None,
            converged: None,
        }
    }

    /// The rotation as a glam matrix.
    pub fn rotation_matrix(&self) -> DMat3 {
        rows_to_mat3(&self.rotation)
    }

    /// The world to camera transform as a 4x4 rigid matrix.
    pub fn transformation(&self) -> DMat4 {
        let r = self.rotation_matrix();
        DMat4::from_cols(
            r.x_axis.extend(0.0),
            r.y_axis.extend(0.0),
            r.z_axis.extend(0.0),
            DVec3::from_array(self.translation).extend(1.0),
        )
    }
}

/// Trait implemented by every PnP solver available in this crate.
pub trait PnPSolver {
    /// Parameter object specific to the solver.
    type Param;

    /// Runs the solver.
    ///
    /// # Arguments
    /// * `world` – 3-D coordinates in the world frame.
    /// * `image` – Corresponding pixel coordinates.
    /// * `k` – Camera intrinsics matrix.
    /// * `params` – Solver-specific parameters.
    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError>;
}

pub(crate) fn check_lengths(world: &[[f64; 3]], image: &[[f64; 2]]) -> Result<(), PnPError> {
    if world.len() != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world.len(),
            right_name: "image points",
            right_len: image.len(),
        });
    }
    Ok(())
}

/// Reject camera matrices that are not `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`
/// with positive focal lengths.
pub(crate) fn check_intrinsics(k: &[[f64; 3]; 3]) -> Result<(), PnPError> {
    PinholeCameraIntrinsic::from_matrix(k)
        .map(|_| ())
        .map_err(|e| PnPError::InvalidIntrinsics(e.to_string()))
}

pub(crate) fn rows_to_mat3(r: &[[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(r[0][0], r[1][0], r[2][0]),
        DVec3::new(r[0][1], r[1][1], r[2][1]),
        DVec3::new(r[0][2], r[1][2], r[2][2]),
    )
}

pub(crate) fn mat3_to_rows(m: &DMat3) -> [[f64; 3]; 3] {
    [
        [m.x_axis.x, m.y_axis.x, m.z_axis.x],
        [m.x_axis.y, m.y_axis.y, m.z_axis.y],
        [m.x_axis.z, m.y_axis.z, m.z_axis.z],
    ]
}

/// Log map of a rotation matrix.
pub(crate) fn rotation_to_rvec(r: &DMat3) -> DVec3 {
    let q = DQuat::from_mat3(r).normalize();
    // shortest rotation, angle in [0, π]
    if q.w < 0.0 {
        (-q).to_scaled_axis()
    } else {
        q.to_scaled_axis()
    }
}
