#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Kornia PnP (Perspective-n-Point)
//!
//! Camera pose estimation from 2D-3D point correspondences, and the keyframe
//! pose pipelines built on top of it.
//!
//! ## Key Features
//!
//! - **EPnP Algorithm**: Efficient Perspective-n-Point solver for camera pose estimation
//! - **LM Refinement**: Levenberg–Marquardt polish on pixel reprojection error
//! - **Minimal Case**: with four points the three-point (P3P) poses join the EPnP candidates
//! - **RANSAC Support**: Robust estimation with outlier rejection
//! - **Keyframe Pipelines**: relative pose between RGB-D keyframes, 3D-2D or 3D-3D
//!
//! ## Example: Basic EPnP
//!
//! ```rust
//! use kornia_pnp::{solve_pnp, PnPMethod};
//!
//! // 3D world points
//! let world_points = vec![
//!     [0.0, 0.0, 0.0],
//!     [1.0, 0.0, 0.0],
//!     [0.0, 1.0, 0.0],
//!     [0.0, 0.0, 1.0],
//!     [1.0, 1.0, 0.5],
//! ];
//!
//! // Camera intrinsics (3x3 matrix)
//! let k = [
//!     [800.0, 0.0, 320.0],
//!     [0.0, 800.0, 240.0],
//!     [0.0, 0.0, 1.0],
//! ];
//!
//! // Corresponding 2D image points, camera 5 units in front of the world origin
//! let image_points: Vec<[f64; 2]> = world_points
//!     .iter()
//!     .map(|p| {
//!         let z = p[2] + 5.0;
//!         [800.0 * p[0] / z + 320.0, 800.0 * p[1] / z + 240.0]
//!     })
//!     .collect();
//!
//! // Solve for camera pose
//! let result = solve_pnp(&world_points, &image_points, &k, &PnPMethod::EPnPDefault)?;
//!
//! assert!((result.translation[2] - 5.0).abs() < 1e-6);
//! println!("Rotation: {:?}", result.rotation);
//! println!("Translation: {:?}", result.translation);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Example: Robust PnP with RANSAC
//!
//! ```rust
//! use kornia_pnp::{solve_pnp_ransac, PnPMethod, RansacParams};
//!
//! # let world_points: Vec<[f64; 3]> = (0..10)
//! #     .map(|i| [(i as f64 * 0.7).sin(), (i as f64 * 1.3).cos(), (i as f64 * 0.4).sin() * 0.5])
//! #     .collect();
//! # let image_points: Vec<[f64; 2]> = world_points
//! #     .iter()
//! #     .map(|p| [800.0 * p[0] / (p[2] + 5.0) + 320.0, 800.0 * p[1] / (p[2] + 5.0) + 240.0])
//! #     .collect();
//! # let k = [[800.0, 0.0, 320.0], [0.0, 800.0, 240.0], [0.0, 0.0, 1.0]];
//! // Use RANSAC to handle outliers
//! let ransac_params = RansacParams {
//!     max_iterations: 1000,
//!     reproj_threshold_px: 5.0,
//!     confidence: Some(0.99),
//!     random_seed: Some(0),
//!     ..Default::default()
//! };
//!
//! let result = solve_pnp_ransac(
//!     &world_points,
//!     &image_points,
//!     &k,
//!     &PnPMethod::EPnPDefault,
//!     &ransac_params,
//! )?;
//!
//! assert!(result.success);
//! println!("Inliers: {}/{}", result.inliers.len(), world_points.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Efficient Perspective-n-Point (EPnP) solver implementation.
///
/// A fast and accurate method for computing camera pose from 2D-3D correspondences.
pub mod epnp;

/// Relative pose between two RGB-D keyframes.
pub mod keyframe_pose;

/// Common data types and traits for PnP solvers.
///
/// Defines the interface and result types shared across different PnP algorithms.
pub mod pnp;

/// RANSAC-based robust PnP pose estimation.
///
/// Handles outliers in point correspondences through random sampling consensus.
pub mod ransac;

/// Levenberg–Marquardt pose refinement.
pub mod refine;

pub use epnp::{EPnP, EPnPParams};
pub use keyframe_pose::{estimate_pose_3d3d, estimate_pose_pnp, KeyframePose};
pub use pnp::{NumericTol, PnPError, PnPResult, PnPSolver};
pub use ransac::{solve_pnp_ransac, PnPProblem, PnPRansacResult, RansacParams};
pub use refine::{refine_pose_lm, LMParams};

mod ops;
mod p3p;

/// Enumeration of the Perspective-n-Point algorithms available in this crate.
#[derive(Debug, Clone)]
pub enum PnPMethod {
    /// Efficient PnP solver with a user-supplied parameter object.
    EPnP(EPnPParams),
    /// Efficient PnP solver with the crate's default parameters.
    EPnPDefault,
}

/// Dispatch function that routes to the chosen PnP solver.
pub fn solve_pnp(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    method: &PnPMethod,
) -> Result<PnPResult, PnPError> {
    match method {
        PnPMethod::EPnP(params) => EPnP::solve(world, image, k, params),
        PnPMethod::EPnPDefault => EPnP::solve(world, image, k, &EPnPParams::default()),
    }
}
