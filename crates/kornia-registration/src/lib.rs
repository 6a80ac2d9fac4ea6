#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Kornia Registration
//!
//! Rigid alignment of 3D point clouds and sparse RGB-D keyframes.
//!
//! - **Reduction**: group-then-global summation of fixed-width vectors on the rayon pool.
//! - **ICP**: point-to-point (optionally with scale) and point-to-plane cost models.
//! - **RANSAC**: seeded robust estimation over 3D-3D point pairs.
//!
//! ## Example: ICP
//!
//! ```rust
//! use glam::{DMat4, DVec3};
//! use kornia_registration::{
//!     registration_icp, ICPConvergenceCriteria, PointCloud, ReductionMethod,
//!     TransformationEstimation,
//! };
//!
//! let mut points = Vec::new();
//! for i in 0..10 {
//!     for j in 0..10 {
//!         let (x, y) = (i as f64 * 0.1, j as f64 * 0.1);
//!         points.push([x, y, (x * 3.0).sin() * (y * 2.0).cos() * 0.2]);
//!     }
//! }
//! let target = PointCloud::from_points(points);
//! let source = target.transformed(&DMat4::from_translation(DVec3::new(0.01, 0.0, 0.0)));
//!
//! let result = registration_icp(
//!     &source,
//!     &target,
//!     0.05,
//!     &DMat4::IDENTITY,
//!     TransformationEstimation::default(),
//!     &ICPConvergenceCriteria::default(),
//!     ReductionMethod::Tree,
//! )?;
//!
//! assert!(result.is_success());
//! println!("fitness: {}, rmse: {}", result.fitness, result.inlier_rmse);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Pinhole camera intrinsics.
pub mod camera;

/// Nearest-neighbor correspondence search.
pub mod correspondence;

/// Error types for the registration crate.
pub mod error;

/// ICP cost models and their shared estimation contract.
pub mod estimation;

/// The ICP control loop.
pub mod icp;

/// Keyframe bundles, descriptor matching and sparse back-projection.
pub mod keyframe;

/// Rigid-body linear algebra.
pub mod linalg;

/// Point clouds with optional normals and colors.
pub mod pointcloud;

/// RANSAC robust estimation.
pub mod ransac;

/// Parallel reduction engine.
pub mod reduction;

/// Output seam for aligned geometry.
pub mod sink;

pub use camera::PinholeCameraIntrinsic;
pub use correspondence::{find_correspondences, CorrespondenceFinder, CorrespondenceSet};
pub use error::RegistrationError;
pub use estimation::{
    PointToPlaneEstimator, PointToPointEstimator, RegistrationResult, RegistrationStatus,
    TransformationEstimation, TransformationEstimator,
};
pub use icp::{evaluate_registration, registration_icp, ICPConvergenceCriteria};
pub use keyframe::{
    ColorImage, DepthImage, DescriptorMatcher, FeatureMatch, HammingMatcher, KeyframeBundle,
};
pub use pointcloud::PointCloud;
pub use ransac::{estimate_rigid_ransac, PointPairs, Ransac, RansacParams, RansacProblem, RansacResult};
pub use reduction::ReductionMethod;
pub use sink::GeometrySink;
