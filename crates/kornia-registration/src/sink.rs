//! Output seam for aligned geometry.
//!
//! A [`GeometrySink`] receives a point cloud together with the transform that
//! aligns it. Nothing flows back from the sink into the estimation.

use glam::DMat4;

use crate::estimation::RegistrationResult;
use crate::pointcloud::PointCloud;
use crate::ransac::RansacResult;

/// A consumer of aligned geometry, e.g. a viewer or a recorder.
pub trait GeometrySink {
    /// The error type of the sink.
    type Error: std::error::Error;

    /// Consume `cloud` placed in the target frame by `transformation`.
    fn show(&mut self, name: &str, cloud: &PointCloud, transformation: &DMat4) -> Result<(), Self::Error>;
}

/// Send the source cloud of an ICP result to `sink`.
pub fn show_registration<S: GeometrySink>(
    sink: &mut S,
    name: &str,
    source: &PointCloud,
    result: &RegistrationResult,
) -> Result<(), S::Error> {
    sink.show(name, source, &result.transformation)
}

/// Send the source cloud of a RANSAC result to `sink`, skipping failed estimates.
///
/// Returns whether the sink was called.
pub fn show_ransac<S: GeometrySink>(
    sink: &mut S,
    name: &str,
    source: &PointCloud,
    result: &RansacResult,
) -> Result<bool, S::Error> {
    if !result.success {
        log::debug!("not showing {name}: estimate failed");
        return Ok(false);
    }
    sink.show(name, source, &result.transformation)?;
    Ok(true)
}
