use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Intrinsic parameters of a pinhole camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCameraIntrinsic {
    /// Focal length in x direction, in pixels.
    pub fx: f64,
    /// Focal length in y direction, in pixels.
    pub fy: f64,
    /// Principal point x coordinate, in pixels.
    pub cx: f64,
    /// Principal point y coordinate, in pixels.
    pub cy: f64,
}

impl PinholeCameraIntrinsic {
    /// Create intrinsics from focal lengths and principal point.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidInput`] if a focal length is not a
    /// finite positive number.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, RegistrationError> {
        if !(fx.is_finite() && fx > 0.0 && fy.is_finite() && fy > 0.0) {
            return Err(RegistrationError::InvalidInput(format!(
                "focal lengths must be positive, got fx={fx} fy={fy}"
            )));
        }
        Ok(Self { fx, fy, cx, cy })
    }

    /// Create intrinsics from a row-major 3x3 matrix `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]`.
    pub fn from_matrix(k: &[[f64; 3]; 3]) -> Result<Self, RegistrationError> {
        if k[0][1] != 0.0 || k[1][0] != 0.0 || k[2] != [0.0, 0.0, 1.0] {
            return Err(RegistrationError::InvalidInput(
                "intrinsics matrix must have form [[fx, 0, cx], [0, fy, cy], [0, 0, 1]]".to_string(),
            ));
        }
        Self::new(k[0][0], k[1][1], k[0][2], k[1][2])
    }

    /// The row-major 3x3 camera matrix.
    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// The camera matrix K.
    pub fn matrix(&self) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(self.fx, 0.0, 0.0),
            DVec3::new(0.0, self.fy, 0.0),
            DVec3::new(self.cx, self.cy, 1.0),
        )
    }

    /// The inverse camera matrix K⁻¹, computed in closed form.
    pub fn inverse_matrix(&self) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(1.0 / self.fx, 0.0, 0.0),
            DVec3::new(0.0, 1.0 / self.fy, 0.0),
            DVec3::new(-self.cx / self.fx, -self.cy / self.fy, 1.0),
        )
    }

    /// Back-project a pixel with a metric depth: `depth * K⁻¹ [u, v, 1]ᵗ`.
    pub fn backproject(&self, u: f64, v: f64, depth: f64) -> DVec3 {
        depth * (self.inverse_matrix() * DVec3::new(u, v, 1.0))
    }

    /// Project a camera-frame point to pixels, or `None` if it is not in front of the camera.
    pub fn project(&self, point: DVec3) -> Option<[f64; 2]> {
        if point.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / point.z;
        Some([
            self.fx * point.x * inv_z + self.cx,
            self.fy * point.y * inv_z + self.cy,
        ])
    }
}
