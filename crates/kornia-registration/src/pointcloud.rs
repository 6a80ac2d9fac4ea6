use glam::{DMat3, DMat4, DVec3};

use crate::error::RegistrationError;

/// An ordered set of 3D points with optional per-point normals and colors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<[f64; 3]>,
    normals: Option<Vec<[f64; 3]>>,
    colors: Option<Vec<[u8; 3]>>,
}

impl PointCloud {
    /// Create a new point cloud.
    ///
    /// # Arguments
    ///
    /// * `points` - The 3D positions.
    /// * `normals` - Optional per-point normal vectors, parallel to `points`.
    /// * `colors` - Optional per-point RGB colors, parallel to `points`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::MismatchedLengths`] if an attribute is not
    /// parallel to the positions.
    pub fn new(
        points: Vec<[f64; 3]>,
        normals: Option<Vec<[f64; 3]>>,
        colors: Option<Vec<[u8; 3]>>,
    ) -> Result<Self, RegistrationError> {
        if let Some(normals) = &normals {
            check_parallel("normals", normals.len(), points.len())?;
        }
        if let Some(colors) = &colors {
            check_parallel("colors", colors.len(), points.len())?;
        }
        Ok(Self {
            points,
            normals,
            colors,
        })
    }

    /// Create a point cloud holding positions only.
    pub fn from_points(points: Vec<[f64; 3]>) -> Self {
        Self {
            points,
            normals: None,
            colors: None,
        }
    }

    /// Number of points in the cloud.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the cloud holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The 3D positions.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// The per-point normals, if any.
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// The per-point colors, if any.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Whether the cloud carries normals.
    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Apply a rigid (or similarity) transform in place.
    ///
    /// Positions are mapped with the full 4x4 matrix. Normals are rotated with
    /// the normalized linear part so that a uniform scale does not change
    /// their length.
    pub fn transform(&mut self, transform: &DMat4) {
        for p in self.points.iter_mut() {
            *p = transform.transform_point3(DVec3::from_array(*p)).to_array();
        }
        if let Some(normals) = self.normals.as_mut() {
            let linear = DMat3::from_mat4(*transform);
            for n in normals.iter_mut() {
                *n = (linear * DVec3::from_array(*n))
                    .normalize_or_zero()
                    .to_array();
            }
        }
    }

    /// Return a transformed copy of the cloud.
    pub fn transformed(&self, transform: &DMat4) -> Self {
        let mut out = self.clone();
        out.transform(transform);
        out
    }
}

fn check_parallel(name: &'static str, len: usize, points: usize) -> Result<(), RegistrationError> {
    if len != points {
        return Err(RegistrationError::MismatchedLengths {
            left_name: name,
            left_len: len,
            right_name: "points",
            right_len: points,
        });
    }
    Ok(())
}
