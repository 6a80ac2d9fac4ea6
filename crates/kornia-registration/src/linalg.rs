//! Rigid-body helpers shared by the estimators.
//!
//! The Umeyama closed form is split into two steps: [`PairStatistics`] holds the
//! reduced first and second moments of a set of point pairs, and
//! [`umeyama_from_statistics`] turns them into a transform. The ICP estimator
//! fills the statistics with a parallel reduction; the RANSAC minimal fit fills
//! them sequentially through [`umeyama`].

use glam::{DMat3, DMat4, DQuat, DVec3};
use nalgebra::Matrix3;

use crate::error::RegistrationError;

/// Source variance below which the closed form is considered degenerate.
const MIN_SOURCE_VARIANCE: f64 = 1e-12;

/// First and second moments of a set of (source, target) point pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairStatistics {
    /// Number of pairs.
    pub count: usize,
    /// Mean of the source points.
    pub source_mean: DVec3,
    /// Mean of the target points.
    pub target_mean: DVec3,
    /// Cross covariance `1/n Σ (t - μt)(s - μs)ᵗ`.
    pub cross_covariance: DMat3,
    /// Mean squared distance of the source points to their centroid.
    pub source_variance: f64,
}

impl PairStatistics {
    /// Compute the statistics of two parallel point sets on the calling thread.
    pub fn from_pairs(source: &[[f64; 3]], target: &[[f64; 3]]) -> Result<Self, RegistrationError> {
        if source.len() != target.len() {
            return Err(RegistrationError::MismatchedLengths {
                left_name: "source",
                left_len: source.len(),
                right_name: "target",
                right_len: target.len(),
            });
        }
        if source.is_empty() {
            return Err(RegistrationError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        let n = source.len() as f64;

        let (sum_s, sum_t) = source.iter().zip(target.iter()).fold(
            (DVec3::ZERO, DVec3::ZERO),
            |(acc_s, acc_t), (s, t)| (acc_s + DVec3::from_array(*s), acc_t + DVec3::from_array(*t)),
        );
        let source_mean = sum_s / n;
        let target_mean = sum_t / n;

        let mut cross_covariance = DMat3::ZERO;
        let mut source_variance = 0.0;
        for (s, t) in source.iter().zip(target.iter()) {
            let sc = DVec3::from_array(*s) - source_mean;
            let tc = DVec3::from_array(*t) - target_mean;
            cross_covariance += outer(tc, sc);
            source_variance += sc.length_squared();
        }

        Ok(Self {
            count: source.len(),
            source_mean,
            target_mean,
            cross_covariance: cross_covariance * (1.0 / n),
            source_variance: source_variance / n,
        })
    }
}

/// Outer product `a bᵗ`.
pub fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// Umeyama closed-form alignment from reduced pair statistics.
///
/// The rotation comes from the SVD of the cross covariance, with the last
/// singular direction flipped when `det(U) det(V) < 0` so that the result is a
/// proper rotation. When `with_scaling` is set a uniform scale is estimated as
/// well, otherwise the scale is fixed to one.
///
/// # Errors
///
/// * [`RegistrationError::InsufficientData`] if `stats.count` is zero.
/// * [`RegistrationError::DegenerateGeometry`] if the source points collapse to
///   a single location.
pub fn umeyama_from_statistics(
    stats: &PairStatistics,
    with_scaling: bool,
) -> Result<DMat4, RegistrationError> {
    if stats.count == 0 {
        return Err(RegistrationError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    if stats.source_variance < MIN_SOURCE_VARIANCE {
        return Err(RegistrationError::DegenerateGeometry(format!(
            "source variance {:e} is too small",
            stats.source_variance
        )));
    }

    let svd = mat3_to_na(&stats.cross_covariance).svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(RegistrationError::DegenerateGeometry(
                "SVD of the cross covariance failed".to_string(),
            ))
        }
    };

    // singular values come sorted in descending order, so the last one is flipped
    let mut correction = Matrix3::<f64>::identity();
    if u.determinant() * v_t.determinant() < 0.0 {
        correction[(2, 2)] = -1.0;
    }

    let rotation = mat3_from_na(&(u * correction * v_t));
    let scale = if with_scaling {
        let d = svd.singular_values;
        (d[0] * correction[(0, 0)] + d[1] * correction[(1, 1)] + d[2] * correction[(2, 2)])
            / stats.source_variance
    } else {
        1.0
    };

    let translation = stats.target_mean - scale * (rotation * stats.source_mean);
    Ok(similarity_from_parts(scale, rotation, translation))
}

/// Umeyama alignment mapping `source` onto `target`.
pub fn umeyama(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    with_scaling: bool,
) -> Result<DMat4, RegistrationError> {
    let stats = PairStatistics::from_pairs(source, target)?;
    umeyama_from_statistics(&stats, with_scaling)
}

/// Exponential map from an axis-angle vector to a rotation matrix.
pub fn so3_exp(omega: DVec3) -> DMat3 {
    DMat3::from_quat(DQuat::from_scaled_axis(omega))
}

/// Build the transform of a 6-vector increment `[ωx, ωy, ωz, tx, ty, tz]`.
pub fn transform_from_increment(xi: &[f64; 6]) -> DMat4 {
    let rotation = so3_exp(DVec3::new(xi[0], xi[1], xi[2]));
    rigid_from_parts(rotation, DVec3::new(xi[3], xi[4], xi[5]))
}

/// Assemble a homogeneous rigid transform.
pub fn rigid_from_parts(rotation: DMat3, translation: DVec3) -> DMat4 {
    similarity_from_parts(1.0, rotation, translation)
}

/// Assemble a homogeneous similarity transform `[sR | t]`.
pub fn similarity_from_parts(scale: f64, rotation: DMat3, translation: DVec3) -> DMat4 {
    let mut m = DMat4::from_mat3(rotation * scale);
    m.w_axis = translation.extend(1.0);
    m
}

/// Split a rigid transform into rotation and translation.
pub fn rigid_to_parts(transform: &DMat4) -> (DMat3, DVec3) {
    (DMat3::from_mat4(*transform), transform.w_axis.truncate())
}

/// Rotation angle in radians of the linear part of `transform`.
pub fn rotation_angle(transform: &DMat4) -> f64 {
    let r = DMat3::from_mat4(*transform);
    let cos = ((r.x_axis.x + r.y_axis.y + r.z_axis.z - 1.0) * 0.5).clamp(-1.0, 1.0);
    cos.acos()
}

pub(crate) fn mat3_to_na(m: &DMat3) -> Matrix3<f64> {
    // both are column major
    Matrix3::from_column_slice(&m.to_cols_array())
}

pub(crate) fn mat3_from_na(m: &Matrix3<f64>) -> DMat3 {
    let mut cols = [0.0; 9];
    cols.copy_from_slice(m.as_slice());
    DMat3::from_cols_array(&cols)
}
