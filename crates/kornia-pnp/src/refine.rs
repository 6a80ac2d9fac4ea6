//! Levenberg–Marquardt pose refinement for PnP solutions.

use crate::ops::Projector;
use crate::pnp::{check_intrinsics, check_lengths, PnPError};
use glam::DVec3;
use kornia_registration::linalg::so3_exp;
use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LMParams {
    /// Maximum number of LM iterations.
    pub max_iters: usize,
    /// Convergence threshold on the largest cosine between the residual vector
    /// and a column of the Jacobian.
    pub eps: f64,
    /// Initial damping factor (lambda).
    pub lambda_init: f64,
    /// Multiplicative factor to increase/decrease lambda.
    pub lambda_mul: f64,
}

impl Default for LMParams {
    fn default() -> Self {
        Self {
            max_iters: 20,
            eps: 1e-6,
            lambda_init: 1e-3,
            lambda_mul: 10.0,
        }
    }
}

/// Reprojection RMSE in pixels treated as an exact fit.
const EXACT_FIT_PX: f64 = 1e-9;

/// Pixel residuals of all correspondences for the pose `x = [rx, ry, rz, tx, ty, tz]`.
///
/// Returns the summed squared error, or `None` if a point falls behind the camera.
fn residuals(
    projector: &Projector,
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    x: &[f64; 6],
    out: &mut [f64],
) -> Option<f64> {
    let r = so3_exp(DVec3::new(x[0], x[1], x[2]));
    let t = DVec3::new(x[3], x[4], x[5]);

    let mut sum_sq = 0.0;
    for (i, (pw, uv)) in points_world.iter().zip(points_image.iter()).enumerate() {
        let [u, v] = projector.project(r * DVec3::from_array(*pw) + t)?;
        let du = u - uv[0];
        let dv = v - uv[1];
        out[2 * i] = du;
        out[2 * i + 1] = dv;
        sum_sq += du.mul_add(du, dv * dv);
    }
    Some(sum_sq)
}

/// Refine a pose (rvec, t) with Levenberg–Marquardt to minimize pixel reprojection error.
///
/// - `points_world`: World points (N,3)
/// - `points_image`: Pixel points (N,2)
/// - `k`: Intrinsics 3x3
/// - `rvec`: Initial axis-angle rotation (input/output)
/// - `t`: Initial translation (input/output)
///
/// Returns `(rmse, num_iters, converged)` and writes refined `rvec` and `t` in place.
/// The RMSE is taken per correspondence, in pixels. `converged` means the pose
/// is stationary: the residual is orthogonal to every Jacobian column within
/// `params.eps`, or it vanishes. Running out of iterations, however small the
/// last steps were, is not convergence.
pub fn refine_pose_lm(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    rvec: &mut [f64; 3],
    t: &mut [f64; 3],
    params: &LMParams,
) -> Result<(f64, usize, bool), PnPError> {
    check_lengths(points_world, points_image)?;
    check_intrinsics(k)?;

    let n = points_world.len();
    if n < 3 {
        return Err(PnPError::InsufficientCorrespondences {
            required: 3,
            actual: n,
        });
    }

    let projector = Projector::new(k);
    let mut x = [rvec[0], rvec[1], rvec[2], t[0], t[1], t[2]];

    let mut res = vec![0.0; 2 * n];
    let mut res_p = vec![0.0; 2 * n];
    let mut res_m = vec![0.0; 2 * n];
    let mut jac = vec![[0.0; 6]; 2 * n];

    let Some(mut err_sq) = residuals(&projector, points_world, points_image, &x, &mut res) else {
        // initial pose puts points behind the camera, nothing to descend on
        return Ok((f64::INFINITY, 0, false));
    };

    let mut lambda = params.lambda_init;
    let mut iters = 0;
    let mut converged = false;

    while iters < params.max_iters {
        iters += 1;

        const H_ROT: f64 = 1e-6;
        let t_scale = x[3].abs().max(x[4].abs()).max(x[5].abs()).max(1.0);
        let h_trans = 1e-6 * t_scale;

        let mut jacobian_ok = true;
        for c in 0..6 {
            let h = if c < 3 { H_ROT } else { h_trans };
            let mut x_p = x;
            let mut x_m = x;
            x_p[c] += h;
            x_m[c] -= h;
            let plus = residuals(&projector, points_world, points_image, &x_p, &mut res_p);
            let minus = residuals(&projector, points_world, points_image, &x_m, &mut res_m);
            if plus.is_none() || minus.is_none() {
                jacobian_ok = false;
                break;
            }
            for (row, (p, m)) in jac.iter_mut().zip(res_p.iter().zip(res_m.iter())) {
                row[c] = (p - m) / (2.0 * h);
            }
        }
        if !jacobian_ok {
            log::trace!("LM: pose on the cheirality boundary, stopping at iteration {iters}");
            break;
        }

        let mut a = Matrix6::<f64>::zeros();
        let mut b = Vector6::<f64>::zeros();
        for (row, &r) in jac.iter().zip(res.iter()) {
            let j = Vector6::from_row_slice(row);
            a += j * j.transpose();
            b += j * r;
        }

        // stationary: Jᵗr vanishes relative to the column and residual norms
        let res_norm = err_sq.sqrt();
        if res_norm <= EXACT_FIT_PX * (n as f64).sqrt() {
            converged = true;
            break;
        }
        let cosine = (0..6)
            .map(|c| {
                let col_norm = a[(c, c)].sqrt();
                if col_norm > 0.0 {
                    b[c].abs() / (col_norm * res_norm)
                } else {
                    0.0
                }
            })
            .fold(0.0, f64::max);
        if cosine <= params.eps {
            converged = true;
            break;
        }

        // (JᵗJ + λI) δ = -Jᵗr
        for d in 0..6 {
            a[(d, d)] += lambda;
        }

        let Some(delta) = a.lu().solve(&(-b)) else {
            lambda *= params.lambda_mul;
            continue;
        };

        let mut x_new = x;
        for (xi, di) in x_new.iter_mut().zip(delta.iter()) {
            *xi += di;
        }

        match residuals(&projector, points_world, points_image, &x_new, &mut res_p) {
            Some(err_new) if err_new < err_sq => {
                x = x_new;
                res.copy_from_slice(&res_p);
                err_sq = err_new;
                lambda = (lambda / params.lambda_mul).max(1e-12);
            }
            _ => lambda *= params.lambda_mul,
        }
    }

    rvec.copy_from_slice(&x[0..3]);
    t.copy_from_slice(&x[3..6]);

    let rmse = (err_sq / n as f64).sqrt();
    Ok((rmse, iters, converged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::rows_to_mat3;
    use crate::{EPnP, EPnPParams, PnPSolver};

    const K: [[f64; 3]; 3] = [[800.0, 0.0, 640.0], [0.0, 800.0, 480.0], [0.0, 0.0, 1.0]];

    fn scene() -> (Vec<[f64; 3]>, Vec<[f64; 2]>, DVec3, DVec3) {
        let omega = DVec3::new(0.1, -0.25, 0.05);
        let t = DVec3::new(0.2, -0.1, 4.0);
        let r = so3_exp(omega);
        let projector = Projector::new(&K);

        let world: Vec<[f64; 3]> = (0..12)
            .map(|i| {
                let f = i as f64;
                [(f * 0.7).sin(), (f * 1.3).cos() * 0.8, (f * 0.4).sin() * 0.6]
            })
            .collect();
        let image = world
            .iter()
            .filter_map(|p| projector.project(r * DVec3::from_array(*p) + t))
            .collect();
        (world, image, omega, t)
    }

    #[test]
    fn test_refine_recovers_perturbed_pose() -> Result<(), PnPError> {
        let (world, image, omega, t_true) = scene();

        let mut rvec = (omega + DVec3::new(0.02, -0.01, 0.015)).to_array();
        let mut t = (t_true + DVec3::new(0.05, 0.03, -0.1)).to_array();
        let (rmse, iters, converged) =
            refine_pose_lm(&world, &image, &K, &mut rvec, &mut t, &LMParams::default())?;

        assert!(converged);
        assert!(rmse < 1e-3, "rmse {rmse}");
        assert!(iters <= LMParams::default().max_iters);
        assert!(DVec3::from_array(rvec).abs_diff_eq(omega, 1e-4));
        assert!(DVec3::from_array(t).abs_diff_eq(t_true, 1e-3));
        Ok(())
    }

    #[test]
    fn test_refine_lm_reduces_rmse() -> Result<(), PnPError> {
        let points_world: [[f64; 3]; 6] = [
            [0.0315, 0.03333, -0.10409],
            [-0.0315, 0.03333, -0.10409],
            [0.0, -0.00102, -0.12977],
            [0.02646, -0.03167, -0.1053],
            [-0.02646, -0.031667, -0.1053],
            [0.0, 0.04515, -0.11033],
        ];
        let points_image: [[f64; 2]; 6] = [
            [722.96466, 502.0828],
            [669.88837, 498.61877],
            [707.0025, 478.48975],
            [728.05634, 447.56918],
            [682.6069, 443.91776],
            [696.4414, 511.96442],
        ];

        let closed_form = EPnPParams {
            refine_lm: None,
            ..Default::default()
        };
        let res_epnp = EPnP::solve(&points_world, &points_image, &K, &closed_form)?;
        let rmse0 = res_epnp.reproj_rmse.unwrap_or(f64::INFINITY);

        let res_lm = EPnP::solve(&points_world, &points_image, &K, &EPnPParams::default())?;
        let rmse1 = res_lm.reproj_rmse.unwrap_or(f64::INFINITY);

        assert!(rmse1 <= rmse0 + 1e-9, "LM RMSE should not be worse: {rmse1} vs {rmse0}");
        assert!(res_lm.converged.is_some());
        // rotation stays orthonormal
        let r = rows_to_mat3(&res_lm.rotation);
        assert!((r * r.transpose()).abs_diff_eq(glam::DMat3::IDENTITY, 1e-9));
        Ok(())
    }

    #[test]
    fn test_damped_steps_are_not_convergence() -> Result<(), PnPError> {
        let (world, image, omega, t_true) = scene();
        let mut rvec = (omega + DVec3::new(0.02, -0.01, 0.015)).to_array();
        let mut t = (t_true + DVec3::new(0.05, 0.03, -0.1)).to_array();

        // every accepted step is tiny, the pose barely moves
        let params = LMParams {
            max_iters: 5,
            lambda_init: 1e20,
            ..Default::default()
        };
        let (rmse, iters, converged) = refine_pose_lm(&world, &image, &K, &mut rvec, &mut t, &params)?;
        assert!(!converged);
        assert_eq!(iters, 5);
        assert!(rmse > 1.0, "rmse {rmse}");
        Ok(())
    }

    #[test]
    fn test_refine_errors() {
        let mut rvec = [0.0; 3];
        let mut t = [0.0, 0.0, 1.0];
        let params = LMParams::default();
        assert!(matches!(
            refine_pose_lm(&[[0.0; 3]; 2], &[[0.0; 2]; 2], &K, &mut rvec, &mut t, &params),
            Err(PnPError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            refine_pose_lm(&[[0.0; 3]; 4], &[[0.0; 2]; 3], &K, &mut rvec, &mut t, &params),
            Err(PnPError::MismatchedArrayLengths { .. })
        ));
        let no_focal = [[0.0, 0.0, 640.0], [0.0, 0.0, 480.0], [0.0, 0.0, 1.0]];
        assert!(matches!(
            refine_pose_lm(&[[0.0; 3]; 4], &[[0.0; 2]; 4], &no_focal, &mut rvec, &mut t, &params),
            Err(PnPError::InvalidIntrinsics(_))
        ));
    }

    #[test]
    fn test_params_from_json() -> Result<(), serde_json::Error> {
        let params: LMParams = serde_json::from_str(r#"{"max_iters": 5}"#)?;
        assert_eq!(params.max_iters, 5);
        assert_eq!(params.lambda_mul, 10.0);
        Ok(())
    }
}
