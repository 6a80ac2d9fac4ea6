//! Efficient Perspective-n-Point (EPnP) solver
//! Paper: https://www.tugraz.at/fileadmin/user_upload/Institute/ICG/Images/team_lepetit/publications/lepetit_ijcv08.pdf
//! Reference: https://github.com/opencv/opencv/blob/4.x/modules/calib3d/src/epnp.cpp

use crate::ops::{compute_centroid, gauss_newton, Projector, PAIRS};
use crate::p3p::triplet_poses;
use crate::pnp::{
    check_intrinsics, check_lengths, rotation_to_rvec, NumericTol, PnPError, PnPResult, PnPSolver,
};
use crate::refine::{refine_pose_lm, LMParams};
use glam::{DMat3, DVec3};
use kornia_registration::linalg::{rigid_to_parts, so3_exp, umeyama};
use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, SymmetricEigen, Vector3};

/// Marker type representing the Efficient PnP algorithm.
pub struct EPnP;

impl PnPSolver for EPnP {
    type Param = EPnPParams;

    fn solve(
        points_world: &[[f64; 3]],
        points_image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_epnp(points_world, points_image, k, params)
    }
}

/// Parameters controlling the EPnP solver.
#[derive(Debug, Clone)]
pub struct EPnPParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
    /// Refine the closed-form pose with Levenberg–Marquardt.
    pub refine_lm: Option<LMParams>,
    /// Closed-form reprojection RMSE in pixels above which every candidate
    /// pose is refined, not only the best one.
    pub multi_start_rmse_px: f64,
}

impl Default for EPnPParams {
    fn default() -> Self {
        Self {
            tol: NumericTol::default(),
            refine_lm: Some(LMParams::default()),
            multi_start_rmse_px: 0.5,
        }
    }
}

type Null4 = SMatrix<f64, 12, 4>;

/// Beta Gauss–Newton budget in the overdetermined case.
const GN_ITERATIONS: usize = 5;
/// With four points the beta approximations start far off, iterate to convergence.
const GN_ITERATIONS_MINIMAL: usize = 50;

/// Solve Perspective-n-Point (EPnP).
///
/// # Arguments
/// * `points_world` – 3-D coordinates in the world frame, shape *(N,3)* with `N≥4`.
/// * `points_image` – Corresponding pixel coordinates, shape *(N,2)*.
/// * `k` – Camera intrinsics matrix.
/// * `params` – Solver parameters.
///
/// # Returns
/// The world to camera pose with its reprojection RMSE in pixels.
pub fn solve_epnp(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    params: &EPnPParams,
) -> Result<PnPResult, PnPError> {
    check_lengths(points_world, points_image)?;
    check_intrinsics(k)?;
    let n = points_world.len();
    if n < 4 {
        return Err(PnPError::InsufficientCorrespondences {
            required: 4,
            actual: n,
        });
    }

    let cw = select_control_points(points_world);
    let alphas = compute_barycentric(points_world, &cw, params.tol.eps);
    let m = build_m(&alphas, points_image, k);
    let null4 = null_space(&m)?;

    let l = build_l6x10(&null4);
    let rho = rho_ctrlpts(&cw);
    let rho_vec = DVector::from_column_slice(&rho);

    let betas = [
        estimate_beta_approx_1(&l, &rho_vec, params.tol.svd),
        estimate_beta_approx_2(&l, &rho_vec, params.tol.svd),
        estimate_beta_approx_3(&l, &rho_vec, params.tol.svd),
    ];
    let gn_iterations = if n == 4 { GN_ITERATIONS_MINIMAL } else { GN_ITERATIONS };

    let mut poses: Vec<(DMat3, DVec3)> = betas
        .into_iter()
        .flatten()
        .filter_map(|beta| {
            let beta = gauss_newton(beta, &null4, &rho, gn_iterations);
            pose_from_betas(&beta, &null4, &alphas, points_world)
        })
        .collect();
    if n == 4 {
        poses.extend(triplet_poses(points_world, points_image, k));
    }

    let projector = Projector::new(k);
    let mut candidates: Vec<(DMat3, DVec3, f64)> = poses
        .into_iter()
        .map(|(r, t)| (r, t, projector.rmse(points_world, points_image, &r, &t)))
        .collect();
    candidates.sort_by(|a, b| a.2.total_cmp(&b.2));

    let Some(&(r, t, err)) = candidates.first() else {
        return Err(PnPError::SvdFailed(
            "no candidate pose from the beta approximations".to_string(),
        ));
    };

    let Some(lm) = &params.refine_lm else {
        let mut result = PnPResult::from_rt(r, t);
        result.reproj_rmse = Some(err);
        return Ok(result);
    };

    // an inconsistent best candidate may sit in the wrong basin, try them all
    let starts = if err <= params.multi_start_rmse_px {
        &candidates[..1]
    } else {
        &candidates[..]
    };

    let mut best: Option<([f64; 3], [f64; 3], f64, usize, bool)> = None;
    for (r0, t0, _) in starts {
        let mut rvec = rotation_to_rvec(r0).to_array();
        let mut tvec = t0.to_array();
        let (rmse, iters, converged) =
            refine_pose_lm(points_world, points_image, k, &mut rvec, &mut tvec, lm)?;
        let better = match &best {
            Some((_, _, e, _, _)) => rmse < *e,
            None => true,
        };
        if better {
            best = Some((rvec, tvec, rmse, iters, converged));
        }
    }
    let Some((rvec, tvec, rmse, iters, converged)) = best else {
        return Err(PnPError::SvdFailed("no candidate pose to refine".to_string()));
    };
    log::trace!(
        "EPnP: closed form rmse {err:.4} px, refined {rmse:.4} px from {} start(s)",
        starts.len()
    );

    let mut result = PnPResult::from_rt(so3_exp(DVec3::from_array(rvec)), DVec3::from_array(tvec));
    result.reproj_rmse = Some(rmse);
    result.num_iterations = Some(iters);
    result.converged = Some(converged);
    Ok(result)
}

/// Four right singular vectors of `M` with the smallest singular values, as columns.
fn null_space(m: &DMatrix<f64>) -> Result<Null4, PnPError> {
    let mtm = m.transpose() * m;
    let svd = mtm.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| PnPError::SvdFailed("failed to compute Vᵗ of MᵗM".to_string()))?;

    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));

    let mut null4 = Null4::zeros();
    for (c, &idx) in order.iter().take(4).enumerate() {
        for r in 0..12 {
            null4[(r, c)] = v_t[(idx, r)];
        }
    }
    Ok(null4)
}

/// Camera-frame control points from betas, then the pose aligning the world
/// points with their camera-frame reconstruction.
fn pose_from_betas(
    betas: &[f64; 4],
    null4: &Null4,
    alphas: &[[f64; 4]],
    points_world: &[[f64; 3]],
) -> Option<(DMat3, DVec3)> {
    let cc = null4 * nalgebra::Vector4::from(*betas);
    let ccs: [DVec3; 4] = std::array::from_fn(|i| DVec3::new(cc[3 * i], cc[3 * i + 1], cc[3 * i + 2]));

    let mut pcs: Vec<[f64; 3]> = alphas
        .iter()
        .map(|a| {
            (0..4)
                .fold(DVec3::ZERO, |acc, j| acc + a[j] * ccs[j])
                .to_array()
        })
        .collect();

    // the reconstruction is defined up to sign, keep it in front of the camera
    if pcs[0][2] < 0.0 {
        for p in &mut pcs {
            *p = p.map(|x| -x);
        }
    }

    let transform = umeyama(points_world, &pcs, false).ok()?;
    Some(rigid_to_parts(&transform))
}

/// Centroid plus the principal axes of the world points, scaled by their spread.
fn select_control_points(points_world: &[[f64; 3]]) -> [DVec3; 4] {
    let c = compute_centroid(points_world);
    let n = points_world.len() as f64;

    let mut cov = Matrix3::<f64>::zeros();
    for p in points_world {
        let d = DVec3::from_array(*p) - c;
        let d = Vector3::new(d.x, d.y, d.z);
        cov += d * d.transpose();
    }
    cov /= n;

    let eig = SymmetricEigen::new(cov);
    let mut axes: Vec<(f64, DVec3)> = (0..3)
        .map(|i| {
            let e = eig.eigenvectors.column(i);
            (eig.eigenvalues[i].max(0.0).sqrt(), DVec3::new(e[0], e[1], e[2]))
        })
        .collect();
    axes.sort_by(|a, b| b.0.total_cmp(&a.0));

    [c, c + axes[0].0 * axes[0].1, c + axes[1].0 * axes[1].1, c + axes[2].0 * axes[2].1]
}

/// Barycentric coordinates of the world points with respect to the control points.
///
/// Each element is `[α0, α1, α2, α3]` with `Σ αj = 1` and `pw = Σ αj cw_j`. When
/// the control tetrahedron is degenerate (`|det| <= eps`) the pseudo-inverse is used.
fn compute_barycentric(points_world: &[[f64; 3]], cw: &[DVec3; 4], eps: f64) -> Vec<[f64; 4]> {
    let cols = [cw[1] - cw[0], cw[2] - cw[0], cw[3] - cw[0]].map(|d| Vector3::new(d.x, d.y, d.z));
    let b = Matrix3::from_columns(&cols);

    let b_inv = if b.determinant().abs() > eps {
        b.try_inverse()
    } else {
        None
    }
    .or_else(|| b.pseudo_inverse(eps).ok())
    .unwrap_or_else(Matrix3::zeros);

    points_world
        .iter()
        .map(|p| {
            let d = DVec3::from_array(*p) - cw[0];
            let l = b_inv * Vector3::new(d.x, d.y, d.z);
            [1.0 - (l.x + l.y + l.z), l.x, l.y, l.z]
        })
        .collect()
}

/// The 2N×12 design matrix **M**: two rows per correspondence.
fn build_m(alphas: &[[f64; 4]], points_image: &[[f64; 2]], k: &[[f64; 3]; 3]) -> DMatrix<f64> {
    let (fu, fv, uc, vc) = (k[0][0], k[1][1], k[0][2], k[1][2]);
    let mut m = DMatrix::<f64>::zeros(2 * alphas.len(), 12);

    for (i, (a, uv)) in alphas.iter().zip(points_image.iter()).enumerate() {
        for (j, &alpha) in a.iter().enumerate() {
            let base = 3 * j;
            m[(2 * i, base)] = alpha * fu;
            m[(2 * i, base + 2)] = alpha * (uc - uv[0]);
            m[(2 * i + 1, base + 1)] = alpha * fv;
            m[(2 * i + 1, base + 2)] = alpha * (vc - uv[1]);
        }
    }
    m
}

/// The 6×10 matrix **L** relating the products of betas
/// `[β11 β12 β22 β13 β23 β33 β14 β24 β34 β44]` to the squared control point distances.
fn build_l6x10(null4: &Null4) -> SMatrix<f64, 6, 10> {
    // dv[i][j]: difference of control point pair j in null vector i
    let dv: [[DVec3; 6]; 4] = std::array::from_fn(|i| {
        let v = null4.column(i);
        let block = |k: usize| DVec3::new(v[3 * k], v[3 * k + 1], v[3 * k + 2]);
        PAIRS.map(|(a, b)| block(a) - block(b))
    });

    let mut l = SMatrix::<f64, 6, 10>::zeros();
    for j in 0..6 {
        let d = [dv[0][j], dv[1][j], dv[2][j], dv[3][j]];
        let row = [
            d[0].dot(d[0]),
            2.0 * d[0].dot(d[1]),
            d[1].dot(d[1]),
            2.0 * d[0].dot(d[2]),
            2.0 * d[1].dot(d[2]),
            d[2].dot(d[2]),
            2.0 * d[0].dot(d[3]),
            2.0 * d[1].dot(d[3]),
            2.0 * d[2].dot(d[3]),
            d[3].dot(d[3]),
        ];
        for (c, value) in row.into_iter().enumerate() {
            l[(j, c)] = value;
        }
    }
    l
}

/// Least-squares solve of `L[:, cols] x = rho`.
fn solve_l_subset(l: &SMatrix<f64, 6, 10>, cols: &[usize], rho: &DVector<f64>, tol_svd: f64) -> Option<DVector<f64>> {
    let sub = DMatrix::from_fn(6, cols.len(), |r, c| l[(r, cols[c])]);
    sub.svd(true, true).solve(rho, tol_svd).ok()
}

// betas_approx_1: [β11 β12 β13 β14]
fn estimate_beta_approx_1(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_l_subset(l, &[0, 1, 3, 6], rho, tol)?;
    if x[0].abs() < f64::EPSILON {
        return None;
    }
    Some(if x[0] < 0.0 {
        let b0 = (-x[0]).sqrt();
        [b0, -x[1] / b0, -x[2] / b0, -x[3] / b0]
    } else {
        let b0 = x[0].sqrt();
        [b0, x[1] / b0, x[2] / b0, x[3] / b0]
    })
}

// betas_approx_2: [β11 β12 β22]
fn estimate_beta_approx_2(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_l_subset(l, &[0, 1, 2], rho, tol)?;
    let (mut b0, b1) = if x[0] < 0.0 {
        ((-x[0]).sqrt(), if x[2] < 0.0 { (-x[2]).sqrt() } else { 0.0 })
    } else {
        (x[0].sqrt(), if x[2] > 0.0 { x[2].sqrt() } else { 0.0 })
    };
    if x[1] < 0.0 {
        b0 = -b0;
    }
    Some([b0, b1, 0.0, 0.0])
}

// betas_approx_3: [β11 β12 β22 β13 β23]
fn estimate_beta_approx_3(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_l_subset(l, &[0, 1, 2, 3, 4], rho, tol)?;
    let (mut b0, b1) = if x[0] < 0.0 {
        ((-x[0]).sqrt(), if x[2] < 0.0 { (-x[2]).sqrt() } else { 0.0 })
    } else {
        (x[0].sqrt(), if x[2] > 0.0 { x[2].sqrt() } else { 0.0 })
    };
    if x[1] < 0.0 {
        b0 = -b0;
    }
    if b0.abs() < f64::EPSILON {
        return None;
    }
    Some([b0, b1, x[3] / b0, 0.0])
}

/// The six squared distances (ρ vector) between the 4 control points.
fn rho_ctrlpts(cw: &[DVec3; 4]) -> [f64; 6] {
    PAIRS.map(|(i, j)| cw[i].distance_squared(cw[j]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn k() -> [[f64; 3]; 3] {
        [[800.0, 0.0, 640.0], [0.0, 800.0, 480.0], [0.0, 0.0, 1.0]]
    }

    fn truth() -> (DMat3, DVec3) {
        (so3_exp(DVec3::new(0.1, -0.25, 0.05)), DVec3::new(0.2, -0.1, 4.0))
    }

    fn project_all(world: &[[f64; 3]]) -> Vec<[f64; 2]> {
        let (r, t) = truth();
        let proj = Projector::new(&k());
        world
            .iter()
            .filter_map(|p| proj.project(r * DVec3::from_array(*p) + t))
            .collect()
    }

    fn cube_points() -> Vec<[f64; 3]> {
        vec![
            [-0.5, -0.4, -0.3],
            [0.6, -0.5, 0.2],
            [0.4, 0.5, -0.4],
            [-0.6, 0.3, 0.5],
            [0.1, 0.0, 0.7],
            [-0.2, -0.6, -0.6],
            [0.5, 0.2, 0.4],
            [-0.3, 0.6, -0.1],
        ]
    }

    #[test]
    fn test_barycentric_reconstruction() {
        let points_world = [
            [0.0315, 0.03333, -0.10409],
            [-0.0315, 0.03333, -0.10409],
            [0.0, -0.00102, -0.12977],
            [0.02646, -0.03167, -0.1053],
            [-0.02646, -0.031667, -0.1053],
            [0.0, 0.04515, -0.11033],
        ];
        let cw = select_control_points(&points_world);
        let alphas = compute_barycentric(&points_world, &cw, NumericTol::default().eps);

        for (p, alpha) in points_world.iter().zip(alphas.iter()) {
            let recon = (0..4).fold(DVec3::ZERO, |acc, j| acc + alpha[j] * cw[j]);
            for c in 0..3 {
                assert_relative_eq!(recon[c], p[c], epsilon = 1e-12);
            }
            assert_relative_eq!(alpha.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_build_m_layout() {
        let alphas = [[0.1, 0.2, 0.3, 0.4]];
        let image = [[700.0, 500.0]];
        let m = build_m(&alphas, &image, &k());
        assert_eq!(m.shape(), (2, 12));
        for j in 0..4 {
            assert_relative_eq!(m[(0, 3 * j)], alphas[0][j] * 800.0);
            assert_eq!(m[(0, 3 * j + 1)], 0.0);
            assert_relative_eq!(m[(0, 3 * j + 2)], alphas[0][j] * (640.0 - 700.0));
            assert_relative_eq!(m[(1, 3 * j + 1)], alphas[0][j] * 800.0);
            assert_relative_eq!(m[(1, 3 * j + 2)], alphas[0][j] * (480.0 - 500.0));
        }
    }

    #[test]
    fn test_solve_epnp_exact() -> Result<(), PnPError> {
        let world = cube_points();
        let image = project_all(&world);
        let params = EPnPParams {
            refine_lm: None,
            ..Default::default()
        };
        let res = EPnP::solve(&world, &image, &k(), &params)?;

        let (r, t) = truth();
        assert!(res.rotation_matrix().abs_diff_eq(r, 1e-6));
        assert!(DVec3::from_array(res.translation).abs_diff_eq(t, 1e-5));
        assert!(res.reproj_rmse.is_some_and(|e| e < 1e-3));
        assert!(DVec3::from_array(res.rvec).abs_diff_eq(DVec3::new(0.1, -0.25, 0.05), 1e-6));
        Ok(())
    }

    #[test]
    fn test_solve_epnp_four_points() -> Result<(), PnPError> {
        let world = cube_points()[..4].to_vec();
        let image = project_all(&world);
        let res = EPnP::solve(&world, &image, &k(), &EPnPParams::default())?;

        let proj = Projector::new(&k());
        let r = res.rotation_matrix();
        let t = DVec3::from_array(res.translation);
        for (pw, uv) in world.iter().zip(image.iter()) {
            let err = proj.sq_error(pw, uv, &r, &t).map(f64::sqrt);
            assert!(err.is_some_and(|e| e < 0.5), "reprojection error {err:?}");
        }
        Ok(())
    }

    #[test]
    fn test_four_points_closed_form_is_consistent() -> Result<(), PnPError> {
        let mut rng = StdRng::seed_from_u64(3);
        let closed_form = EPnPParams {
            refine_lm: None,
            ..Default::default()
        };
        let proj = Projector::new(&k());
        for scene in 0..50 {
            let world: Vec<[f64; 3]> = (0..4)
                .map(|_| {
                    [
                        rng.random_range(-1.0..1.0),
                        rng.random_range(-1.0..1.0),
                        rng.random_range(-0.5..0.5),
                    ]
                })
                .collect();
            let image = project_all(&world);

            for params in [&closed_form, &EPnPParams::default()] {
                let res = EPnP::solve(&world, &image, &k(), params)?;
                let (r, t) = (res.rotation_matrix(), DVec3::from_array(res.translation));
                for (pw, uv) in world.iter().zip(image.iter()) {
                    let err = proj.sq_error(pw, uv, &r, &t).map(f64::sqrt);
                    assert!(err.is_some_and(|e| e < 1e-3), "scene {scene}: {err:?}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_solve_epnp_invalid_intrinsics() {
        let k = [[800.0, 0.0, 640.0], [0.0, 0.0, 480.0], [0.0, 0.0, 1.0]];
        let world = cube_points();
        let image = project_all(&world);
        assert!(matches!(
            solve_epnp(&world, &image, &k, &EPnPParams::default()),
            Err(PnPError::InvalidIntrinsics(_))
        ));
    }

    #[test]
    fn test_refinement_does_not_worsen() -> Result<(), PnPError> {
        let world = cube_points();
        let mut image = project_all(&world);
        // deterministic sub-pixel noise
        for (i, uv) in image.iter_mut().enumerate() {
            uv[0] += 0.4 * ((i as f64) * 1.7).sin();
            uv[1] += 0.4 * ((i as f64) * 2.3).cos();
        }
        let closed = EPnP::solve(
            &world,
            &image,
            &k(),
            &EPnPParams {
                refine_lm: None,
                ..Default::default()
            },
        )?;
        let refined = EPnP::solve(&world, &image, &k(), &EPnPParams::default())?;
        let (e0, e1) = (
            closed.reproj_rmse.unwrap_or(f64::INFINITY),
            refined.reproj_rmse.unwrap_or(f64::INFINITY),
        );
        assert!(e1 <= e0 + 1e-9, "refined {e1} vs closed form {e0}");
        assert!(e1 < 0.6);
        Ok(())
    }

    #[test]
    fn test_solve_epnp_errors() {
        let k = k();
        assert!(matches!(
            solve_epnp(&[[0.0; 3]; 3], &[[0.0; 2]; 3], &k, &EPnPParams::default()),
            Err(PnPError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            solve_epnp(&[[0.0; 3]; 5], &[[0.0; 2]; 4], &k, &EPnPParams::default()),
            Err(PnPError::MismatchedArrayLengths { .. })
        ));
    }
}
