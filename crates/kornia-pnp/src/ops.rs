#![allow(clippy::op_ref)]
use glam::{DMat3, DVec3};
use nalgebra::{Matrix3x4, Matrix4, SMatrix, SVector, Vector3, Vector4};

/// Compute the centroid of a set of points.
pub(crate) fn compute_centroid(pts: &[[f64; 3]]) -> DVec3 {
    let n = pts.len().max(1) as f64;
    pts.iter()
        .fold(DVec3::ZERO, |acc, &p| acc + DVec3::from_array(p))
        / n
}

/// Pinhole projection helper built from a 3x3 intrinsics matrix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Projector {
    intr_x: DVec3,
    intr_y: DVec3,
}

impl Projector {
    pub(crate) fn new(k: &[[f64; 3]; 3]) -> Self {
        Self {
            intr_x: DVec3::new(k[0][0], 0.0, k[0][2]),
            intr_y: DVec3::new(0.0, k[1][1], k[1][2]),
        }
    }

    /// Project a camera-frame point, `None` if it is not in front of the camera.
    pub(crate) fn project(&self, pc: DVec3) -> Option<[f64; 2]> {
        if pc.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / pc.z;
        Some([self.intr_x.dot(pc) * inv_z, self.intr_y.dot(pc) * inv_z])
    }

    /// Squared pixel reprojection error of one correspondence under `(r, t)`.
    ///
    /// Points behind the camera give `None`.
    pub(crate) fn sq_error(
        &self,
        world_point: &[f64; 3],
        image_point: &[f64; 2],
        r: &DMat3,
        t: &DVec3,
    ) -> Option<f64> {
        let pc = *r * DVec3::from_array(*world_point) + *t;
        let [u, v] = self.project(pc)?;
        let du = u - image_point[0];
        let dv = v - image_point[1];
        Some(du.mul_add(du, dv * dv))
    }

    /// Root-mean-square reprojection error over all correspondences.
    ///
    /// A point behind the camera makes the error infinite.
    pub(crate) fn rmse(&self, world: &[[f64; 3]], image: &[[f64; 2]], r: &DMat3, t: &DVec3) -> f64 {
        if world.is_empty() {
            return 0.0;
        }
        let mut sum_sq = 0.0;
        for (pw, uv) in world.iter().zip(image.iter()) {
            match self.sq_error(pw, uv, r, t) {
                Some(e) => sum_sq += e,
                None => return f64::INFINITY,
            }
        }
        (sum_sq / world.len() as f64).sqrt()
    }
}

const EPSILON: f64 = 1e-10;
const NUM_CONTROL_POINTS: usize = 4;
pub(crate) const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
const NUM_PAIRS: usize = PAIRS.len();

/// Solves `A x = b` for a 4x4 symmetric positive-definite `A` with an unrolled
/// Cholesky decomposition. Returns `None` if `A` is not positive-definite.
#[inline(always)]
pub(crate) fn solve_4x4_cholesky(a: &Matrix4<f64>, b: &Vector4<f64>) -> Option<Vector4<f64>> {
    let l_11 = a.m11.sqrt();
    if l_11.is_nan() || l_11 < EPSILON {
        return None;
    }
    let l_21 = a.m21 / l_11;
    let l_31 = a.m31 / l_11;
    let l_41 = a.m41 / l_11;

    let l_22_sq = a.m22 - l_21 * l_21;
    if l_22_sq < EPSILON {
        return None;
    }
    let l_22 = l_22_sq.sqrt();
    let l_32 = (a.m32 - l_31 * l_21) / l_22;
    let l_42 = (a.m42 - l_41 * l_21) / l_22;

    let l_33_sq = a.m33 - l_31 * l_31 - l_32 * l_32;
    if l_33_sq < EPSILON {
        return None;
    }
    let l_33 = l_33_sq.sqrt();
    let l_43 = (a.m43 - l_41 * l_31 - l_42 * l_32) / l_33;

    let l_44_sq = a.m44 - l_41 * l_41 - l_42 * l_42 - l_43 * l_43;
    if l_44_sq < EPSILON {
        return None;
    }
    let l_44 = l_44_sq.sqrt();

    // L y = b
    let y1 = b[0] / l_11;
    let y2 = (b[1] - l_21 * y1) / l_22;
    let y3 = (b[2] - (l_31 * y1 + l_32 * y2)) / l_33;
    let y4 = (b[3] - (l_41 * y1 + l_42 * y2 + l_43 * y3)) / l_44;

    // Lᵗ x = y
    let x4 = y4 / l_44;
    let x3 = (y3 - l_43 * x4) / l_33;
    let x2 = (y2 - (l_32 * x3 + l_42 * x4)) / l_22;
    let x1 = (y1 - (l_21 * x2 + l_31 * x3 + l_41 * x4)) / l_11;
    Some(Vector4::new(x1, x2, x3, x4))
}

/// Refine the betas so the control point distances match `rho`.
///
/// `null4` is the 12x4 null-space basis; column `k` is multiplied by `beta[k]`.
/// Stops after `max_iters` steps or once the update vanishes.
pub(crate) fn gauss_newton(
    beta_init: [f64; 4],
    null4: &SMatrix<f64, 12, 4>,
    rho: &[f64; NUM_PAIRS],
    max_iters: usize,
) -> [f64; 4] {
    const DAMPING: f64 = 1e-12;
    const STOP_EPS: f64 = 1e-12;

    let mut bet = Vector4::from(beta_init);
    let rho_vec = SVector::<f64, NUM_PAIRS>::from_row_slice(rho);

    for _ in 0..max_iters {
        let mut vs = [Vector3::zeros(); NUM_CONTROL_POINTS];
        for (i, v) in vs.iter_mut().enumerate() {
            let m: Matrix3x4<f64> = null4.fixed_view::<3, 4>(i * 3, 0).into_owned();
            *v = m * bet;
        }

        let mut f = SVector::<f64, NUM_PAIRS>::zeros();
        let mut j = SMatrix::<f64, NUM_PAIRS, NUM_CONTROL_POINTS>::zeros();

        for (r, &(a, b)) in PAIRS.iter().enumerate() {
            let diff = vs[a] - vs[b];
            f[r] = diff.norm_squared();

            let rows_a = null4.fixed_rows::<3>(a * 3);
            let rows_b = null4.fixed_rows::<3>(b * 3);
            for k in 0..NUM_CONTROL_POINTS {
                let d_col = rows_a.column(k) - rows_b.column(k);
                j[(r, k)] = 2.0 * diff.dot(&d_col);
            }
        }

        f -= rho_vec;

        let mut a = j.transpose() * j;
        let b = j.transpose() * f;
        for d in 0..NUM_CONTROL_POINTS {
            a[(d, d)] += DAMPING;
        }

        let Some(delta) = solve_4x4_cholesky(&a, &b) else {
            break;
        };
        bet -= delta;
        if delta.norm() < STOP_EPS * (1.0 + bet.norm()) {
            break;
        }
    }

    bet.into()
}
