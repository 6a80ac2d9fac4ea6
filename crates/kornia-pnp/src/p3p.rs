//! Grunert's three-point pose: up to four world to camera poses from three
//! world points and their bearings.
//!
//! With exactly four correspondences the EPnP null space is four dimensional
//! and the beta approximations can settle on a wrong pose. The poses of each
//! triplet, scored on all four points, recover the exact one.

use glam::{DMat3, DVec3};
use kornia_registration::linalg::{rigid_to_parts, umeyama};
use nalgebra::Matrix4;

/// Imaginary part, relative to the magnitude, below which a root counts as real.
const IMAG_TOL: f64 = 1e-5;
const NEWTON_STEPS: usize = 8;
const TRIPLETS: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];

/// Unit bearing of a pixel through the pinhole `k`.
pub(crate) fn bearing(k: &[[f64; 3]; 3], uv: &[f64; 2]) -> DVec3 {
    DVec3::new(
        (uv[0] - k[0][2]) / k[0][0],
        (uv[1] - k[1][2]) / k[1][1],
        1.0,
    )
    .normalize()
}

/// World to camera poses consistent with three world points and their bearings.
///
/// Depths are written `s2 = u s1`, `s3 = v s1`. Eliminating `v` from the three
/// law-of-cosines constraints leaves a quartic in `u`; every positive real root
/// with a positive `v` gives one pose.
pub(crate) fn p3p(world: &[[f64; 3]; 3], bearings: &[DVec3; 3]) -> Vec<(DMat3, DVec3)> {
    let [p1, p2, p3] = world.map(DVec3::from_array);
    let [f1, f2, f3] = *bearings;

    let a2 = p2.distance_squared(p3);
    let b2 = p1.distance_squared(p3);
    let c2 = p1.distance_squared(p2);
    if a2 <= f64::EPSILON || b2 <= f64::EPSILON || c2 <= f64::EPSILON {
        return Vec::new();
    }
    let (ca, cb, cg) = (f2.dot(f3), f1.dot(f3), f1.dot(f2));

    // v = N(u) / D(u), and u solves N² - 2 cb N D + K D² = 0
    let n = [a2 - b2 + c2, -2.0 * (a2 - b2) * cg, a2 - b2 - c2];
    let d = [2.0 * c2 * cb, -2.0 * c2 * ca];
    let ratio = b2 / c2;
    let k = [1.0 - ratio, 2.0 * ratio * cg, -ratio];

    let nn = poly_mul(&n, &n);
    let nd = poly_mul(&n, &d);
    let kdd = poly_mul(&k, &poly_mul(&d, &d));
    let quartic: Vec<f64> = (0..5)
        .map(|i| nn[i] + kdd[i] - 2.0 * cb * nd.get(i).copied().unwrap_or(0.0))
        .collect();

    let mut poses = Vec::new();
    for u in real_roots(&quartic) {
        if u <= 0.0 {
            continue;
        }
        let den = d[0] + d[1] * u;
        if den.abs() <= f64::EPSILON * c2 {
            continue;
        }
        let v = (n[0] + n[1] * u + n[2] * u * u) / den;
        let base = 1.0 + u * u - 2.0 * u * cg;
        if v <= 0.0 || base <= 0.0 {
            continue;
        }

        let s1 = (c2 / base).sqrt();
        let camera = [f1 * s1, f2 * (u * s1), f3 * (v * s1)].map(|p| p.to_array());
        if let Ok(transform) = umeyama(world, &camera, false) {
            poses.push(rigid_to_parts(&transform));
        }
    }
    poses
}

/// Three-point poses of every triplet among the first four correspondences.
pub(crate) fn triplet_poses(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
) -> Vec<(DMat3, DVec3)> {
    if points_world.len() < 4 || points_image.len() < 4 {
        return Vec::new();
    }
    TRIPLETS
        .iter()
        .flat_map(|tri| {
            let world = tri.map(|i| points_world[i]);
            let bearings = tri.map(|i| bearing(k, &points_image[i]));
            p3p(&world, &bearings)
        })
        .collect()
}

/// Product of two polynomials with ascending coefficients.
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

/// Value and derivative of a polynomial with ascending coefficients.
fn poly_eval(p: &[f64], x: f64) -> (f64, f64) {
    p.iter()
        .rev()
        .fold((0.0, 0.0), |(f, df), &c| (f * x + c, df * x + f))
}

/// Real roots of a quartic with ascending coefficients, from the eigenvalues
/// of its companion matrix and polished with Newton steps.
fn real_roots(p: &[f64]) -> Vec<f64> {
    let scale = p.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if p.len() != 5 || scale == 0.0 || p[4].abs() <= 1e-12 * scale {
        return Vec::new();
    }
    let c: Vec<f64> = p.iter().map(|x| x / p[4]).collect();

    #[rustfmt::skip]
    let companion = Matrix4::new(
        0.0, 0.0, 0.0, -c[0],
        1.0, 0.0, 0.0, -c[1],
        0.0, 1.0, 0.0, -c[2],
        0.0, 0.0, 1.0, -c[3],
    );

    companion
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() <= IMAG_TOL * (1.0 + z.re.abs()))
        .map(|z| polish(p, z.re))
        .collect()
}

fn polish(p: &[f64], x0: f64) -> f64 {
    let mut x = x0;
    for _ in 0..NEWTON_STEPS {
        let (f, df) = poly_eval(p, x);
        if df.abs() <= f64::EPSILON {
            break;
        }
        let step = f / df;
        x -= step;
        if step.abs() <= f64::EPSILON * x.abs().max(1.0) {
            break;
        }
    }
    // a flat spot can throw Newton off, keep whichever end is closer to a root
    if poly_eval(p, x).0.abs() <= poly_eval(p, x0).0.abs() {
        x
    } else {
        x0
    }
}
