use argh::FromArgs;
use glam::{DMat4, DVec3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use kornia_pnp as kpnp;
use kornia_registration::linalg::{rigid_from_parts, rotation_angle, so3_exp};
use kornia_registration::sink::{show_ransac, show_registration};
use kornia_registration::{
    self as kreg, GeometrySink, ICPConvergenceCriteria, PinholeCameraIntrinsic, PointCloud,
    ReductionMethod, TransformationEstimation,
};

#[derive(FromArgs)]
/// Aligns a synthetic surface with ICP and both RANSAC estimators
struct Args {
    /// optional JSON file with the estimator parameters
    #[argh(option)]
    config: Option<PathBuf>,

    /// number of samples along each side of the surface grid
    #[argh(option, default = "40")]
    grid: usize,

    /// fraction of corrupted correspondences for the RANSAC runs
    #[argh(option, default = "0.3")]
    outliers: f64,

    /// seed for the synthetic data
    #[argh(option, default = "0")]
    seed: u64,
}

/// Estimator parameters, every field optional in the JSON file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DemoConfig {
    max_correspondence_distance: Option<f64>,
    reduction: ReductionMethod,
    icp: ICPConvergenceCriteria,
    ransac: kreg::RansacParams,
    pnp: kpnp::RansacParams,
}

/// Logs what it is shown instead of drawing it.
struct LoggingSink;

impl GeometrySink for LoggingSink {
    type Error = std::convert::Infallible;

    fn show(&mut self, name: &str, cloud: &PointCloud, transformation: &DMat4) -> Result<(), Self::Error> {
        let t = transformation.w_axis.truncate();
        log::info!(
            "[{name}] {} points, rotation {:.4} rad, translation [{:.4}, {:.4}, {:.4}]",
            cloud.len(),
            rotation_angle(transformation),
            t.x,
            t.y,
            t.z
        );
        Ok(())
    }
}

/// A wavy surface with analytic normals.
fn surface(grid: usize) -> Result<PointCloud, kreg::RegistrationError> {
    let step = 2.0 / grid.max(2) as f64;
    let mut points = Vec::with_capacity(grid * grid);
    let mut normals = Vec::with_capacity(grid * grid);
    for i in 0..grid {
        for j in 0..grid {
            let (x, y) = (i as f64 * step - 1.0, j as f64 * step - 1.0);
            let z = 0.3 * (2.0 * x).sin() * (3.0 * y).cos();
            let dzdx = 0.6 * (2.0 * x).cos() * (3.0 * y).cos();
            let dzdy = -0.9 * (2.0 * x).sin() * (3.0 * y).sin();
            points.push([x, y, z]);
            normals.push(DVec3::new(-dzdx, -dzdy, 1.0).normalize().to_array());
        }
    }
    PointCloud::new(points, Some(normals), None)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config: DemoConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => DemoConfig::default(),
    };
    log::debug!("config: {config:?}");

    let mut sink = LoggingSink;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let source = surface(args.grid)?;
    let motion = rigid_from_parts(so3_exp(DVec3::new(0.05, -0.03, 0.08)), DVec3::new(0.06, -0.02, 0.03));
    let target = source.transformed(&motion);
    println!("Surface: #{} points", source.len());

    // ICP, both cost models from the identity
    let max_distance = config.max_correspondence_distance.unwrap_or(0.2);
    for estimation in [TransformationEstimation::default(), TransformationEstimation::PointToPlane] {
        let result = kreg::registration_icp(
            &source,
            &target,
            max_distance,
            &DMat4::IDENTITY,
            estimation,
            &config.icp,
            config.reduction,
        )?;
        println!(
            "ICP {:?}: {:?} after {} iterations, fitness {:.3}, rmse {:.2e}",
            estimation, result.status, result.num_iterations, result.fitness, result.inlier_rmse
        );
        show_registration(&mut sink, "icp", &source, &result)?;
    }

    // 3D-3D RANSAC on known pairs, some of them corrupted
    let src = source.points().to_vec();
    let mut dst = target.points().to_vec();
    let num_bad = (args.outliers.clamp(0.0, 1.0) * dst.len() as f64) as usize;
    for p in dst.iter_mut().take(num_bad) {
        for c in p.iter_mut() {
            *c += rng.random_range(-1.0..1.0);
        }
    }
    let ransac = kreg::estimate_rigid_ransac(&src, &dst, config.ransac.clone())?;
    println!(
        "RANSAC 3D-3D: success {}, {}/{} inliers in {} iterations",
        ransac.success,
        ransac.num_inliers,
        src.len(),
        ransac.num_iterations
    );
    show_ransac(&mut sink, "ransac_3d3d", &source, &ransac)?;

    // PnP RANSAC: the target camera looks at the surface from 3 m
    let intrinsic = PinholeCameraIntrinsic::new(525.0, 525.0, 319.5, 239.5)?;
    let camera = DMat4::from_translation(DVec3::new(0.0, 0.0, 3.0)) * motion;
    let mut world = Vec::new();
    let mut pixels = Vec::new();
    for (i, p) in src.iter().enumerate() {
        let Some(mut px) = intrinsic.project(camera.transform_point3(DVec3::from_array(*p))) else {
            continue;
        };
        if i < num_bad {
            px[0] += rng.random_range(20.0..60.0);
            px[1] -= rng.random_range(20.0..60.0);
        }
        world.push(*p);
        pixels.push(px);
    }
    let pnp = kpnp::solve_pnp_ransac(
        &world,
        &pixels,
        &intrinsic.to_matrix(),
        &kpnp::PnPMethod::EPnPDefault,
        &config.pnp,
    )?;
    match &pnp.pose {
        Some(pose) if pnp.success => {
            println!(
                "RANSAC PnP: {}/{} inliers, rmse {:.3} px, translation error {:.2e}",
                pnp.inliers.len(),
                world.len(),
                pose.reproj_rmse.unwrap_or(f64::NAN),
                (pnp.transformation.w_axis - camera.w_axis).length()
            );
        }
        _ => println!("RANSAC PnP failed: {:?}", pnp.failure),
    }

    Ok(())
}
